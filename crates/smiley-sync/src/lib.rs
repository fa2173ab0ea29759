//! Sync orchestration: configuration, the fetch/reconcile/apply pipeline and
//! the job runner that serializes its executions.

mod config;
mod pipeline;
mod runner;
mod scheduler;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use smiley_storage::{DocumentStore, MemoryDocumentStore, PgDocumentStore};
use tracing::info;

pub use config::{ScheduleConfig, SmileyConfig, StoreBackend, DEFAULT_FEED_URL};
pub use pipeline::{
    apply_change_set, PipelineError, PlanSummary, Stage, SyncPipeline, SyncRunSummary, Trigger,
};
pub use runner::{JobRunner, JobStatus, LastRun, RunOutcome, RunState};
pub use scheduler::SyncScheduler;

pub const CRATE_NAME: &str = "smiley-sync";

/// Opens the configured store. PostgreSQL tables are created when missing.
pub async fn open_store(config: &SmileyConfig) -> Result<Arc<dyn DocumentStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            info!(collection = %config.collection, "using in-memory document store");
            Ok(Arc::new(MemoryDocumentStore::new(config.collection.clone())))
        }
        StoreBackend::Postgres => {
            let store = PgDocumentStore::connect(&config.database_url, &config.collection)
                .await
                .context("connecting to DATABASE_URL")?;
            store
                .ensure_schema()
                .await
                .with_context(|| format!("preparing table {}", config.collection))?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn runner_from_config(config: &SmileyConfig) -> Result<Arc<JobRunner>> {
    let store = open_store(config).await?;
    let pipeline = SyncPipeline::new(config, store)?;
    Ok(Arc::new(JobRunner::new(pipeline)))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SmileyConfig::from_env()?;
    let runner = runner_from_config(&config).await?;
    match runner.trigger(Trigger::Manual).await {
        RunOutcome::Completed(summary) => Ok(summary),
        RunOutcome::Failed(err) => {
            let stage = err.stage();
            Err(anyhow::Error::new(err).context(format!("sync run failed in {stage} stage")))
        }
        RunOutcome::Skipped => Err(anyhow!("sync run skipped: another run is in progress")),
    }
}
