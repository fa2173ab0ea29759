use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use smiley_storage::PgDocumentStore;
use smiley_sync::{SmileyConfig, StoreBackend, SyncPipeline, SyncScheduler};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "smiley-cli")]
#[command(about = "Food-safety smiley feed sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and exit.
    Sync,
    /// Print the change set a sync would apply, without writing.
    Plan,
    /// Create the document table.
    Migrate,
    /// Run the scheduler and the JSON API until ctrl-c.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync => {
            let summary = smiley_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} records={} rejected={} duplicates={} unchanged={} {}",
                summary.run_id,
                summary.records_seen,
                summary.rejected,
                summary.duplicates,
                summary.unchanged,
                summary.counts
            );
        }
        Commands::Plan => {
            let config = SmileyConfig::from_env()?;
            let store = smiley_sync::open_store(&config).await?;
            let plan = SyncPipeline::new(&config, store)?
                .plan()
                .await
                .context("planning sync")?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Commands::Migrate => {
            let config = SmileyConfig::from_env()?;
            if config.store_backend == StoreBackend::Memory {
                println!("SMILEY_STORE=memory; nothing to migrate");
                return Ok(());
            }
            let store = PgDocumentStore::connect(&config.database_url, &config.collection)
                .await
                .context("connecting to DATABASE_URL")?;
            store.ensure_schema().await.context("creating document table")?;
            println!("table {} ready", config.collection);
        }
        Commands::Serve => {
            let config = SmileyConfig::from_env()?;
            let runner = smiley_sync::runner_from_config(&config).await?;
            let scheduler = SyncScheduler::start(runner.clone(), &config.schedule).await?;
            info!(port = config.web_port, "starting smiley service");
            let served = smiley_web::serve(smiley_web::AppState::new(runner), config.web_port).await;
            scheduler.shutdown().await?;
            served?;
        }
    }

    Ok(())
}
