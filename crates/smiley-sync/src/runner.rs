use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use smiley_core::ApplyCounts;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::pipeline::{PipelineError, Stage, SyncPipeline, SyncRunSummary, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub run_id: Option<Uuid>,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    /// Applied counts on success, committed-before-failure counts otherwise.
    pub counts: ApplyCounts,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: RunState,
    pub runs_started: u64,
    pub triggers_skipped: u64,
    pub last_run: Option<LastRun>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            runs_started: 0,
            triggers_skipped: 0,
            last_run: None,
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(SyncRunSummary),
    Failed(PipelineError),
    /// Another run held the guard; nothing was executed.
    Skipped,
}

/// Serializes pipeline runs. Every trigger source goes through [`JobRunner::trigger`].
pub struct JobRunner {
    pipeline: SyncPipeline,
    guard: Mutex<()>,
    status: RwLock<JobStatus>,
}

impl JobRunner {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self {
            pipeline,
            guard: Mutex::new(()),
            status: RwLock::new(JobStatus::default()),
        }
    }

    pub fn pipeline(&self) -> &SyncPipeline {
        &self.pipeline
    }

    pub fn status(&self) -> JobStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut JobStatus)) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    /// Runs the pipeline unless a run is already in progress, in which case the
    /// trigger is dropped.
    pub async fn trigger(&self, trigger: Trigger) -> RunOutcome {
        let Ok(_running) = self.guard.try_lock() else {
            warn!(%trigger, "sync run already in progress; dropping trigger");
            self.update(|s| s.triggers_skipped += 1);
            return RunOutcome::Skipped;
        };

        self.update(|s| {
            s.state = RunState::Running;
            s.runs_started += 1;
        });
        let started_at = Utc::now();
        let in_flight = InFlight {
            runner: self,
            trigger,
            started_at,
            armed: true,
        };

        let result = self.pipeline.run_once(trigger).await;
        in_flight.disarm();
        match result {
            Ok(summary) => {
                info!(
                    run_id = %summary.run_id,
                    %trigger,
                    inserted = summary.counts.inserted,
                    replaced = summary.counts.replaced,
                    deleted = summary.counts.deleted,
                    unchanged = summary.unchanged,
                    rejected = summary.rejected,
                    duplicates = summary.duplicates,
                    "sync run completed"
                );
                let last = LastRun {
                    run_id: Some(summary.run_id),
                    trigger,
                    started_at: summary.started_at,
                    finished_at: summary.finished_at,
                    succeeded: true,
                    counts: summary.counts,
                    failed_stage: None,
                    error: None,
                };
                self.update(|s| {
                    s.state = RunState::Idle;
                    s.last_run = Some(last);
                });
                RunOutcome::Completed(summary)
            }
            Err(err) => {
                self.update(|s| s.state = RunState::Failed);
                let committed = err.committed();
                error!(
                    %trigger,
                    stage = %err.stage(),
                    committed = %committed,
                    transient = err.is_transient(),
                    error = %err,
                    "sync run failed; waiting for next trigger"
                );
                let last = LastRun {
                    run_id: None,
                    trigger,
                    started_at,
                    finished_at: Utc::now(),
                    succeeded: false,
                    counts: committed,
                    failed_stage: Some(err.stage()),
                    error: Some(err.to_string()),
                };
                self.update(|s| {
                    s.state = RunState::Idle;
                    s.last_run = Some(last);
                });
                RunOutcome::Failed(err)
            }
        }
    }
}

/// Restores the status if the future driving a run is dropped mid-flight,
/// e.g. an aborted task or a disconnected API client.
struct InFlight<'a> {
    runner: &'a JobRunner,
    trigger: Trigger,
    started_at: DateTime<Utc>,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(trigger = %self.trigger, "sync run cancelled before completion");
        let last = LastRun {
            run_id: None,
            trigger: self.trigger,
            started_at: self.started_at,
            finished_at: Utc::now(),
            succeeded: false,
            counts: ApplyCounts::default(),
            failed_stage: None,
            error: Some(CANCELLED.to_string()),
        };
        self.runner.update(|s| {
            s.state = RunState::Idle;
            s.last_run = Some(last);
        });
    }
}

const CANCELLED: &str = "run cancelled before completion";
