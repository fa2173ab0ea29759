use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::ScheduleConfig;
use crate::pipeline::Trigger;
use crate::runner::JobRunner;

/// Weekly recurrence plus the optional startup run, both feeding one [`JobRunner`].
pub struct SyncScheduler {
    cron: Option<JobScheduler>,
    startup: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    pub async fn start(runner: Arc<JobRunner>, schedule: &ScheduleConfig) -> Result<Self> {
        let cron = if schedule.enabled {
            let expression = schedule.cron_expression();
            let sched = JobScheduler::new().await.context("creating scheduler")?;
            let job_runner = Arc::clone(&runner);
            let job = Job::new_async(expression.as_str(), move |_uuid, _l| {
                let runner = Arc::clone(&job_runner);
                Box::pin(async move {
                    runner.trigger(Trigger::Schedule).await;
                })
            })
            .with_context(|| format!("creating scheduler job for cron {expression}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %expression, "weekly sync scheduled (UTC)");
            Some(sched)
        } else {
            info!("scheduler disabled");
            None
        };

        let startup = schedule.run_on_startup.then(|| {
            tokio::spawn(async move {
                runner.trigger(Trigger::Startup).await;
            })
        });

        Ok(Self { cron, startup })
    }

    pub fn is_scheduled(&self) -> bool {
        self.cron.is_some()
    }

    /// Stops the recurrence and waits for a startup run that is still in flight.
    pub async fn shutdown(self) -> Result<()> {
        if let Some(mut sched) = self.cron {
            sched.shutdown().await.context("stopping scheduler")?;
        }
        if let Some(startup) = self.startup {
            startup.await.context("joining startup run")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SyncPipeline;
    use crate::runner::RunState;
    use chrono::Weekday;
    use smiley_feed::FieldMapping;
    use smiley_storage::{FeedFetcher, FeedSource, HttpClientConfig, MemoryDocumentStore};

    fn runner(source: FeedSource, store: Arc<MemoryDocumentStore>) -> Arc<JobRunner> {
        let fetcher = FeedFetcher::new(HttpClientConfig::default()).unwrap();
        Arc::new(JobRunner::new(SyncPipeline::from_parts(
            source,
            fetcher,
            FieldMapping::default(),
            store,
        )))
    }

    #[test]
    fn cron_expression_fires_weekly() {
        let schedule = ScheduleConfig {
            weekday: Weekday::Wed,
            hour: 4,
            minute: 15,
            ..ScheduleConfig::default()
        };
        assert_eq!(schedule.cron_expression(), "0 15 4 * * Wed");
        assert_eq!(ScheduleConfig::default().cron_expression(), "0 0 0 * * Mon");
    }

    #[tokio::test]
    async fn startup_run_executes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.xml");
        std::fs::write(
            &path,
            "<document><row><navnelbnr>5</navnelbnr></row></document>",
        )
        .unwrap();
        let store = Arc::new(MemoryDocumentStore::default());
        let runner = runner(FeedSource::Path(path), store.clone());

        let schedule = ScheduleConfig {
            enabled: false,
            ..ScheduleConfig::default()
        };
        let scheduler = SyncScheduler::start(Arc::clone(&runner), &schedule)
            .await
            .unwrap();
        assert!(!scheduler.is_scheduled());
        scheduler.shutdown().await.unwrap();

        assert_eq!(store.documents().await.len(), 1);
        let status = runner.status();
        assert_eq!(status.state, RunState::Idle);
        assert_eq!(status.runs_started, 1);
    }

    #[tokio::test]
    async fn nothing_runs_when_both_triggers_are_off() {
        let store = Arc::new(MemoryDocumentStore::default());
        let runner = runner(FeedSource::Path("unused.xml".into()), store.clone());
        let schedule = ScheduleConfig {
            enabled: false,
            run_on_startup: false,
            ..ScheduleConfig::default()
        };
        SyncScheduler::start(Arc::clone(&runner), &schedule)
            .await
            .unwrap()
            .shutdown()
            .await
            .unwrap();
        assert_eq!(runner.status().runs_started, 0);
        assert_eq!(store.read_calls(), 0);
    }
}
