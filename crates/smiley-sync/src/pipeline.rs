use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use smiley_core::{reconcile, ApplyCounts, ChangeSet, DocumentId, Snapshot};
use smiley_feed::{decode_feed, FieldMapping, Normalizer, ParseError};
use smiley_storage::{
    ApplyError, DocumentStore, FeedFetcher, FeedSource, FetchError, HttpClientConfig, StoreError,
};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SmileyConfig;

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Startup,
    Schedule,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Startup => "startup",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        })
    }
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Parse,
    Snapshot,
    Guard,
    Apply,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Parse => "parse",
            Self::Snapshot => "snapshot",
            Self::Guard => "guard",
            Self::Apply => "apply",
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetching feed failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("parsing feed failed: {0}")]
    Parse(#[from] ParseError),
    #[error("reading stored snapshot failed: {0}")]
    Snapshot(#[from] StoreError),
    #[error("feed yielded no documents ({rejected} rejected) while {stored} are stored; refusing to delete them all")]
    EmptyFeed { stored: usize, rejected: usize },
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Fetch(_) => Stage::Fetch,
            Self::Parse(_) => Stage::Parse,
            Self::Snapshot(_) => Stage::Snapshot,
            Self::EmptyFeed { .. } => Stage::Guard,
            Self::Apply(_) => Stage::Apply,
        }
    }

    /// Failures the next scheduled run may well not hit again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch(err) => err.is_transient(),
            Self::Snapshot(_) | Self::Apply(_) => true,
            Self::Parse(_) | Self::EmptyFeed { .. } => false,
        }
    }

    /// Writes that reached the store before the failure.
    pub fn committed(&self) -> ApplyCounts {
        match self {
            Self::Apply(err) => err.committed,
            _ => ApplyCounts::default(),
        }
    }
}

/// Outcome of one successful run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_origin: String,
    pub payload_sha256: String,
    pub records_seen: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub stored_before: usize,
    pub unchanged: usize,
    pub counts: ApplyCounts,
}

/// Dry-run result: the change set a run would apply right now.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub feed_origin: String,
    pub payload_sha256: String,
    pub records_seen: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub stored: usize,
    pub unchanged: usize,
    pub planned: ApplyCounts,
    pub insert_ids: Vec<DocumentId>,
    pub replace_ids: Vec<DocumentId>,
    pub delete_ids: Vec<DocumentId>,
}

/// Everything up to and including reconciliation.
#[derive(Debug)]
struct Prepared {
    feed_origin: String,
    payload_sha256: String,
    records_seen: usize,
    rejected: usize,
    duplicates: usize,
    stored: usize,
    changes: ChangeSet,
}

/// Submits the change set as one batch. An empty change set never reaches the store.
pub async fn apply_change_set(
    store: &dyn DocumentStore,
    changes: &ChangeSet,
) -> Result<ApplyCounts, ApplyError> {
    if changes.is_empty() {
        debug!("change set is empty; skipping batch write");
        return Ok(ApplyCounts::default());
    }
    store.apply_batch(changes).await
}

pub struct SyncPipeline {
    source: FeedSource,
    fetcher: FeedFetcher,
    mapping: FieldMapping,
    store: Arc<dyn DocumentStore>,
    allow_empty_feed: bool,
}

impl SyncPipeline {
    pub fn new(config: &SmileyConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let fetcher = FeedFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self::from_parts(
            config.feed_source.clone(),
            fetcher,
            config.mapping.clone(),
            store,
        )
        .allow_empty_feed(config.allow_empty_feed))
    }

    pub fn from_parts(
        source: FeedSource,
        fetcher: FeedFetcher,
        mapping: FieldMapping,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            source,
            fetcher,
            mapping,
            store,
            allow_empty_feed: false,
        }
    }

    pub fn allow_empty_feed(mut self, allow: bool) -> Self {
        self.allow_empty_feed = allow;
        self
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Fetch, decode, read the stored snapshot, reconcile and apply.
    pub async fn run_once(&self, trigger: Trigger) -> Result<SyncRunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %trigger, collection = self.store.collection());
        async move {
            let started_at = Utc::now();
            let prepared = self.prepare(started_at).await?;
            let counts = apply_change_set(self.store.as_ref(), &prepared.changes).await?;
            if counts != prepared.changes.planned_counts() {
                warn!(
                    planned = %prepared.changes.planned_counts(),
                    applied = %counts,
                    "store reported different counts than planned"
                );
            }

            Ok(SyncRunSummary {
                run_id,
                trigger,
                started_at,
                finished_at: Utc::now(),
                feed_origin: prepared.feed_origin,
                payload_sha256: prepared.payload_sha256,
                records_seen: prepared.records_seen,
                rejected: prepared.rejected,
                duplicates: prepared.duplicates,
                stored_before: prepared.stored,
                unchanged: prepared.changes.unchanged.len(),
                counts,
            })
        }
        .instrument(span)
        .await
    }

    /// Computes the change set without writing anything.
    pub async fn plan(&self) -> Result<PlanSummary, PipelineError> {
        let prepared = self
            .prepare(Utc::now())
            .instrument(info_span!("sync_plan", collection = self.store.collection()))
            .await?;
        let changes = &prepared.changes;
        Ok(PlanSummary {
            planned: changes.planned_counts(),
            unchanged: changes.unchanged.len(),
            insert_ids: changes.insert_ids(),
            replace_ids: changes.replace_ids(),
            delete_ids: changes.to_delete.clone(),
            feed_origin: prepared.feed_origin,
            payload_sha256: prepared.payload_sha256,
            records_seen: prepared.records_seen,
            rejected: prepared.rejected,
            duplicates: prepared.duplicates,
            stored: prepared.stored,
        })
    }

    async fn prepare(&self, ingested_at: DateTime<Utc>) -> Result<Prepared, PipelineError> {
        let incoming = async {
            let feed = self.fetcher.fetch(&self.source).await?;
            debug!(origin = %feed.origin, bytes = feed.byte_size(), sha256 = %feed.sha256, "fetched feed");
            let normalizer = Normalizer::new(self.mapping.clone(), ingested_at);
            let decoded = decode_feed(&feed.text, &normalizer)?;
            Ok::<_, PipelineError>((feed.origin, feed.sha256, decoded))
        };
        let stored = async { Ok::<_, PipelineError>(self.store.read_all().await?) };

        let ((feed_origin, payload_sha256, decoded), old) = tokio::try_join!(incoming, stored)?;

        let records_seen = decoded.records_seen;
        let rejected = decoded.rejected.len();
        let (new, duplicates) = Snapshot::from_documents(decoded.documents);
        if duplicates > 0 {
            warn!(duplicates, "feed repeats document ids; later records win");
        }
        info!(
            records_seen,
            accepted = new.len(),
            rejected,
            stored = old.len(),
            "decoded feed"
        );

        if new.is_empty() && !old.is_empty() && !self.allow_empty_feed {
            return Err(PipelineError::EmptyFeed {
                stored: old.len(),
                rejected,
            });
        }

        let changes = reconcile(&old, &new);
        debug!(
            operations = changes.operation_count(),
            insert = changes.to_insert.len(),
            replace = changes.to_replace.len(),
            delete = changes.to_delete.len(),
            unchanged = changes.unchanged.len(),
            "reconciled snapshots"
        );

        Ok(Prepared {
            feed_origin,
            payload_sha256,
            records_seen,
            rejected,
            duplicates,
            stored: old.len(),
            changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smiley_storage::MemoryDocumentStore;
    use std::path::Path;

    const FEED_V1: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<document>
  <row>
    <navnelbnr>101</navnelbnr><navn1>Bageriet</navn1><postnr>8000</postnr><By>Aarhus C</By>
    <Elite_Smiley>1</Elite_Smiley>
    <seneste_kontrol>1</seneste_kontrol><seneste_kontrol_dato>15-03-2021</seneste_kontrol_dato>
  </row>
  <row>
    <navnelbnr>102</navnelbnr><navn1>Pizzeria</navn1>
    <seneste_kontrol>2</seneste_kontrol><seneste_kontrol_dato>01-02-2021</seneste_kontrol_dato>
  </row>
  <row>
    <navnelbnr>103</navnelbnr><navn1>Kiosken</navn1>
  </row>
</document>"#;

    const FEED_V2: &str = r#"<document>
  <row>
    <navnelbnr>101</navnelbnr><navn1>Bageriet</navn1><postnr>8000</postnr><By>Aarhus C</By>
    <Elite_Smiley>1</Elite_Smiley>
    <seneste_kontrol>1</seneste_kontrol><seneste_kontrol_dato>15-03-2021</seneste_kontrol_dato>
  </row>
  <row>
    <navnelbnr>102</navnelbnr><navn1>Pizzeria</navn1>
    <seneste_kontrol>3</seneste_kontrol><seneste_kontrol_dato>10-06-2021</seneste_kontrol_dato>
    <naestseneste_kontrol>2</naestseneste_kontrol><naestseneste_kontrol_dato>01-02-2021</naestseneste_kontrol_dato>
  </row>
  <row>
    <navnelbnr>104</navnelbnr><navn1>Grillbaren</navn1>
  </row>
  <row>
    <navnelbnr>abc</navnelbnr><navn1>Broken</navn1>
  </row>
</document>"#;

    fn write_feed(dir: &Path, body: &str) -> FeedSource {
        let path = dir.join("smiley_xml.xml");
        std::fs::write(&path, body).unwrap();
        FeedSource::Path(path)
    }

    fn pipeline(source: FeedSource, store: Arc<MemoryDocumentStore>) -> SyncPipeline {
        let fetcher = FeedFetcher::new(HttpClientConfig::default()).unwrap();
        SyncPipeline::from_parts(source, fetcher, FieldMapping::default(), store)
    }

    #[tokio::test]
    async fn second_run_over_unchanged_feed_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::default());
        let pipeline = pipeline(write_feed(dir.path(), FEED_V1), store.clone());

        let first = pipeline.run_once(Trigger::Startup).await.unwrap();
        assert_eq!(first.counts.inserted, 3);
        assert_eq!(first.records_seen, 3);
        assert_eq!(store.batch_calls(), 1);

        let second = pipeline.run_once(Trigger::Schedule).await.unwrap();
        assert_eq!(second.counts, ApplyCounts::default());
        assert_eq!(second.unchanged, 3);
        assert_eq!(second.payload_sha256, first.payload_sha256);
        assert_eq!(store.batch_calls(), 1, "empty change set must not reach the store");
    }

    #[tokio::test]
    async fn changed_feed_inserts_replaces_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::default());
        let pipeline = pipeline(write_feed(dir.path(), FEED_V1), store.clone());
        pipeline.run_once(Trigger::Startup).await.unwrap();
        let before = store.documents().await;

        write_feed(dir.path(), FEED_V2);
        let summary = pipeline.run_once(Trigger::Manual).await.unwrap();
        assert_eq!(
            summary.counts,
            ApplyCounts {
                inserted: 1,
                replaced: 1,
                deleted: 1,
            }
        );
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.stored_before, 3);

        let after = store.read_all().await.unwrap();
        let ids: Vec<_> = after.ids().collect();
        assert_eq!(ids, vec![101, 102, 104]);
        // Unchanged documents keep their original ingestion timestamp.
        assert_eq!(after.get(101).unwrap().ingested_at, before[0].ingested_at);
        assert_eq!(after.get(102).unwrap().inspections[0].result, Some(3));
    }

    #[tokio::test]
    async fn plan_reports_changes_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::default());
        let pipeline = pipeline(write_feed(dir.path(), FEED_V1), store.clone());

        let plan = pipeline.plan().await.unwrap();
        assert_eq!(plan.planned.inserted, 3);
        assert_eq!(plan.insert_ids, vec![101, 102, 103]);
        assert!(store.documents().await.is_empty());
        assert_eq!(store.batch_calls(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::default());
        let pipeline = pipeline(
            FeedSource::Path(dir.path().join("missing.xml")),
            store.clone(),
        );

        let err = pipeline.run_once(Trigger::Schedule).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Fetch);
        assert_eq!(store.batch_calls(), 0);
    }

    #[tokio::test]
    async fn malformed_feed_aborts_in_parse_stage() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::default());
        let pipeline = pipeline(
            write_feed(dir.path(), "<document><row><navnelbnr>1</navnelbnr>"),
            store.clone(),
        );

        let err = pipeline.run_once(Trigger::Schedule).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Parse);
        assert_eq!(store.batch_calls(), 0);
    }

    #[tokio::test]
    async fn empty_feed_is_refused_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::default());
        let source = write_feed(dir.path(), FEED_V1);
        pipeline(source.clone(), store.clone())
            .run_once(Trigger::Startup)
            .await
            .unwrap();

        write_feed(dir.path(), "<document></document>");
        let err = pipeline(source.clone(), store.clone())
            .run_once(Trigger::Schedule)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyFeed { stored: 3, .. }));
        assert_eq!(err.stage(), Stage::Guard);
        assert_eq!(store.documents().await.len(), 3);

        let summary = pipeline(source, store.clone())
            .allow_empty_feed(true)
            .run_once(Trigger::Manual)
            .await
            .unwrap();
        assert_eq!(summary.counts.deleted, 3);
        assert!(store.documents().await.is_empty());
    }

    #[tokio::test]
    async fn apply_failure_surfaces_partial_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::default());
        let pipeline = pipeline(write_feed(dir.path(), FEED_V1), store.clone());

        store.fail_next_batch_after(2).await;
        let err = pipeline.run_once(Trigger::Schedule).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Apply);
        assert_eq!(err.committed().inserted, 2);
        assert_eq!(store.documents().await.len(), 2);

        // The next run converges from whatever was committed.
        let summary = pipeline.run_once(Trigger::Schedule).await.unwrap();
        assert_eq!(summary.counts.inserted, 1);
        assert_eq!(summary.unchanged, 2);
    }
}
