use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use smiley_core::{ApplyCounts, CanonicalDocument, ChangeSet, DocumentId, Snapshot};
use tokio::sync::RwLock;

use crate::store::{ApplyError, DocumentStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<DocumentId, CanonicalDocument>,
    /// Operations the next batch may commit before failing.
    fail_after: Option<usize>,
}

/// In-process store. Operations commit one at a time, so a failing batch
/// leaves whatever preceded the failure in place.
#[derive(Debug)]
pub struct MemoryDocumentStore {
    collection: String,
    state: RwLock<MemoryState>,
    reads: AtomicUsize,
    batches: AtomicUsize,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new("documents")
    }
}

impl MemoryDocumentStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            state: RwLock::new(MemoryState::default()),
            reads: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        }
    }

    pub fn with_documents(documents: impl IntoIterator<Item = CanonicalDocument>) -> Self {
        let state = MemoryState {
            documents: documents.into_iter().map(|d| (d.id, d)).collect(),
            fail_after: None,
        };
        Self {
            state: RwLock::new(state),
            ..Self::default()
        }
    }

    /// Makes the next batch fail once `operations` writes have committed.
    pub async fn fail_next_batch_after(&self, operations: usize) {
        self.state.write().await.fail_after = Some(operations);
    }

    pub async fn documents(&self) -> Vec<CanonicalDocument> {
        self.state.read().await.documents.values().cloned().collect()
    }

    /// Writes a document directly, bypassing change sets.
    pub async fn put(&self, doc: CanonicalDocument) {
        self.state.write().await.documents.insert(doc.id, doc);
    }

    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn read_all(&self) -> Result<Snapshot, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().await;
        Ok(state.documents.values().cloned().collect())
    }

    async fn apply_batch(&self, changes: &ChangeSet) -> Result<ApplyCounts, ApplyError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        let mut budget = state.fail_after.take();
        let mut counts = ApplyCounts::default();

        let mut step = |counts: &ApplyCounts| -> Result<(), ApplyError> {
            match budget.as_mut() {
                Some(0) => Err(ApplyError {
                    committed: *counts,
                    source: StoreError::Unavailable("injected batch failure".into()),
                }),
                Some(left) => {
                    *left -= 1;
                    Ok(())
                }
                None => Ok(()),
            }
        };

        for id in &changes.to_delete {
            step(&counts)?;
            if state.documents.remove(id).is_some() {
                counts.deleted += 1;
            }
        }

        for doc in &changes.to_insert {
            step(&counts)?;
            if state.documents.contains_key(&doc.id) {
                return Err(ApplyError {
                    committed: counts,
                    source: StoreError::Conflict { id: doc.id },
                });
            }
            state.documents.insert(doc.id, doc.clone());
            counts.inserted += 1;
        }

        for doc in &changes.to_replace {
            step(&counts)?;
            if let Some(slot) = state.documents.get_mut(&doc.id) {
                *slot = doc.clone();
                counts.replaced += 1;
            }
        }

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use smiley_core::reconcile;

    fn doc(id: DocumentId, name: &str) -> CanonicalDocument {
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).single().unwrap();
        let mut doc = CanonicalDocument::bare(id, at);
        doc.name = Some(name.to_string());
        doc
    }

    #[tokio::test]
    async fn applying_a_change_set_converges_on_the_new_snapshot() {
        let store = MemoryDocumentStore::with_documents([doc(1, "a"), doc(2, "b")]);
        let new: Snapshot = [doc(1, "a2"), doc(3, "c")].into_iter().collect();

        let old = store.read_all().await.unwrap();
        let changes = reconcile(&old, &new);
        let counts = store.apply_batch(&changes).await.unwrap();

        assert_eq!(counts, changes.planned_counts());
        assert_eq!(store.read_all().await.unwrap(), new);
        assert_eq!(store.batch_calls(), 1);
    }

    #[tokio::test]
    async fn injected_failure_reports_partial_commit() {
        let store = MemoryDocumentStore::with_documents([doc(1, "a"), doc(2, "b")]);
        let new: Snapshot = [doc(3, "c"), doc(4, "d")].into_iter().collect();
        let changes = reconcile(&store.read_all().await.unwrap(), &new);

        store.fail_next_batch_after(3).await;
        let err = store.apply_batch(&changes).await.unwrap_err();
        assert!(err.is_partial());
        assert_eq!(
            err.committed,
            ApplyCounts {
                inserted: 1,
                replaced: 0,
                deleted: 2,
            }
        );
        assert_eq!(store.documents().await.len(), 1);

        // Failure injection is one-shot.
        let changes = reconcile(&store.read_all().await.unwrap(), &new);
        assert!(store.apply_batch(&changes).await.is_ok());
        assert_eq!(store.read_all().await.unwrap(), new);
    }

    #[tokio::test]
    async fn insert_over_existing_id_conflicts() {
        let store = MemoryDocumentStore::with_documents([doc(1, "a")]);
        let changes = ChangeSet {
            to_insert: vec![doc(1, "dup")],
            ..ChangeSet::default()
        };
        let err = store.apply_batch(&changes).await.unwrap_err();
        assert!(matches!(err.source, StoreError::Conflict { id: 1 }));
        assert!(!err.is_partial());
    }

    #[tokio::test]
    async fn replace_of_missing_document_is_not_counted() {
        let store = MemoryDocumentStore::default();
        let changes = ChangeSet {
            to_replace: vec![doc(9, "ghost")],
            ..ChangeSet::default()
        };
        let counts = store.apply_batch(&changes).await.unwrap();
        assert_eq!(counts.replaced, 0);
        assert!(store.documents().await.is_empty());
    }

    #[tokio::test]
    async fn read_since_filters_by_ingestion_time() {
        let store = MemoryDocumentStore::default();
        let mut fresh = doc(2, "b");
        fresh.ingested_at = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap();
        store.put(doc(1, "a")).await;
        store.put(fresh).await;

        let since = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).single().unwrap();
        let docs = store.read_since(since).await.unwrap();
        assert_eq!(docs.iter().map(|d| d.id).collect::<Vec<_>>(), vec![2]);
    }
}
