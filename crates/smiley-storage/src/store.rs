use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smiley_core::{ApplyCounts, CanonicalDocument, ChangeSet, DocumentId, Snapshot};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid collection name {0:?}")]
    InvalidCollection(String),
    #[error("document {id} already exists")]
    Conflict { id: DocumentId },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failed batch write. `committed` holds what the store had already made durable.
#[derive(Debug, Error)]
#[error("batch write failed after committing {committed}: {source}")]
pub struct ApplyError {
    pub committed: ApplyCounts,
    #[source]
    pub source: StoreError,
}

impl ApplyError {
    pub fn nothing_committed(source: impl Into<StoreError>) -> Self {
        Self {
            committed: ApplyCounts::default(),
            source: source.into(),
        }
    }

    /// True when some writes landed before the failure.
    pub fn is_partial(&self) -> bool {
        self.committed.total() > 0
    }
}

/// Durable home of the canonical documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Collection (table) the store reads and writes.
    fn collection(&self) -> &str;

    /// Every persisted document, unfiltered.
    async fn read_all(&self) -> Result<Snapshot, StoreError>;

    /// Executes deletes, inserts and replaces as one batch request.
    async fn apply_batch(&self, changes: &ChangeSet) -> Result<ApplyCounts, ApplyError>;

    /// Documents ingested at or after `since`, ordered by id.
    async fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<CanonicalDocument>, StoreError> {
        Ok(self
            .read_all()
            .await?
            .into_documents()
            .into_iter()
            .filter(|doc| doc.ingested_at >= since)
            .collect())
    }
}

/// Accepts names usable as an unquoted SQL identifier.
pub fn validate_collection_name(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_start && valid_rest && name.len() <= 63 {
        Ok(name)
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names() {
        assert!(validate_collection_name("documents").is_ok());
        assert!(validate_collection_name("_organizations_v2").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("2docs").is_err());
        assert!(validate_collection_name("docs; drop table x").is_err());
        assert!(validate_collection_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn partial_flag_follows_counts() {
        let none = ApplyError::nothing_committed(StoreError::Unavailable("down".into()));
        assert!(!none.is_partial());
        let some = ApplyError {
            committed: ApplyCounts {
                inserted: 0,
                replaced: 0,
                deleted: 2,
            },
            source: StoreError::Unavailable("down".into()),
        };
        assert!(some.is_partial());
        assert!(some.to_string().contains("deleted=2"));
    }
}
