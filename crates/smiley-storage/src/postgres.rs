use async_trait::async_trait;
use chrono::{DateTime, Utc};
use smiley_core::{ApplyCounts, CanonicalDocument, ChangeSet, Snapshot};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tracing::debug;

use crate::store::{validate_collection_name, ApplyError, DocumentStore, StoreError};

/// Rows per multi-value INSERT; keeps bind parameters well under the protocol limit.
const INSERT_CHUNK: usize = 1_000;

/// Documents kept as JSONB rows keyed by id. One change set is one transaction.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    table: String,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool, collection: &str) -> Result<Self, StoreError> {
        let table = validate_collection_name(collection)?.to_string();
        Ok(Self { pool, table })
    }

    pub async fn connect(database_url: &str, collection: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Self::new(pool, collection)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {t} (\
                id BIGINT PRIMARY KEY, \
                document JSONB NOT NULL, \
                ingested_at TIMESTAMPTZ NOT NULL)",
            t = self.table
        );
        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {t}_ingested_at_idx ON {t} (ingested_at)",
            t = self.table
        );
        sqlx::query(&create_index).execute(&self.pool).await?;
        Ok(())
    }

    async fn write_batch(&self, changes: &ChangeSet) -> Result<ApplyCounts, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut counts = ApplyCounts::default();

        if !changes.to_delete.is_empty() {
            let sql = format!("DELETE FROM {} WHERE id = ANY($1)", self.table);
            let result = sqlx::query(&sql)
                .bind(&changes.to_delete[..])
                .execute(&mut *tx)
                .await?;
            counts.deleted = result.rows_affected() as usize;
        }

        for chunk in changes.to_insert.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (id, document, ingested_at) ",
                self.table
            ));
            builder.push_values(chunk, |mut row, doc| {
                row.push_bind(doc.id)
                    .push_bind(Json(doc))
                    .push_bind(doc.ingested_at);
            });
            let result = builder.build().execute(&mut *tx).await?;
            counts.inserted += result.rows_affected() as usize;
        }

        let update = format!(
            "UPDATE {} SET document = $2, ingested_at = $3 WHERE id = $1",
            self.table
        );
        for doc in &changes.to_replace {
            let result = sqlx::query(&update)
                .bind(doc.id)
                .bind(Json(doc))
                .bind(doc.ingested_at)
                .execute(&mut *tx)
                .await?;
            counts.replaced += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(counts)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn collection(&self) -> &str {
        &self.table
    }

    async fn read_all(&self) -> Result<Snapshot, StoreError> {
        let sql = format!("SELECT document FROM {}", self.table);
        let rows: Vec<(Json<CanonicalDocument>,)> =
            sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        debug!(table = %self.table, rows = rows.len(), "read stored snapshot");
        Ok(rows.into_iter().map(|(Json(doc),)| doc).collect())
    }

    async fn apply_batch(&self, changes: &ChangeSet) -> Result<ApplyCounts, ApplyError> {
        // Rolled back as a whole on any error, so nothing is committed on failure.
        self.write_batch(changes)
            .await
            .map_err(ApplyError::nothing_committed)
    }

    async fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<CanonicalDocument>, StoreError> {
        let sql = format!(
            "SELECT document FROM {} WHERE ingested_at >= $1 ORDER BY id",
            self.table
        );
        let rows: Vec<(Json<CanonicalDocument>,)> = sqlx::query_as(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(Json(doc),)| doc).collect())
    }
}
