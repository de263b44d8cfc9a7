//! Embedding repository implementation.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use hearth_core::{EmbeddingRecord, EmbeddingRepository, Error, Result};

/// PostgreSQL implementation of EmbeddingRepository.
#[derive(Clone)]
pub struct PgEmbeddingRepository {
    pool: Pool<Postgres>,
}

impl PgEmbeddingRepository {
    /// Create a new PgEmbeddingRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmbeddingRepository for PgEmbeddingRepository {
    async fn exists(&self, document_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM embedding_record WHERE document_id = $1)",
        )
        .bind(document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(exists)
    }

    async fn insert(&self, record: EmbeddingRecord) -> Result<bool> {
        // One transaction per chunk so a crash mid-batch leaves whole rows only.
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let result = sqlx::query(
            "INSERT INTO embedding_record (document_id, user_id, attachment_id, text, vector, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (document_id) DO NOTHING",
        )
        .bind(record.document_id)
        .bind(record.user_id)
        .bind(record.attachment_id)
        .bind(&record.text)
        .bind(&record.vector)
        .bind(&record.metadata)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_for_attachment(&self, attachment_id: Uuid) -> Result<Vec<EmbeddingRecord>> {
        let rows = sqlx::query(
            "SELECT document_id, user_id, attachment_id, text, vector, metadata
             FROM embedding_record
             WHERE attachment_id = $1
             ORDER BY created_at, document_id",
        )
        .bind(attachment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let records = rows
            .into_iter()
            .map(|row| EmbeddingRecord {
                document_id: row.get("document_id"),
                user_id: row.get("user_id"),
                attachment_id: row.get("attachment_id"),
                text: row.get("text"),
                vector: row.get("vector"),
                metadata: row.get("metadata"),
            })
            .collect();

        Ok(records)
    }
}
