//! Core traits for hearth abstractions.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;

// =============================================================================
// JOB REPOSITORY
// =============================================================================

/// Transaction a handler's writes share with the completion of its job.
pub type JobTransaction = sqlx::Transaction<'static, sqlx::Postgres>;

/// Durable storage for jobs.
///
/// Implementations must make `claim` safe against concurrent callers: a job
/// returned by one `claim` is never returned by another until it is released
/// or retried.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a job outside any caller transaction; visible once this returns.
    async fn insert(&self, job: NewJob) -> Result<Job>;

    /// Atomically move up to `limit` due `available` jobs of `queue` to
    /// `running`, ordered by `scheduled_at` then insertion order, incrementing
    /// `attempt`.
    async fn claim(&self, queue: &str, limit: i64, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Move `retryable` jobs whose `scheduled_at <= now` back to `available`.
    async fn promote_retryable(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Mark a running job `completed`.
    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Mark a running job `retryable`, scheduled for `scheduled_at`.
    async fn retry(&self, job_id: Uuid, error: &str, scheduled_at: DateTime<Utc>) -> Result<()>;

    /// Mark a job `discarded` (dead-letter).
    async fn discard(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Return a running job to `available` without consuming an attempt.
    async fn release(&self, job_id: Uuid) -> Result<()>;

    /// Release jobs that have been `running` since before `attempted_before`.
    async fn rescue_stale(&self, attempted_before: DateTime<Utc>) -> Result<u64>;

    /// Cancel an `available` or `retryable` job. Returns false for any other state.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List jobs in a state, most recent first.
    async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>>;

    /// Count jobs per state.
    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Handle notified whenever a job becomes visible.
    fn job_notify(&self) -> Arc<Notify>;

    /// Open the transaction a handler execution runs in. Stores without
    /// transactions return `None` and handlers run without one.
    async fn begin(&self) -> Result<Option<JobTransaction>> {
        Ok(None)
    }

    /// Mark a running job `completed` inside `tx`. The completion becomes
    /// visible together with the handler's writes when `tx` commits.
    async fn complete_tx(&self, tx: &mut JobTransaction, job_id: Uuid) -> Result<()> {
        let _ = tx;
        Err(Error::Job(format!(
            "job {job_id} cannot complete in a transaction on this store"
        )))
    }
}

// =============================================================================
// CACHE STORE
// =============================================================================

/// Durable key/value storage behind the cache layer.
///
/// `get` may return expired rows; callers decide expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, domain: &str, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or wholesale replace `value` and `expires_at`.
    async fn set(&self, entry: CacheEntry) -> Result<()>;

    async fn delete(&self, domain: &str, key: &str) -> Result<()>;

    /// Remove every entry with `expires_at <= now`. Returns rows removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

// =============================================================================
// EMBEDDING REPOSITORY
// =============================================================================

/// Storage for embedding records. Each `insert` runs in its own transaction.
#[async_trait]
pub trait EmbeddingRepository: Send + Sync {
    async fn exists(&self, document_id: Uuid) -> Result<bool>;

    /// Insert a record. Returns false if `document_id` already had one.
    async fn insert(&self, record: EmbeddingRecord) -> Result<bool>;

    async fn list_for_attachment(&self, attachment_id: Uuid) -> Result<Vec<EmbeddingRecord>>;
}

// =============================================================================
// EXTERNAL COLLABORATORS
// =============================================================================

/// Backend for generating embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed one text.
    async fn embed_text(&self, text: &str) -> Result<Vector>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Backend for text generation (LLM).
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate text given a prompt.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Generate text with system context.
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Readable content extracted from a web page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebPage {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
}

/// Fetches a URL and extracts its readable text.
#[async_trait]
pub trait WebReader: Send + Sync {
    async fn read(&self, url: &str) -> Result<WebPage>;
}

/// Outbound email message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Delivers email.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<()>;
}
