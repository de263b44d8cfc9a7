//! Data models for jobs, cache entries, and embedding records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

pub use pgvector::Vector;

/// Generate a new time-ordered UUIDv7 identifier.
///
/// Later ids compare greater, so ordering by id follows insertion order.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

// =============================================================================
// JOBS
// =============================================================================

/// Lifecycle state of a persisted job.
///
/// ```text
/// available → running → completed
///                     → retryable → available
///                     → discarded
/// available | retryable → cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Available,
    Running,
    Completed,
    Retryable,
    Discarded,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Available,
        JobState::Running,
        JobState::Completed,
        JobState::Retryable,
        JobState::Discarded,
        JobState::Cancelled,
    ];

    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Retryable => "retryable",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }

    /// No further transition is possible from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }

    /// Whether `cancel` applies to a job in this state.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobState::Available | JobState::Retryable)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(JobState::Available),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "retryable" => Ok(JobState::Retryable),
            "discarded" => Ok(JobState::Discarded),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(Error::Job(format!("invalid job state: {other}"))),
        }
    }
}

/// Closed set of job kinds this process knows how to run.
///
/// The persisted `kind` column stays a plain string so rows written by other
/// versions remain readable; parsing into this enum happens at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fetch a web page and store its readable content in the cache.
    WebCrawler,
    /// Embed a batch of text chunks for one attachment.
    CreateEmbeddings,
    /// Deliver an outbound email.
    SendEmail,
    /// Summarize content with the generation backend.
    ContentSummarizer,
    /// Delete expired cache entries.
    CacheReaper,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::WebCrawler,
        JobKind::CreateEmbeddings,
        JobKind::SendEmail,
        JobKind::ContentSummarizer,
        JobKind::CacheReaper,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::WebCrawler => "web_crawler",
            JobKind::CreateEmbeddings => "create_embeddings",
            JobKind::SendEmail => "send_email",
            JobKind::ContentSummarizer => "content_summarizer",
            JobKind::CacheReaper => "cache_reaper",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "web_crawler" => Ok(JobKind::WebCrawler),
            "create_embeddings" => Ok(JobKind::CreateEmbeddings),
            "send_email" => Ok(JobKind::SendEmail),
            "content_summarizer" => Ok(JobKind::ContentSummarizer),
            "cache_reaper" => Ok(JobKind::CacheReaper),
            other => Err(Error::UnknownJobKind(other.to_string())),
        }
    }
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Raw kind discriminator as stored.
    pub kind: String,
    pub queue: String,
    pub args: JsonValue,
    pub state: JobState,
    pub scheduled_at: DateTime<Utc>,
    /// Number of executions started so far (incremented at claim).
    pub attempt: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Parse the stored kind string.
    pub fn job_kind(&self) -> Result<JobKind> {
        self.kind.parse()
    }

    /// Decode the args payload into a typed struct.
    pub fn args<A: DeserializeOwned>(&self) -> Result<A> {
        serde_json::from_value(self.args.clone()).map_err(Error::from)
    }
}

/// Options accepted by insert operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOpts {
    /// Override the kind's default queue.
    pub queue: Option<String>,
    /// Earliest dispatch time (defaults to now).
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Override the default attempt limit.
    pub max_attempts: Option<i32>,
}

impl InsertOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Delay dispatch by `delay` from now.
    pub fn delay(self, delay: chrono::Duration) -> Self {
        self.scheduled_at(Utc::now() + delay)
    }

    pub fn max_attempts(mut self, n: i32) -> Self {
        self.max_attempts = Some(n);
        self
    }
}

/// Fully resolved insert request handed to a repository.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub queue: String,
    pub args: JsonValue,
    pub scheduled_at: DateTime<Utc>,
    pub max_attempts: i32,
}

impl NewJob {
    /// Build an insert request from typed args, applying defaults and overrides.
    pub fn from_args<A: JobArgs>(args: &A, opts: InsertOpts) -> Result<Self> {
        let kind_defaults = A::insert_opts();
        let max_attempts = opts
            .max_attempts
            .or(kind_defaults.max_attempts)
            .unwrap_or(defaults::JOB_MAX_ATTEMPTS);
        if max_attempts < 1 {
            return Err(Error::InvalidInput(format!(
                "max_attempts must be at least 1, got {max_attempts}"
            )));
        }

        Ok(Self {
            kind: A::KIND.as_str().to_string(),
            queue: opts
                .queue
                .or(kind_defaults.queue)
                .unwrap_or_else(|| defaults::JOB_DEFAULT_QUEUE.to_string()),
            args: serde_json::to_value(args)?,
            scheduled_at: opts
                .scheduled_at
                .or(kind_defaults.scheduled_at)
                .unwrap_or_else(Utc::now),
            max_attempts,
        })
    }
}

/// Typed payload for one job kind.
pub trait JobArgs: Serialize + DeserializeOwned + Send + Sync {
    /// Kind this payload belongs to.
    const KIND: JobKind;

    /// Per-kind defaults, overridden by the caller's `InsertOpts`.
    fn insert_opts() -> InsertOpts {
        InsertOpts::default()
    }
}

/// Job counts per state, for operator inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub available: i64,
    pub running: i64,
    pub completed: i64,
    pub retryable: i64,
    pub discarded: i64,
    pub cancelled: i64,
}

impl QueueStats {
    /// Add `count` to the bucket for `state`.
    pub fn record(&mut self, state: JobState, count: i64) {
        match state {
            JobState::Available => self.available += count,
            JobState::Running => self.running += count,
            JobState::Completed => self.completed += count,
            JobState::Retryable => self.retryable += count,
            JobState::Discarded => self.discarded += count,
            JobState::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.available
            + self.running
            + self.completed
            + self.retryable
            + self.discarded
            + self.cancelled
    }
}

// =============================================================================
// JOB ARGS
// =============================================================================

/// Args for [`JobKind::WebCrawler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebCrawlerArgs {
    pub url: String,
}

impl JobArgs for WebCrawlerArgs {
    const KIND: JobKind = JobKind::WebCrawler;
}

/// One text chunk to embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInput {
    /// Pre-assigned idempotency key; `None` means a fresh id is generated.
    #[serde(default)]
    pub document_id: Option<Uuid>,
    pub text: String,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl ChunkInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            document_id: None,
            text: text.into(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_document_id(mut self, id: Uuid) -> Self {
        self.document_id = Some(id);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Args for [`JobKind::CreateEmbeddings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEmbeddingsArgs {
    pub user_id: Uuid,
    pub attachment_id: Uuid,
    pub chunks: Vec<ChunkInput>,
}

impl JobArgs for CreateEmbeddingsArgs {
    const KIND: JobKind = JobKind::CreateEmbeddings;

    fn insert_opts() -> InsertOpts {
        InsertOpts::new().queue(defaults::EMBED_QUEUE)
    }
}

/// Args for [`JobKind::SendEmail`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEmailArgs {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl JobArgs for SendEmailArgs {
    const KIND: JobKind = JobKind::SendEmail;
}

/// Args for [`JobKind::ContentSummarizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSummarizerArgs {
    /// Stable identity of the content, used as the summary cache key.
    pub content_key: String,
    pub content: String,
}

impl JobArgs for ContentSummarizerArgs {
    const KIND: JobKind = JobKind::ContentSummarizer;
}

/// Args for [`JobKind::CacheReaper`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheReaperArgs {}

impl JobArgs for CacheReaperArgs {
    const KIND: JobKind = JobKind::CacheReaper;

    fn insert_opts() -> InsertOpts {
        InsertOpts::new()
            .queue(defaults::MAINTENANCE_QUEUE)
            .max_attempts(1)
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// A cached value keyed by `(domain, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub domain: String,
    pub key: String,
    pub value: JsonValue,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry past its expiry is a miss even before it is reaped.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// =============================================================================
// EMBEDDINGS
// =============================================================================

/// One embedded text chunk. Written at most once per `document_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub attachment_id: Uuid,
    pub text: String,
    pub vector: Vector,
    pub metadata: JsonValue,
}
