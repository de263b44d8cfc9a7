//! Job handlers and the context they run with.

use std::future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, MappedMutexGuard, Mutex, MutexGuard};
use uuid::Uuid;

use hearth_core::{Error, Job, JobArgs, JobKind, JobTransaction, Result};

/// Engine-owned transaction slot. Emptied once the engine commits or rolls back.
pub(crate) type TransactionSlot = Arc<Mutex<Option<JobTransaction>>>;

/// Context provided to job handlers.
pub struct JobContext {
    /// The claimed job. `attempt` already counts this execution.
    pub job: Job,
    shutdown: watch::Receiver<bool>,
    tx: Option<TransactionSlot>,
}

impl JobContext {
    /// Create a context that is never cancelled.
    pub fn new(job: Job) -> Self {
        let (_, shutdown) = watch::channel(false);
        Self {
            job,
            shutdown,
            tx: None,
        }
    }

    /// Bind the context to the engine's shutdown signal.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub(crate) fn with_transaction(mut self, slot: TransactionSlot) -> Self {
        self.tx = Some(slot);
        self
    }

    /// The transaction this execution runs in.
    ///
    /// Writes made through it commit together with the job's completion and
    /// are rolled back if the handler does not succeed. Only available for
    /// [`TransactionScope::Job`] handlers on a store that supports
    /// transactions; fails with [`Error::Job`] otherwise.
    ///
    /// ```ignore
    /// let mut tx = ctx.transaction().await?;
    /// sqlx::query("UPDATE report SET sent = true WHERE id = $1")
    ///     .bind(report_id)
    ///     .execute(&mut **tx)
    ///     .await?;
    /// ```
    pub async fn transaction(&self) -> Result<MappedMutexGuard<'_, JobTransaction>> {
        let slot = self.tx.as_ref().ok_or_else(|| {
            Error::Job(format!("job {} runs without an engine transaction", self.job.id))
        })?;
        MutexGuard::try_map(slot.lock().await, |tx| tx.as_mut()).map_err(|_| {
            Error::Job(format!("transaction for job {} already finished", self.job.id))
        })
    }

    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn attempt(&self) -> i32 {
        self.job.attempt
    }

    /// Decode the payload as `A`.
    ///
    /// Fails with [`Error::InvalidInput`] when the job is of another kind, so a
    /// handler wired to the wrong kind discards instead of panicking.
    pub fn args<A: JobArgs>(&self) -> Result<A> {
        if self.job.kind != A::KIND.as_str() {
            return Err(Error::InvalidInput(format!(
                "job {} has kind {}, expected {}",
                self.job.id,
                self.job.kind,
                A::KIND
            )));
        }
        self.job.args()
    }

    /// Whether the engine has asked in-flight jobs to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the engine asks in-flight jobs to stop.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            if shutdown.changed().await.is_err() {
                // Sender gone without a stop request: never cancelled.
                future::pending::<()>().await;
            }
        }
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Job completed successfully with optional result data.
    Success(Option<JsonValue>),
    /// Transient failure; the retry policy decides between retry and discard.
    Retry(String),
    /// Permanent failure; the job is discarded without further attempts.
    Discard(String),
    /// The handler stopped early because the context was cancelled. During
    /// shutdown the job is released without spending the attempt; otherwise
    /// it is treated as [`JobResult::Retry`].
    Cancelled(String),
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }
}

impl From<Error> for JobResult {
    fn from(err: Error) -> Self {
        if err.is_permanent() {
            JobResult::Discard(err.to_string())
        } else {
            JobResult::Retry(err.to_string())
        }
    }
}

/// Who owns the database transaction around a handler's writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionScope {
    /// The engine opens a transaction per execution, exposed through
    /// [`JobContext::transaction`]. It commits atomically with the job's
    /// completion and rolls back on every other outcome.
    #[default]
    Job,
    /// No engine transaction; the handler commits its own writes. For
    /// handlers that wait on external services or commit in pieces.
    Handler,
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job kind this handler processes.
    fn kind(&self) -> JobKind;

    fn transaction_scope(&self) -> TransactionScope {
        TransactionScope::Job
    }

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// No-op handler for testing.
pub struct NoOpHandler {
    kind: JobKind,
}

impl NoOpHandler {
    pub fn new(kind: JobKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn kind(&self) -> JobKind {
        self.kind
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Success(None)
    }
}
