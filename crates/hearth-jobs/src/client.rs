//! Typed enqueue and inspection API.

use std::sync::Arc;

use sqlx::{Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use hearth_core::{
    Error, InsertOpts, Job, JobArgs, JobRepository, JobState, NewJob, QueueStats, Result,
};
use hearth_db::PgJobRepository;

/// Enqueues jobs and inspects the store on behalf of business code.
#[derive(Clone)]
pub struct JobClient {
    repo: Arc<dyn JobRepository>,
    pg: Option<PgJobRepository>,
}

impl JobClient {
    /// Client backed by PostgreSQL; supports [`JobClient::insert_tx`].
    pub fn postgres(repo: PgJobRepository) -> Self {
        Self {
            repo: Arc::new(repo.clone()),
            pg: Some(repo),
        }
    }

    /// Client over any repository. `insert_tx` is unavailable.
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self { repo, pg: None }
    }

    pub fn repository(&self) -> Arc<dyn JobRepository> {
        self.repo.clone()
    }

    /// Enqueue a job outside any caller transaction.
    pub async fn insert<A: JobArgs>(&self, args: &A, opts: InsertOpts) -> Result<Job> {
        let job = self.repo.insert(NewJob::from_args(args, opts)?).await?;
        debug!(
            subsystem = "jobs",
            op = "insert",
            job_id = %job.id,
            job_kind = %job.kind,
            queue = %job.queue,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Enqueue a job inside the caller's transaction.
    ///
    /// The job becomes visible to workers only when `tx` commits and vanishes
    /// with it on rollback.
    pub async fn insert_tx<A: JobArgs>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        args: &A,
        opts: InsertOpts,
    ) -> Result<Job> {
        let pg = self.pg.as_ref().ok_or_else(|| {
            Error::Config("transactional enqueue requires the PostgreSQL job store".into())
        })?;
        let job = pg.insert_tx(tx, NewJob::from_args(args, opts)?).await?;
        debug!(
            subsystem = "jobs",
            op = "insert_tx",
            job_id = %job.id,
            job_kind = %job.kind,
            queue = %job.queue,
            "Job enqueued in caller transaction"
        );
        Ok(job)
    }

    /// Cancel an `available` or `retryable` job. Returns false otherwise.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        self.repo.cancel(job_id).await
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.repo.get(job_id).await
    }

    /// Jobs in `state`, most recent first. `Discarded` lists the dead letters.
    pub async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>> {
        self.repo.list_by_state(state, limit).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.repo.queue_stats().await
    }
}
