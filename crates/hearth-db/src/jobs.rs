//! Job repository implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{Pool, Postgres, Row, Transaction};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use hearth_core::defaults::JOB_NOTIFY_CHANNEL;
use hearth_core::{
    new_v7, Error, Job, JobRepository, JobState, JobTransaction, NewJob, QueueStats, Result,
};

const JOB_COLUMNS: &str = "id, kind, queue, args, state, scheduled_at, attempt, max_attempts, \
                           last_error, created_at, attempted_at, finalized_at";

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
    /// Wakes pollers in this process when a job becomes visible.
    notify: Arc<Notify>,
}

impl PgJobRepository {
    /// Create a new PgJobRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Insert a job inside the caller's transaction.
    ///
    /// The row and its `pg_notify` wake signal become visible only when `tx`
    /// commits; rolling back `tx` discards both.
    pub async fn insert_tx(&self, tx: &mut Transaction<'_, Postgres>, job: NewJob) -> Result<Job> {
        let inserted = Self::insert_on(&mut **tx, job).await?;
        Self::pg_notify(&mut **tx, &inserted.queue).await?;
        debug!(
            subsystem = "db",
            component = "jobs",
            op = "insert_tx",
            job_id = %inserted.id,
            job_kind = %inserted.kind,
            queue = %inserted.queue,
            "Job inserted in caller transaction"
        );
        Ok(inserted)
    }

    /// Forward `pg_notify` wake signals to this repository's `Notify` handle.
    ///
    /// Reconnects after listener errors; polling covers any gap.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            loop {
                match Self::listen(&pool, &notify).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(
                            subsystem = "db",
                            component = "jobs",
                            error = %e,
                            "Job notification listener failed, reconnecting"
                        );
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        })
    }

    async fn listen(pool: &Pool<Postgres>, notify: &Notify) -> Result<()> {
        let mut listener = PgListener::connect_with(pool)
            .await
            .map_err(Error::Database)?;
        listener
            .listen(JOB_NOTIFY_CHANNEL)
            .await
            .map_err(Error::Database)?;
        debug!(subsystem = "db", component = "jobs", channel = JOB_NOTIFY_CHANNEL, "Listening for job notifications");

        loop {
            let notification = listener.recv().await.map_err(Error::Database)?;
            trace!(queue = notification.payload(), "Job notification received");
            notify.notify_waiters();
        }
    }

    async fn insert_on<'e, E>(executor: E, job: NewJob) -> Result<Job>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query(&format!(
            "INSERT INTO job (id, kind, queue, args, state, scheduled_at, attempt, max_attempts, created_at)
             VALUES ($1, $2, $3, $4, 'available', $5, 0, $6, $7)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(&job.kind)
        .bind(&job.queue)
        .bind(&job.args)
        .bind(job.scheduled_at)
        .bind(job.max_attempts)
        .bind(Utc::now())
        .fetch_one(executor)
        .await
        .map_err(Error::Database)?;

        Self::parse_job_row(row)
    }

    async fn complete_on<'e, E>(executor: E, job_id: Uuid) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            "UPDATE job SET state = 'completed', finalized_at = $2
             WHERE id = $1 AND state = 'running'",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(executor)
        .await
        .map_err(Error::Database)?;
        Self::expect_transition(result.rows_affected(), job_id, JobState::Completed)
    }

    async fn pg_notify<'e, E>(executor: E, queue: &str) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(JOB_NOTIFY_CHANNEL)
            .bind(queue)
            .execute(executor)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: PgRow) -> Result<Job> {
        let state: String = row.get("state");
        Ok(Job {
            id: row.get("id"),
            kind: row.get("kind"),
            queue: row.get("queue"),
            args: row.get("args"),
            state: state.parse()?,
            scheduled_at: row.get("scheduled_at"),
            attempt: row.get("attempt"),
            max_attempts: row.get("max_attempts"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            attempted_at: row.get("attempted_at"),
            finalized_at: row.get("finalized_at"),
        })
    }

    /// Compare-and-set guard: the update must have hit a running row.
    fn expect_transition(rows: u64, job_id: Uuid, to: JobState) -> Result<()> {
        if rows == 0 {
            return Err(Error::Job(format!(
                "job {job_id} is not running, cannot move to {to}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, job: NewJob) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let inserted = Self::insert_on(&mut *tx, job).await?;
        Self::pg_notify(&mut *tx, &inserted.queue).await?;
        tx.commit().await.map_err(Error::Database)?;

        self.notify.notify_waiters();
        Ok(inserted)
    }

    async fn claim(&self, queue: &str, limit: i64, now: DateTime<Utc>) -> Result<Vec<Job>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        // SKIP LOCKED keeps concurrent pollers from claiming the same row; the
        // state predicate in the outer UPDATE is the compare-and-set.
        let rows = sqlx::query(&format!(
            "UPDATE job
             SET state = 'running', attempt = attempt + 1, attempted_at = $3
             WHERE state = 'available' AND id IN (
                 SELECT id FROM job
                 WHERE state = 'available' AND queue = $1 AND scheduled_at <= $3
                 ORDER BY scheduled_at ASC, id ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(queue)
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut jobs = rows
            .into_iter()
            .map(Self::parse_job_row)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order.
        jobs.sort_by(|a, b| (a.scheduled_at, a.id).cmp(&(b.scheduled_at, b.id)));
        Ok(jobs)
    }

    async fn promote_retryable(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE job SET state = 'available'
             WHERE state = 'retryable' AND scheduled_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        Self::complete_on(&self.pool, job_id).await
    }

    async fn retry(&self, job_id: Uuid, error: &str, scheduled_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job SET state = 'retryable', last_error = $2, scheduled_at = $3
             WHERE id = $1 AND state = 'running'",
        )
        .bind(job_id)
        .bind(error)
        .bind(scheduled_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Self::expect_transition(result.rows_affected(), job_id, JobState::Retryable)
    }

    async fn discard(&self, job_id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job SET state = 'discarded', last_error = $2, finalized_at = $3
             WHERE id = $1 AND state = 'running'",
        )
        .bind(job_id)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Self::expect_transition(result.rows_affected(), job_id, JobState::Discarded)
    }

    async fn release(&self, job_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let result = sqlx::query(
            "UPDATE job
             SET state = 'available', attempt = GREATEST(attempt - 1, 0), attempted_at = NULL
             WHERE id = $1 AND state = 'running'
             RETURNING queue",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = result else {
            return Self::expect_transition(0, job_id, JobState::Available);
        };
        let queue: String = row.get("queue");
        Self::pg_notify(&mut *tx, &queue).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn rescue_stale(&self, attempted_before: DateTime<Utc>) -> Result<u64> {
        // A job that already used its last attempt is discarded rather than
        // granted an extra run.
        let result = sqlx::query(
            "UPDATE job
             SET state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'available' END,
                 finalized_at = CASE WHEN attempt >= max_attempts THEN $2 ELSE NULL END,
                 last_error = 'abandoned while running by a stopped worker'
             WHERE state = 'running' AND attempted_at < $1",
        )
        .bind(attempted_before)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job SET state = 'cancelled', finalized_at = $2
             WHERE id = $1 AND state IN ('available', 'retryable')",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job
             WHERE state = $1
             ORDER BY created_at DESC
             LIMIT $2"
        ))
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM job GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(Error::Database)?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            stats.record(state.parse()?, count);
        }
        Ok(stats)
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    async fn begin(&self) -> Result<Option<JobTransaction>> {
        let tx = self.pool.begin().await.map_err(Error::Database)?;
        Ok(Some(tx))
    }

    async fn complete_tx(&self, tx: &mut JobTransaction, job_id: Uuid) -> Result<()> {
        Self::complete_on(&mut **tx, job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_transition_rejects_missed_update() {
        let id = Uuid::nil();
        let err = PgJobRepository::expect_transition(0, id, JobState::Completed).unwrap_err();
        assert!(err.to_string().contains("not running"));
        assert!(PgJobRepository::expect_transition(1, id, JobState::Completed).is_ok());
    }

    #[test]
    fn test_job_columns_cover_model() {
        for col in [
            "id",
            "kind",
            "queue",
            "args",
            "state",
            "scheduled_at",
            "attempt",
            "max_attempts",
            "last_error",
        ] {
            assert!(JOB_COLUMNS.contains(col), "missing column {col}");
        }
    }
}
