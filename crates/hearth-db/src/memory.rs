//! In-memory repository implementations.
//!
//! Same contracts as the PostgreSQL repositories, held in process memory.
//! Used by tests and by embedders that run without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use hearth_core::{
    new_v7, CacheEntry, CacheStore, EmbeddingRecord, EmbeddingRepository, Error, Job,
    JobRepository, JobState, NewJob, QueueStats, Result,
};

// =============================================================================
// JOBS
// =============================================================================

/// In-memory job store.
#[derive(Clone, Default)]
pub struct MemoryJobRepository {
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
    notify: Arc<Notify>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored job, in insertion order.
    pub async fn all(&self) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|j| j.id);
        all
    }

    async fn transition<F>(&self, job_id: Uuid, to: JobState, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.state == JobState::Running => {
                job.state = to;
                apply(job);
                Ok(())
            }
            _ => Err(Error::Job(format!(
                "job {job_id} is not running, cannot move to {to}"
            ))),
        }
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn insert(&self, job: NewJob) -> Result<Job> {
        let inserted = Job {
            id: new_v7(),
            kind: job.kind,
            queue: job.queue,
            args: job.args,
            state: JobState::Available,
            scheduled_at: job.scheduled_at,
            attempt: 0,
            max_attempts: job.max_attempts,
            last_error: None,
            created_at: Utc::now(),
            attempted_at: None,
            finalized_at: None,
        };
        self.jobs
            .write()
            .await
            .insert(inserted.id, inserted.clone());
        self.notify.notify_waiters();
        Ok(inserted)
    }

    async fn claim(&self, queue: &str, limit: i64, now: DateTime<Utc>) -> Result<Vec<Job>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut jobs = self.jobs.write().await;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|j| j.state == JobState::Available && j.queue == queue && j.scheduled_at <= now)
            .map(|j| (j.scheduled_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.state = JobState::Running;
                job.attempt += 1;
                job.attempted_at = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn promote_retryable(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let mut promoted = 0;
        for job in jobs.values_mut() {
            if job.state == JobState::Retryable && job.scheduled_at <= now {
                job.state = JobState::Available;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        self.transition(job_id, JobState::Completed, |job| {
            job.finalized_at = Some(Utc::now());
        })
        .await
    }

    async fn retry(&self, job_id: Uuid, error: &str, scheduled_at: DateTime<Utc>) -> Result<()> {
        self.transition(job_id, JobState::Retryable, |job| {
            job.last_error = Some(error.to_string());
            job.scheduled_at = scheduled_at;
        })
        .await
    }

    async fn discard(&self, job_id: Uuid, error: &str) -> Result<()> {
        self.transition(job_id, JobState::Discarded, |job| {
            job.last_error = Some(error.to_string());
            job.finalized_at = Some(Utc::now());
        })
        .await
    }

    async fn release(&self, job_id: Uuid) -> Result<()> {
        self.transition(job_id, JobState::Available, |job| {
            job.attempt = (job.attempt - 1).max(0);
            job.attempted_at = None;
        })
        .await?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn rescue_stale(&self, attempted_before: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        let mut rescued = 0;
        for job in jobs.values_mut() {
            let stale = job.state == JobState::Running
                && job.attempted_at.is_some_and(|at| at < attempted_before);
            if !stale {
                continue;
            }
            if job.attempt >= job.max_attempts {
                job.state = JobState::Discarded;
                job.finalized_at = Some(now);
            } else {
                job.state = JobState::Available;
            }
            job.last_error = Some("abandoned while running by a stopped worker".to_string());
            rescued += 1;
        }
        Ok(rescued)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.state.is_cancellable() => {
                job.state = JobState::Cancelled;
                job.finalized_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs.values().filter(|j| j.state == state).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.read().await;
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            stats.record(job.state, 1);
        }
        Ok(stats)
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// In-memory cache store. Can be switched into a failing mode to exercise
/// error handling in callers.
#[derive(Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<RwLock<HashMap<(String, String), CacheEntry>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again with `false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored rows, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Cache("cache store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, domain: &str, key: &str) -> Result<Option<CacheEntry>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(domain.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(&self, entry: CacheEntry) -> Result<()> {
        self.check_available()?;
        self.entries
            .write()
            .await
            .insert((entry.domain.clone(), entry.key.clone()), entry);
        Ok(())
    }

    async fn delete(&self, domain: &str, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries
            .write()
            .await
            .remove(&(domain.to_string(), key.to_string()));
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_at(now));
        Ok((before - entries.len()) as u64)
    }
}

// =============================================================================
// EMBEDDINGS
// =============================================================================

/// In-memory embedding store; counts insert attempts.
#[derive(Clone, Default)]
pub struct MemoryEmbeddingRepository {
    records: Arc<RwLock<HashMap<Uuid, EmbeddingRecord>>>,
    inserts: Arc<AtomicUsize>,
}

impl MemoryEmbeddingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of `insert` calls, including ones that hit an existing record.
    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingRepository for MemoryEmbeddingRepository {
    async fn exists(&self, document_id: Uuid) -> Result<bool> {
        Ok(self.records.read().await.contains_key(&document_id))
    }

    async fn insert(&self, record: EmbeddingRecord) -> Result<bool> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.write().await;
        if records.contains_key(&record.document_id) {
            return Ok(false);
        }
        records.insert(record.document_id, record);
        Ok(true)
    }

    async fn list_for_attachment(&self, attachment_id: Uuid) -> Result<Vec<EmbeddingRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<EmbeddingRecord> = records
            .values()
            .filter(|r| r.attachment_id == attachment_id)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.document_id);
        Ok(matching)
    }
}
