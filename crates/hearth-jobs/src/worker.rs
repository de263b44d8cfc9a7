//! Job worker: per-queue pollers dispatching claimed jobs to handlers.
//!
//! One poller task runs per configured queue. Each poller owns a semaphore
//! sized to the queue's `max_workers` and claims at most as many jobs as it
//! has free permits, so a queue never runs more handlers than its ceiling.
//! Pollers wake on the store's insert notification and fall back to polling.
//! A sweeper task returns jobs orphaned by a crashed worker to `available`.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use hearth_core::{
    defaults, Error, FailureDisposition, Job, JobRepository, JobTransaction, Result, RetryPolicy,
};

use crate::handler::{JobContext, JobHandler, JobResult, TransactionScope};
use crate::periodic::{PeriodicJob, PeriodicScheduler};
use crate::registry::HandlerRegistry;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Concurrency ceiling for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub max_workers: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            max_workers: max_workers.max(1),
        }
    }
}

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether to enable job processing.
    pub enabled: bool,
    /// Polling interval when no wake signal arrives.
    pub poll_interval: Duration,
    /// Hard limit on a single handler execution.
    pub job_timeout: Duration,
    /// How long `stop` waits for in-flight jobs before releasing them.
    pub shutdown_timeout: Duration,
    /// Jobs `running` longer than this are rescued. The periodic sweep never
    /// uses less than `job_timeout`.
    pub rescue_after: Duration,
    /// Interval between rescue sweeps while running. Zero disables the sweep.
    pub rescue_interval: Duration,
    /// Queues to poll, each with its own ceiling.
    pub queues: Vec<QueueConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_millis(defaults::JOB_POLL_INTERVAL_MS),
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(defaults::JOB_SHUTDOWN_TIMEOUT_SECS),
            rescue_after: Duration::from_secs(defaults::JOB_RESCUE_AFTER_SECS),
            rescue_interval: Duration::from_secs(defaults::JOB_RESCUE_INTERVAL_SECS),
            queues: vec![
                QueueConfig::new(defaults::JOB_DEFAULT_QUEUE, defaults::JOB_QUEUE_MAX_WORKERS),
                QueueConfig::new(defaults::EMBED_QUEUE, defaults::JOB_QUEUE_MAX_WORKERS),
                QueueConfig::new(defaults::MAINTENANCE_QUEUE, 1),
            ],
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval without a wake signal |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-execution limit |
    /// | `JOB_SHUTDOWN_TIMEOUT_SECS` | `30` | Drain window on stop |
    /// | `JOB_RESCUE_AFTER_SECS` | `3600` | Age of `running` jobs that are rescued |
    /// | `JOB_RESCUE_INTERVAL_SECS` | `60` | Rescue sweep interval (`0` disables) |
    /// | `JOB_QUEUES` | `default:4,embeddings:4,maintenance:1` | `name:max_workers` list |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let queues = match std::env::var("JOB_QUEUES") {
            Ok(spec) => parse_queues(&spec).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring invalid JOB_QUEUES, using defaults");
                defaults.queues.clone()
            }),
            Err(_) => defaults.queues.clone(),
        };

        Self {
            enabled,
            poll_interval: env_duration("JOB_POLL_INTERVAL_MS", Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            job_timeout: env_duration("JOB_TIMEOUT_SECS", Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            shutdown_timeout: env_duration("JOB_SHUTDOWN_TIMEOUT_SECS", Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            rescue_after: env_duration("JOB_RESCUE_AFTER_SECS", Duration::from_secs)
                .unwrap_or(defaults.rescue_after),
            rescue_interval: env_duration("JOB_RESCUE_INTERVAL_SECS", Duration::from_secs)
                .unwrap_or(defaults.rescue_interval),
            queues,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_rescue_after(mut self, age: Duration) -> Self {
        self.rescue_after = age;
        self
    }

    pub fn with_rescue_interval(mut self, interval: Duration) -> Self {
        self.rescue_interval = interval;
        self
    }

    /// Sum of every queue's ceiling: the most jobs this worker runs at once.
    pub fn total_workers(&self) -> usize {
        self.queues.iter().map(|q| q.max_workers).sum()
    }

    /// Replace the queue list.
    pub fn with_queues(mut self, queues: Vec<QueueConfig>) -> Self {
        self.queues = queues;
        self
    }

    /// Add a queue, or change the ceiling of an existing one.
    pub fn with_queue(mut self, name: impl Into<String>, max_workers: usize) -> Self {
        let queue = QueueConfig::new(name, max_workers);
        match self.queues.iter_mut().find(|q| q.name == queue.name) {
            Some(existing) => *existing = queue,
            None => self.queues.push(queue),
        }
        self
    }
}

fn env_duration(var: &str, unit: fn(u64) -> Duration) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(unit)
}

/// Parse a `name:max_workers,...` list. A bare name gets the default ceiling.
pub fn parse_queues(spec: &str) -> Result<Vec<QueueConfig>> {
    let mut queues: Vec<QueueConfig> = Vec::new();

    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, max_workers) = match item.split_once(':') {
            Some((name, max)) => {
                let max = max.trim().parse::<usize>().map_err(|_| {
                    Error::Config(format!("invalid max_workers in queue spec {item:?}"))
                })?;
                (name.trim(), max)
            }
            None => (item, defaults::JOB_QUEUE_MAX_WORKERS),
        };
        if name.is_empty() {
            return Err(Error::Config(format!("empty queue name in {item:?}")));
        }
        if max_workers == 0 {
            return Err(Error::Config(format!("queue {name} needs at least one worker")));
        }
        if queues.iter().any(|q| q.name == name) {
            return Err(Error::Config(format!("queue {name} configured twice")));
        }
        queues.push(QueueConfig::new(name, max_workers));
    }

    if queues.is_empty() {
        return Err(Error::Config("no queues configured".into()));
    }
    Ok(queues)
}

// =============================================================================
// EVENTS
// =============================================================================

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A claimed job started executing.
    JobStarted {
        job_id: Uuid,
        kind: String,
        queue: String,
        attempt: i32,
    },
    /// A job completed successfully.
    JobCompleted { job_id: Uuid, kind: String },
    /// A job failed and was parked for another attempt.
    JobRetried {
        job_id: Uuid,
        kind: String,
        error: String,
        scheduled_at: DateTime<Utc>,
    },
    /// A job reached the dead-letter state.
    JobDiscarded {
        job_id: Uuid,
        kind: String,
        error: String,
    },
    /// A job was returned to `available` during shutdown.
    JobReleased { job_id: Uuid, kind: String },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

// =============================================================================
// WORKER
// =============================================================================

/// Job worker that processes jobs from the queue.
pub struct JobWorker {
    repo: Arc<dyn JobRepository>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    retry_policy: RetryPolicy,
    periodic: Vec<PeriodicJob>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        repo: Arc<dyn JobRepository>,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            repo,
            registry: Arc::new(registry),
            config,
            retry_policy: RetryPolicy::default(),
            periodic: Vec::new(),
            event_tx,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Rescue stale jobs, then spawn the queue pollers, the rescue sweeper and
    /// the periodic scheduler.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "worker"))]
    pub async fn start(self) -> Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return Ok(WorkerHandle {
                shutdown_tx,
                tasks: Vec::new(),
                event_tx: self.event_tx,
            });
        }

        let rescue_after = chrono::Duration::from_std(self.config.rescue_after)
            .map_err(|e| Error::Config(format!("invalid rescue_after: {e}")))?;
        let rescued = self.repo.rescue_stale(Utc::now() - rescue_after).await?;
        if rescued > 0 {
            warn!(row_count = rescued, "Rescued jobs abandoned by a previous worker");
        }

        let dispatcher = Arc::new(Dispatcher {
            repo: self.repo.clone(),
            registry: self.registry.clone(),
            retry_policy: self.retry_policy.clone(),
            job_timeout: self.config.job_timeout,
            event_tx: self.event_tx.clone(),
        });

        let mut tasks = Vec::with_capacity(self.config.queues.len() + 2);
        for queue in &self.config.queues {
            let poller = QueuePoller {
                queue: queue.clone(),
                dispatcher: dispatcher.clone(),
                poll_interval: self.config.poll_interval,
                shutdown_timeout: self.config.shutdown_timeout,
            };
            tasks.push(tokio::spawn(poller.run(shutdown_rx.clone())));
        }

        if !self.config.rescue_interval.is_zero() {
            let sweeper = RescueSweeper {
                repo: self.repo.clone(),
                interval: self.config.rescue_interval,
                // A job this worker still runs is timed out before it gets this old.
                stale_after: chrono::Duration::from_std(
                    self.config.rescue_after.max(self.config.job_timeout),
                )
                .map_err(|e| Error::Config(format!("invalid rescue_after: {e}")))?,
            };
            tasks.push(tokio::spawn(sweeper.run(shutdown_rx.clone())));
        }

        if !self.periodic.is_empty() {
            let scheduler = self
                .periodic
                .into_iter()
                .fold(PeriodicScheduler::new(self.repo.clone()), |s, job| s.with_job(job));
            tasks.push(scheduler.spawn(shutdown_rx.clone()));
        }

        info!(
            queues = ?self.config.queues.iter().map(|q| format!("{}:{}", q.name, q.max_workers)).collect::<Vec<_>>(),
            handlers = ?self.registry.kinds(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            rescue_interval_secs = self.config.rescue_interval.as_secs(),
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        Ok(WorkerHandle {
            shutdown_tx,
            tasks,
            event_tx: self.event_tx,
        })
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl WorkerHandle {
    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Stop claiming, cancel in-flight contexts, and wait for them to drain.
    ///
    /// Jobs still running after the shutdown timeout are aborted and released
    /// back to `available` without consuming an attempt.
    pub async fn stop(self) -> Result<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        self.shutdown_tx.send_replace(true);

        let mut failed = 0;
        for task in self.tasks {
            if let Err(e) = task.await {
                failed += 1;
                error!(subsystem = "jobs", error = ?e, "Worker task panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(subsystem = "jobs", component = "worker", "Job worker stopped");

        if failed > 0 {
            return Err(Error::Internal(format!("{failed} worker task(s) panicked")));
        }
        Ok(())
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    repo: Arc<dyn JobRepository>,
    config: WorkerConfig,
    retry_policy: RetryPolicy,
    handlers: Vec<Arc<dyn JobHandler>>,
    periodic: Vec<PeriodicJob>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self {
            repo,
            config: WorkerConfig::default(),
            retry_policy: RetryPolicy::default(),
            handlers: Vec::new(),
            periodic: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Add a periodic job, scheduled while the worker runs.
    pub fn with_periodic(mut self, job: PeriodicJob) -> Self {
        self.periodic.push(job);
        self
    }

    /// Build the worker. Fails if two handlers claim the same kind.
    pub fn build(self) -> Result<JobWorker> {
        let mut registry = HandlerRegistry::new();
        for handler in self.handlers {
            registry.register_arc(handler)?;
        }

        let mut worker = JobWorker::new(self.repo, registry, self.config);
        worker.retry_policy = self.retry_policy;
        worker.periodic = self.periodic;
        Ok(worker)
    }
}

// =============================================================================
// POLLING
// =============================================================================

type RunningJobs = Arc<Mutex<HashMap<Uuid, String>>>;

fn lock(running: &Mutex<HashMap<Uuid, String>>) -> MutexGuard<'_, HashMap<Uuid, String>> {
    running.lock().unwrap_or_else(|e| e.into_inner())
}

struct QueuePoller {
    queue: QueueConfig,
    dispatcher: Arc<Dispatcher>,
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

impl QueuePoller {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.queue.name.as_str();
        let semaphore = Arc::new(Semaphore::new(self.queue.max_workers));
        let running: RunningJobs = Arc::new(Mutex::new(HashMap::new()));
        let notify = self.dispatcher.repo.job_notify();
        let mut tasks = JoinSet::new();

        debug!(
            subsystem = "jobs",
            component = "poller",
            queue,
            max_workers = self.queue.max_workers,
            "Queue poller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Register interest before claiming so an insert racing the claim
            // still wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.tick(&semaphore, &running, &mut tasks, &shutdown).await;

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = &mut notified => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join_error(queue, joined);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.drain(tasks, &running).await;
        debug!(subsystem = "jobs", component = "poller", queue, "Queue poller stopped");
    }

    /// Promote due retries, then claim up to the free concurrency slots.
    async fn tick(
        &self,
        semaphore: &Arc<Semaphore>,
        running: &RunningJobs,
        tasks: &mut JoinSet<()>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let queue = self.queue.name.as_str();
        let repo = &self.dispatcher.repo;

        while let Some(joined) = tasks.try_join_next() {
            log_join_error(queue, joined);
        }

        match repo.promote_retryable(Utc::now()).await {
            Ok(0) => {}
            Ok(promoted) => {
                debug!(subsystem = "jobs", queue, row_count = promoted, "Promoted retryable jobs");
                repo.job_notify().notify_waiters();
            }
            Err(e) => warn!(subsystem = "jobs", queue, error = %e, "Failed to promote retryable jobs"),
        }

        let free = semaphore.available_permits();
        if free == 0 {
            return;
        }

        let jobs = match repo.claim(queue, free as i64, Utc::now()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(subsystem = "jobs", queue, error = %e, "Failed to claim jobs");
                return;
            }
        };
        if !jobs.is_empty() {
            debug!(subsystem = "jobs", queue, claimed = jobs.len(), "Claimed jobs");
        }

        for job in jobs {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                // Claimed more than we had room for; hand it back untouched.
                if let Err(e) = repo.release(job.id).await {
                    error!(subsystem = "jobs", job_id = %job.id, error = %e, "Failed to release job");
                }
                continue;
            };

            lock(running).insert(job.id, job.kind.clone());
            let dispatcher = self.dispatcher.clone();
            let running = running.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let job_id = job.id;
                dispatcher.execute(job, shutdown).await;
                lock(&running).remove(&job_id);
            });
        }
    }

    /// Wait for in-flight jobs, then abort and release whatever is left.
    async fn drain(&self, mut tasks: JoinSet<()>, running: &RunningJobs) {
        let queue = self.queue.name.as_str();
        if tasks.is_empty() {
            return;
        }
        info!(
            subsystem = "jobs",
            queue,
            in_flight = tasks.len(),
            "Draining in-flight jobs"
        );

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                log_join_error(queue, joined);
            }
        })
        .await;
        if drained.is_ok() {
            return;
        }

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let orphans: Vec<(Uuid, String)> = lock(running).drain().collect();
        for (job_id, kind) in orphans {
            match self.dispatcher.repo.release(job_id).await {
                Ok(()) => {
                    warn!(
                        subsystem = "jobs",
                        job_id = %job_id,
                        job_kind = %kind,
                        "Released job still running at shutdown timeout"
                    );
                    let _ = self
                        .dispatcher
                        .event_tx
                        .send(WorkerEvent::JobReleased { job_id, kind });
                }
                // Aborted after its final transition; nothing to release.
                Err(Error::Job(_)) => {}
                Err(e) => {
                    error!(subsystem = "jobs", job_id = %job_id, error = %e, "Failed to release job");
                }
            }
        }
    }
}

// =============================================================================
// RESCUE
// =============================================================================

/// Periodically releases jobs left `running` by a worker that died mid-job.
struct RescueSweeper {
    repo: Arc<dyn JobRepository>,
    interval: Duration,
    stale_after: chrono::Duration,
}

impl RescueSweeper {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes at once; startup already swept.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
        debug!(subsystem = "jobs", component = "rescue", "Rescue sweeper stopped");
    }

    async fn sweep(&self) {
        match self.repo.rescue_stale(Utc::now() - self.stale_after).await {
            Ok(0) => {}
            Ok(rescued) => {
                warn!(
                    subsystem = "jobs",
                    component = "rescue",
                    row_count = rescued,
                    "Rescued jobs orphaned by a stopped worker"
                );
                self.repo.job_notify().notify_waiters();
            }
            Err(e) => {
                error!(subsystem = "jobs", component = "rescue", error = %e, "Failed to rescue stale jobs");
            }
        }
    }
}

fn log_join_error(queue: &str, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!(subsystem = "jobs", queue, error = ?e, "Job task crashed");
        }
    }
}

// =============================================================================
// EXECUTION
// =============================================================================

/// Shared state for executing a single claimed job in a spawned task.
struct Dispatcher {
    repo: Arc<dyn JobRepository>,
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    job_timeout: Duration,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl Dispatcher {
    async fn execute(&self, job: Job, shutdown: watch::Receiver<bool>) {
        let start = Instant::now();
        let job_id = job.id;
        let kind = job.kind.clone();
        let attempt = job.attempt;
        let max_attempts = job.max_attempts;

        info!(
            subsystem = "jobs",
            job_id = %job_id,
            job_kind = %kind,
            queue = %job.queue,
            attempt,
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            kind: kind.clone(),
            queue: job.queue.clone(),
            attempt,
        });

        let (mut result, tx) = match self.registry.resolve(&kind) {
            Ok(handler) => self.run_scoped(handler, job, shutdown.clone()).await,
            Err(e) => {
                warn!(subsystem = "jobs", job_id = %job_id, job_kind = %kind, error = %e, "No handler for job");
                (JobResult::Discard(e.to_string()), None)
            }
        };

        let mut completed_in_tx = false;
        if let Some(tx) = tx {
            if result.is_success() {
                match self.commit_completed(tx, job_id).await {
                    Ok(()) => completed_in_tx = true,
                    Err(e) => {
                        warn!(subsystem = "jobs", job_id = %job_id, job_kind = %kind, error = %e, "Job transaction failed to commit");
                        result = JobResult::Retry(format!("failed to commit job transaction: {e}"));
                    }
                }
            } else if let Err(e) = tx.rollback().await {
                warn!(subsystem = "jobs", job_id = %job_id, job_kind = %kind, error = %e, "Failed to roll back job transaction");
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let shutting_down = *shutdown.borrow();
        let outcome = match result {
            JobResult::Success(data) => {
                let recorded = if completed_in_tx {
                    Ok(())
                } else {
                    self.repo.complete(job_id).await
                };
                recorded.map(|()| {
                    info!(subsystem = "jobs", job_id = %job_id, job_kind = %kind, duration_ms, "Job completed successfully");
                    if let Some(data) = data {
                        debug!(subsystem = "jobs", job_id = %job_id, result = %data, "Job result");
                    }
                    WorkerEvent::JobCompleted {
                        job_id,
                        kind: kind.clone(),
                    }
                })
            }
            JobResult::Discard(error) => self.discard(job_id, &kind, error, duration_ms).await,
            JobResult::Cancelled(error) if shutting_down => {
                // Interrupted by shutdown: hand back without spending the attempt.
                self.repo.release(job_id).await.map(|()| {
                    info!(subsystem = "jobs", job_id = %job_id, job_kind = %kind, %error, "Job released at shutdown");
                    WorkerEvent::JobReleased {
                        job_id,
                        kind: kind.clone(),
                    }
                })
            }
            JobResult::Retry(error) | JobResult::Cancelled(error) => {
                match self.retry_policy.on_failure(attempt, max_attempts, Utc::now()) {
                    FailureDisposition::Retry { scheduled_at } => self
                        .repo
                        .retry(job_id, &error, scheduled_at)
                        .await
                        .map(|()| {
                            warn!(
                                subsystem = "jobs",
                                job_id = %job_id,
                                job_kind = %kind,
                                attempt,
                                max_attempts,
                                %error,
                                %scheduled_at,
                                duration_ms,
                                "Job failed, will retry"
                            );
                            WorkerEvent::JobRetried {
                                job_id,
                                kind: kind.clone(),
                                error,
                                scheduled_at,
                            }
                        }),
                    FailureDisposition::Discard => {
                        self.discard(job_id, &kind, error, duration_ms).await
                    }
                }
            }
        };

        match outcome {
            Ok(event) => {
                let _ = self.event_tx.send(event);
            }
            Err(e) => {
                error!(subsystem = "jobs", job_id = %job_id, job_kind = %kind, error = %e, "Failed to record job outcome");
            }
        }
    }

    async fn discard(
        &self,
        job_id: Uuid,
        kind: &str,
        error: String,
        duration_ms: u64,
    ) -> Result<WorkerEvent> {
        self.repo.discard(job_id, &error).await?;
        error!(
            subsystem = "jobs",
            job_id = %job_id,
            job_kind = %kind,
            %error,
            duration_ms,
            "Job discarded"
        );
        Ok(WorkerEvent::JobDiscarded {
            job_id,
            kind: kind.to_string(),
            error,
        })
    }

    /// Run a handler, inside an engine transaction unless it manages its own.
    ///
    /// Returns the transaction still open so the caller can commit it with the
    /// job's completion or roll it back.
    async fn run_scoped(
        &self,
        handler: Arc<dyn JobHandler>,
        job: Job,
        shutdown: watch::Receiver<bool>,
    ) -> (JobResult, Option<JobTransaction>) {
        let mut ctx = JobContext::new(job).with_shutdown(shutdown);

        let slot = match handler.transaction_scope() {
            TransactionScope::Handler => None,
            TransactionScope::Job => match self.repo.begin().await {
                Ok(tx) => tx.map(|tx| Arc::new(tokio::sync::Mutex::new(Some(tx)))),
                Err(e) => {
                    return (
                        JobResult::Retry(format!("failed to open job transaction: {e}")),
                        None,
                    );
                }
            },
        };
        if let Some(slot) = &slot {
            ctx = ctx.with_transaction(slot.clone());
        }

        let result = self.run_handler(handler, ctx).await;
        let tx = match slot {
            Some(slot) => {
                let mut tx = slot.lock().await;
                tx.take()
            }
            None => None,
        };
        (result, tx)
    }

    async fn commit_completed(&self, mut tx: JobTransaction, job_id: Uuid) -> Result<()> {
        self.repo.complete_tx(&mut tx, job_id).await?;
        tx.commit().await.map_err(Error::Database)
    }

    /// Run a handler under the job timeout, converting a panic into a retryable failure.
    async fn run_handler(&self, handler: Arc<dyn JobHandler>, ctx: JobContext) -> JobResult {
        let execution = AssertUnwindSafe(handler.execute(ctx)).catch_unwind();
        match tokio::time::timeout(self.job_timeout, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => JobResult::Retry(format!("handler panicked: {}", panic_message(&*panic))),
            Err(_) => JobResult::Retry(format!(
                "job exceeded timeout of {}s",
                self.job_timeout.as_secs_f64()
            )),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
