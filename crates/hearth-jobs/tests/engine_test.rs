//! Job engine behaviour against the in-memory job store.
//!
//! This test suite validates:
//! - An always-failing job is discarded exactly at `max_attempts` and never runs again
//! - Unknown kinds and kinds without a handler are discarded, not dropped
//! - A handler panic is a retryable failure
//! - A handler exceeding the job timeout fails the attempt
//! - Stop releases cancelled in-flight jobs without consuming an attempt
//! - A genuine failure reported during shutdown still consumes its attempt
//! - Per-queue concurrency ceilings hold
//! - Stale running jobs are rescued at start and while the worker runs
//! - Periodic jobs are materialized and executed

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use hearth_cache::Cache;
use hearth_db::{MemoryCacheStore, MemoryJobRepository};
use hearth_jobs::{
    CacheReaperArgs, CacheReaperHandler, InsertOpts, Job, JobClient, JobContext, JobHandler,
    JobKind, JobRepository, JobResult, JobState, NewJob, NoOpHandler, PeriodicJob, QueueConfig,
    RetryPolicy, Schedule, SendEmailArgs, WorkerBuilder, WorkerConfig, WorkerEvent,
};

// =============================================================================
// HELPERS
// =============================================================================

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_queues(vec![QueueConfig::new("default", 4)])
}

fn immediate_retries() -> RetryPolicy {
    RetryPolicy::default().with_base(Duration::ZERO)
}

fn email() -> SendEmailArgs {
    SendEmailArgs {
        to: "ops@example.com".into(),
        subject: "status".into(),
        body: "ok".into(),
    }
}

async fn wait_for_state(repo: &MemoryJobRepository, id: Uuid, state: JobState) -> Job {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = repo.get(id).await.unwrap().expect("job exists");
        if job.state == state {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} stuck in {} waiting for {state}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_matching<F>(events: &mut broadcast::Receiver<WorkerEvent>, mut pred: F) -> WorkerEvent
where
    F: FnMut(&WorkerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event within 5s")
}

/// Always reports a transient failure.
#[derive(Clone, Default)]
struct FailingHandler {
    executions: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for FailingHandler {
    fn kind(&self) -> JobKind {
        JobKind::SendEmail
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        self.executions.fetch_add(1, Ordering::SeqCst);
        JobResult::Retry("smtp relay unavailable".into())
    }
}

/// Panics on the first attempt, succeeds afterwards.
#[derive(Clone, Default)]
struct PanicOnceHandler {
    executions: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for PanicOnceHandler {
    fn kind(&self) -> JobKind {
        JobKind::SendEmail
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        if self.executions.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("boom");
        }
        JobResult::Success(None)
    }
}

/// Runs until cancelled and then returns `on_cancel`, or forever when it is `None`.
struct BlockingHandler {
    started: Arc<Notify>,
    on_cancel: Option<JobResult>,
}

#[async_trait]
impl JobHandler for BlockingHandler {
    fn kind(&self) -> JobKind {
        JobKind::SendEmail
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        self.started.notify_one();
        match &self.on_cancel {
            Some(result) => {
                ctx.cancelled().await;
                result.clone()
            }
            None => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                JobResult::Success(None)
            }
        }
    }
}

/// Tracks the highest number of simultaneous executions.
#[derive(Clone, Default)]
struct GaugeHandler {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for GaugeHandler {
    fn kind(&self) -> JobKind {
        JobKind::SendEmail
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        JobResult::Success(None)
    }
}

// =============================================================================
// RETRY / DISCARD
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_always_failing_job_discarded_at_max_attempts() {
    let repo = MemoryJobRepository::new();
    let handler = FailingHandler::default();
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config())
        .with_retry_policy(immediate_retries())
        .with_handler(handler.clone())
        .build()
        .unwrap();
    let mut events = worker.events();
    let handle = worker.start().await.unwrap();

    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(&email(), InsertOpts::new().max_attempts(3))
        .await
        .unwrap();

    let event = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobDiscarded { .. })).await;
    assert!(matches!(event, WorkerEvent::JobDiscarded { job_id, .. } if job_id == job.id));

    let discarded = wait_for_state(&repo, job.id, JobState::Discarded).await;
    assert_eq!(discarded.attempt, 3);
    assert_eq!(discarded.last_error.as_deref(), Some("smtp relay unavailable"));
    assert!(discarded.finalized_at.is_some());

    // Dead letters are never dispatched again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handler.executions.load(Ordering::SeqCst), 3);

    handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_backoff_parks_job() {
    let repo = MemoryJobRepository::new();
    let handler = FailingHandler::default();
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config())
        .with_retry_policy(RetryPolicy::default().with_base(Duration::from_secs(60)))
        .with_handler(handler.clone())
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let before = Utc::now();
    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(&email(), InsertOpts::new())
        .await
        .unwrap();

    let parked = wait_for_state(&repo, job.id, JobState::Retryable).await;
    assert_eq!(parked.attempt, 1);
    assert!(parked.scheduled_at >= before + chrono::Duration::seconds(59));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.executions.load(Ordering::SeqCst), 1);

    handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_kind_is_discarded() {
    let repo = MemoryJobRepository::new();
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config())
        .with_handler(NoOpHandler::new(JobKind::SendEmail))
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let unknown = repo
        .insert(NewJob {
            kind: "fax_machine".into(),
            queue: "default".into(),
            args: json!({}),
            scheduled_at: Utc::now(),
            max_attempts: 5,
        })
        .await
        .unwrap();
    let unhandled = JobClient::new(Arc::new(repo.clone()))
        .insert(
            &hearth_jobs::WebCrawlerArgs {
                url: "https://example.com".into(),
            },
            InsertOpts::new(),
        )
        .await
        .unwrap();

    let job = wait_for_state(&repo, unknown.id, JobState::Discarded).await;
    assert_eq!(job.attempt, 1, "unknown kinds are not retried");
    assert!(job.last_error.unwrap().contains("fax_machine"));

    let job = wait_for_state(&repo, unhandled.id, JobState::Discarded).await;
    assert!(job.last_error.unwrap().contains("no handler registered"));

    handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panic_is_retried() {
    let repo = MemoryJobRepository::new();
    let handler = PanicOnceHandler::default();
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config())
        .with_retry_policy(immediate_retries())
        .with_handler(handler.clone())
        .build()
        .unwrap();
    let mut events = worker.events();
    let handle = worker.start().await.unwrap();

    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(&email(), InsertOpts::new())
        .await
        .unwrap();

    match next_matching(&mut events, |e| matches!(e, WorkerEvent::JobRetried { .. })).await {
        WorkerEvent::JobRetried { error, .. } => assert!(error.contains("panicked: boom"), "{error}"),
        other => panic!("unexpected event {other:?}"),
    }

    let done = wait_for_state(&repo, job.id, JobState::Completed).await;
    assert_eq!(done.attempt, 2);
    assert_eq!(handler.executions.load(Ordering::SeqCst), 2);

    handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_fails_attempt() {
    let repo = MemoryJobRepository::new();
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config().with_job_timeout(Duration::from_millis(100)))
        .with_handler(BlockingHandler {
            started: Arc::new(Notify::new()),
            on_cancel: None,
        })
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(&email(), InsertOpts::new().max_attempts(1))
        .await
        .unwrap();

    let job = wait_for_state(&repo, job.id, JobState::Discarded).await;
    assert!(job.last_error.unwrap().contains("timeout"));

    handle.stop().await.unwrap();
}

// =============================================================================
// SHUTDOWN
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_releases_cooperative_job() {
    let repo = MemoryJobRepository::new();
    let started = Arc::new(Notify::new());
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config())
        .with_handler(BlockingHandler {
            started: started.clone(),
            on_cancel: Some(JobResult::Cancelled("stopping".into())),
        })
        .build()
        .unwrap();
    let mut events = worker.events();
    let handle = worker.start().await.unwrap();

    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(&email(), InsertOpts::new())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("handler started");

    handle.stop().await.unwrap();

    let released = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(released.state, JobState::Available);
    assert_eq!(released.attempt, 0, "release does not consume an attempt");

    let event = next_matching(&mut events, |e| matches!(e, WorkerEvent::JobReleased { .. })).await;
    assert!(matches!(event, WorkerEvent::JobReleased { job_id, .. } if job_id == job.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_during_shutdown_consumes_attempt() {
    let repo = MemoryJobRepository::new();
    let started = Arc::new(Notify::new());
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config())
        .with_retry_policy(RetryPolicy::default().with_base(Duration::from_secs(60)))
        .with_handler(BlockingHandler {
            started: started.clone(),
            on_cancel: Some(JobResult::Retry("smtp relay unavailable".into())),
        })
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(&email(), InsertOpts::new())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("handler started");

    handle.stop().await.unwrap();

    let parked = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(parked.state, JobState::Retryable);
    assert_eq!(parked.attempt, 1, "a real failure spends the attempt");
    assert_eq!(parked.last_error.as_deref(), Some("smtp relay unavailable"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_aborts_and_releases_stubborn_job() {
    let repo = MemoryJobRepository::new();
    let started = Arc::new(Notify::new());
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config().with_shutdown_timeout(Duration::from_millis(100)))
        .with_handler(BlockingHandler {
            started: started.clone(),
            on_cancel: None,
        })
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(&email(), InsertOpts::new())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("handler started");

    tokio::time::timeout(Duration::from_secs(5), handle.stop())
        .await
        .expect("stop honours the shutdown timeout")
        .unwrap();

    let released = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(released.state, JobState::Available);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabled_worker_processes_nothing() {
    let repo = MemoryJobRepository::new();
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config().with_enabled(false))
        .with_handler(NoOpHandler::new(JobKind::SendEmail))
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(&email(), InsertOpts::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(repo.get(job.id).await.unwrap().unwrap().state, JobState::Available);

    handle.stop().await.unwrap();
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_concurrency_ceiling() {
    let repo = MemoryJobRepository::new();
    let gauge = GaugeHandler::default();
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config().with_queues(vec![QueueConfig::new("default", 2)]))
        .with_handler(gauge.clone())
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let client = JobClient::new(Arc::new(repo.clone()));
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(client.insert(&email(), InsertOpts::new()).await.unwrap().id);
    }
    for id in ids {
        wait_for_state(&repo, id, JobState::Completed).await;
    }

    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak {peak} exceeded queue ceiling");
    handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queues_are_isolated() {
    let repo = MemoryJobRepository::new();
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config())
        .with_handler(NoOpHandler::new(JobKind::SendEmail))
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let client = JobClient::new(Arc::new(repo.clone()));
    let polled = client.insert(&email(), InsertOpts::new()).await.unwrap();
    let unpolled = client
        .insert(&email(), InsertOpts::new().queue("reports"))
        .await
        .unwrap();

    wait_for_state(&repo, polled.id, JobState::Completed).await;
    assert_eq!(
        repo.get(unpolled.id).await.unwrap().unwrap().state,
        JobState::Available
    );
    handle.stop().await.unwrap();
}

// =============================================================================
// STARTUP
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_running_job_rescued_at_start() {
    let repo = MemoryJobRepository::new();
    let job = JobClient::new(Arc::new(repo.clone()))
        .insert(&email(), InsertOpts::new())
        .await
        .unwrap();
    // Simulate a worker that claimed the job and then died.
    let claimed = repo.claim("default", 1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config().with_rescue_after(Duration::ZERO))
        .with_handler(NoOpHandler::new(JobKind::SendEmail))
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    let done = wait_for_state(&repo, job.id, JobState::Completed).await;
    assert_eq!(done.attempt, 2);
    handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_orphaned_while_running_is_rescued() {
    let repo = MemoryJobRepository::new();
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(
            fast_config()
                .with_job_timeout(Duration::from_millis(50))
                .with_rescue_after(Duration::from_millis(50))
                .with_rescue_interval(Duration::from_millis(20)),
        )
        .with_handler(NoOpHandler::new(JobKind::SendEmail))
        .build()
        .unwrap();
    let handle = worker.start().await.unwrap();

    // Another worker claims the job after startup, then dies.
    let job = repo
        .insert(NewJob::from_args(&email(), InsertOpts::new().queue("elsewhere")).unwrap())
        .await
        .unwrap();
    let claimed = repo.claim("elsewhere", 1, Utc::now()).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let rescued = wait_for_state(&repo, job.id, JobState::Available).await;
    assert_eq!(rescued.attempt, 1, "rescue keeps the spent attempt");
    handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_periodic_job_runs_through_engine() {
    let repo = MemoryJobRepository::new();
    let cache = Cache::new(Arc::new(MemoryCacheStore::new()));
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(fast_config().with_queue("maintenance", 1))
        .with_handler(CacheReaperHandler::new(cache))
        .with_periodic(
            PeriodicJob::new(
                Schedule::every(Duration::from_secs(3600)).unwrap(),
                CacheReaperArgs::default,
            )
            .run_on_start(true)
            .non_overlapping(true),
        )
        .build()
        .unwrap();
    let mut events = worker.events();
    let handle = worker.start().await.unwrap();

    let event = next_matching(&mut events, |e| {
        matches!(e, WorkerEvent::JobCompleted { kind, .. } if kind == "cache_reaper")
    })
    .await;
    assert!(matches!(event, WorkerEvent::JobCompleted { .. }));

    handle.stop().await.unwrap();
    assert_eq!(repo.queue_stats().await.unwrap().completed, 1);
}
