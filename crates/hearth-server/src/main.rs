//! hearth worker process.
//!
//! Connects to PostgreSQL, runs migrations, starts the job engine with every
//! handler whose collaborators are available, and drains on Ctrl+C.

mod mailer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hearth_cache::{Cache, CacheConfig};
use hearth_db::{log_pool_metrics, Database, JobRepository, PoolConfig};
use hearth_jobs::{
    CacheReaperArgs, CacheReaperHandler, PeriodicJob, RetryPolicy, Schedule, SendEmailHandler,
    WorkerBuilder, WorkerConfig, WorkerEvent,
};

use crate::mailer::LogMailer;

/// Interval between queue depth log lines.
const QUEUE_STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _file_guard = init_logging();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/hearth".to_string());

    let worker_config = WorkerConfig::from_env();
    let pool_config = PoolConfig::from_env().reserve_for_workers(worker_config.total_workers());

    info!("Connecting to database...");
    let db = Database::connect_with_config(&database_url, pool_config).await?;
    info!("Database connected");

    info!("Running database migrations...");
    db.migrate().await?;
    info!("Database migrations complete");
    log_pool_metrics(&db.pool);

    let listener = db.jobs.spawn_listener();

    let cache = Cache::new(Arc::new(db.cache.clone()));
    let cache_config = CacheConfig::from_env();

    let reaper = PeriodicJob::new(Schedule::every(cache_config.reap_interval)?, || {
        CacheReaperArgs {}
    })
    .run_on_start(true)
    .non_overlapping(true);

    // Embedding, generation and web collaborators are deployment specific;
    // their job kinds are discarded as unhandled until one is registered.
    let worker = WorkerBuilder::new(Arc::new(db.jobs.clone()))
        .with_config(worker_config)
        .with_retry_policy(RetryPolicy::from_env())
        .with_handler(CacheReaperHandler::new(cache))
        .with_handler(SendEmailHandler::new(Arc::new(LogMailer)))
        .with_periodic(reaper)
        .build()?;

    info!(
        handlers = ?worker.registry().kinds(),
        queues = ?worker
            .config()
            .queues
            .iter()
            .map(|q| format!("{}:{}", q.name, q.max_workers))
            .collect::<Vec<_>>(),
        "Starting job worker..."
    );
    let handle = worker.start().await?;

    let events = tokio::spawn(log_worker_events(handle.events()));
    let stats = tokio::spawn(log_queue_stats(db.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers");

    let stopped = handle.stop().await;
    stats.abort();
    events.abort();
    listener.abort();
    db.pool.close().await;

    match stopped {
        Ok(()) => {
            info!("Job worker stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Job worker stopped with errors");
            Err(e.into())
        }
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "hearth_server=debug,hearth_jobs=debug")
///
/// The returned guard flushes the file writer and must live until exit.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "hearth_server=debug,hearth_jobs=debug".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("hearth-server.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            // no ANSI in files unless asked for
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Mirror engine events into the log until the worker stops.
async fn log_worker_events(mut rx: broadcast::Receiver<WorkerEvent>) {
    loop {
        match rx.recv().await {
            Ok(WorkerEvent::JobStarted {
                job_id,
                kind,
                queue,
                attempt,
            }) => {
                debug!(subsystem = "server", %job_id, job_kind = %kind, %queue, attempt, "Job started");
            }
            Ok(WorkerEvent::JobCompleted { job_id, kind }) => {
                info!(subsystem = "server", %job_id, job_kind = %kind, "Job completed");
            }
            Ok(WorkerEvent::JobRetried {
                job_id,
                kind,
                error,
                scheduled_at,
            }) => {
                warn!(subsystem = "server", %job_id, job_kind = %kind, %error, %scheduled_at, "Job scheduled for retry");
            }
            Ok(WorkerEvent::JobDiscarded { job_id, kind, error }) => {
                error!(subsystem = "server", %job_id, job_kind = %kind, %error, "Job discarded");
            }
            Ok(WorkerEvent::JobReleased { job_id, kind }) => {
                info!(subsystem = "server", %job_id, job_kind = %kind, "Job released for another worker");
            }
            Ok(WorkerEvent::WorkerStarted) => info!(subsystem = "server", "Job worker running"),
            Ok(WorkerEvent::WorkerStopped) => break,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(subsystem = "server", skipped, "Worker event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_queue_stats(db: Database) {
    let mut interval = tokio::time::interval(QUEUE_STATS_INTERVAL);
    loop {
        interval.tick().await;
        match db.jobs.queue_stats().await {
            Ok(stats) => debug!(
                subsystem = "server",
                available = stats.available,
                running = stats.running,
                retryable = stats.retryable,
                discarded = stats.discarded,
                "Queue status"
            ),
            Err(e) => warn!(subsystem = "server", error = %e, "Failed to read queue status"),
        }
        log_pool_metrics(&db.pool);
    }
}
