//! Centralized default constants for hearth.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic numbers.
//!
//! Organized by domain area. When adding new constants, place them in the
//! appropriate section.

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Queue used when an insert does not override it.
pub const JOB_DEFAULT_QUEUE: &str = "default";

/// Queue for housekeeping jobs such as the cache reaper.
pub const MAINTENANCE_QUEUE: &str = "maintenance";

/// Concurrency ceiling for a queue that has no explicit configuration.
pub const JOB_QUEUE_MAX_WORKERS: usize = 4;

/// Attempts allowed before a job is discarded.
pub const JOB_MAX_ATTEMPTS: i32 = 5;

/// Polling interval when no wake signal arrives (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Hard limit on a single handler execution (seconds).
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// How long `stop` waits for in-flight jobs before releasing them (seconds).
pub const JOB_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Jobs left `running` longer than this are released (seconds).
pub const JOB_RESCUE_AFTER_SECS: u64 = 3_600;

/// Interval between sweeps for jobs orphaned while the worker runs (seconds).
pub const JOB_RESCUE_INTERVAL_SECS: u64 = 60;

/// First retry delay; doubled per attempt (seconds).
pub const JOB_BACKOFF_BASE_SECS: u64 = 2;

/// Upper bound on any retry delay (seconds).
pub const JOB_BACKOFF_MAX_SECS: u64 = 3_600;

/// PostgreSQL NOTIFY channel carrying the queue name of newly inserted jobs.
pub const JOB_NOTIFY_CHANNEL: &str = "hearth_jobs";

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// EMBEDDING
// =============================================================================

/// Maximum in-flight embedding sub-tasks within one fan-out job.
pub const EMBED_FANOUT_CONCURRENCY: usize = 10;

/// Queue that embedding jobs run on.
pub const EMBED_QUEUE: &str = "embeddings";

// =============================================================================
// CACHE
// =============================================================================

/// Interval between expired-entry sweeps (seconds).
pub const CACHE_REAP_INTERVAL_SECS: u64 = 600;

/// TTL for fetched web pages (seconds).
pub const CACHE_WEB_READER_TTL_SECS: u64 = 86_400;

/// TTL for web search results (seconds).
pub const CACHE_WEB_SEARCH_TTL_SECS: u64 = 3_600;

/// TTL for generated summaries (seconds).
pub const CACHE_SUMMARY_TTL_SECS: u64 = 7 * 86_400;

// =============================================================================
// STREAMING
// =============================================================================

/// Pending bytes that trigger a mid-stream edit.
pub const STREAM_FLUSH_THRESHOLD: usize = 200;

/// Text written to the sink when the upstream stream fails.
pub const STREAM_FAILURE_NOTICE: &str =
    "Sorry, something went wrong while generating this response. Please try again.";

/// Placeholder sent when a stream starts without an existing message.
pub const STREAM_PLACEHOLDER: &str = "…";
