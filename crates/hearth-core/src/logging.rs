//! Structured logging field names for hearth.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation can query by the same names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (chunks, stream fragments) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "cache", "jobs", "inference", "server"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "worker", "poller", "scheduler", "single_flight"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim", "complete", "run_in_cache", "flush"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job kind string.
pub const JOB_KIND: &str = "job_kind";

/// Queue name.
pub const QUEUE: &str = "queue";

/// Attempt number of the current execution.
pub const ATTEMPT: &str = "attempt";

/// Cache domain.
pub const CACHE_DOMAIN: &str = "cache_domain";

/// Embedding document id.
pub const DOCUMENT_ID: &str = "document_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of chunks processed.
pub const CHUNK_COUNT: &str = "chunk_count";

/// Number of rows affected.
pub const ROW_COUNT: &str = "row_count";

/// Byte length of text flushed to a sink.
pub const FLUSH_LEN: &str = "flush_len";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
