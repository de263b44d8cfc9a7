//! # hearth-jobs
//!
//! Durable background job engine for hearth.
//!
//! This crate provides:
//! - Typed enqueue, including enqueue inside a caller's transaction
//! - Per-queue pollers with bounded worker pools
//! - Per-execution transactions that commit with the job's completion
//! - Retry with exponential backoff and a dead-letter state
//! - Periodic rescue of jobs orphaned by a crashed worker
//! - Periodic jobs with optional non-overlap
//! - Handlers for every job kind, including bounded embedding fan-out
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hearth_jobs::{JobClient, WorkerBuilder, WorkerConfig, CacheReaperHandler, InsertOpts};
//!
//! let db = hearth_db::Database::connect("postgres://...").await?;
//! let client = JobClient::postgres(db.jobs.clone());
//!
//! let worker = WorkerBuilder::new(Arc::new(db.jobs.clone()))
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(CacheReaperHandler::new(cache))
//!     .build()?;
//! let handle = worker.start().await?;
//!
//! let mut tx = db.pool.begin().await?;
//! // ... business writes on `tx` ...
//! client.insert_tx(&mut tx, &args, InsertOpts::default()).await?;
//! tx.commit().await?;
//!
//! handle.stop().await?;
//! ```

pub mod client;
pub mod handler;
pub mod handlers;
pub mod periodic;
pub mod registry;
pub mod worker;

// Re-export core types
pub use hearth_core::*;

pub use client::JobClient;
pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler, TransactionScope};
pub use handlers::{
    CacheReaperHandler, ContentSummarizerHandler, CreateEmbeddingsHandler, SendEmailHandler,
    WebCrawlerHandler,
};
pub use periodic::{PeriodicJob, PeriodicScheduler, Schedule};
pub use registry::HandlerRegistry;
pub use worker::{
    parse_queues, JobWorker, QueueConfig, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle,
};
