//! # hearth-cache
//!
//! Domain-scoped key/value cache for hearth.
//!
//! This crate provides:
//! - [`Cache`]: get, set-with-ttl, delete, and delete-expired over any
//!   [`CacheStore`](hearth_core::CacheStore), degrading to a miss on store failure
//! - [`Cache::run_in_cache`]: memoization with an in-process single-flight so
//!   concurrent callers for one key compute once
//! - Well-known [`domains`] and their default TTLs
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hearth_cache::{domains, Cache};
//!
//! let cache = Cache::new(Arc::new(db.cache.clone()));
//! let summary: String = cache
//!     .run_in_cache(domains::SUMMARY, "doc-42", ttl, || async {
//!         backend.generate("Summarize ...").await
//!     })
//!     .await?;
//! ```

mod cache;
pub mod domains;
pub mod single_flight;

pub use cache::{Cache, CacheConfig};
pub use single_flight::SingleFlight;
