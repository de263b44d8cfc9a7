//! # hearth-core
//!
//! Core types, traits, and abstractions for hearth.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the other hearth crates depend on: the job model and state machine,
//! typed job args, cache and embedding records, the retry policy, and the
//! repository and collaborator traits.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod retry;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use retry::{FailureDisposition, RetryPolicy};
pub use traits::*;
