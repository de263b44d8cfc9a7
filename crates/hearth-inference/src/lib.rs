//! # hearth-inference
//!
//! Streaming generation delivery for hearth.
//!
//! This crate provides:
//! - [`TokenStream`] and the [`StreamingGeneration`] backend trait
//! - [`StreamDelivery`]: buffers a token stream and flushes it to a
//!   [`MessageSink`] at a byte threshold and at end-of-stream
//! - [`memoized_stream`]: whole-result memoization through the cache layer
//! - Deterministic mock backends (feature `mock`)
//!
//! ## Example
//!
//! ```rust,ignore
//! use hearth_inference::{StreamConfig, StreamDelivery, StreamingGeneration};
//!
//! let delivery = StreamDelivery::new(chat_sink, StreamConfig::from_env());
//! let stream = backend.generate_stream("Tell me a story").await?;
//! let outcome = delivery.deliver(None, stream).await?;
//! ```

pub mod delivery;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod streaming;

pub use delivery::{
    memoized_stream, DeliveryOutcome, MessageSink, StreamBuffer, StreamConfig, StreamDelivery,
};
pub use streaming::{token_stream, StreamingGeneration, TokenStream};
