//! Mock backends and sinks for deterministic testing.
//!
//! ```rust,ignore
//! use hearth_inference::mock::{MockEmbeddingBackend, RecordingSink};
//!
//! let backend = MockEmbeddingBackend::new().with_dimension(8).with_latency_ms(5);
//! // ... run a fan-out job ...
//! assert!(backend.peak_in_flight() <= 10);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use hearth_core::{EmbeddingBackend, Error, GenerationBackend, Result, Vector};

use crate::delivery::MessageSink;
use crate::streaming::{token_stream, StreamingGeneration, TokenStream};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// EMBEDDING
// =============================================================================

/// Deterministic embedding backend that records concurrency.
#[derive(Clone)]
pub struct MockEmbeddingBackend {
    dimension: usize,
    latency: Duration,
    failing_texts: Arc<HashSet<String>>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Default for MockEmbeddingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbeddingBackend {
    pub fn new() -> Self {
        Self {
            dimension: 16,
            latency: Duration::ZERO,
            failing_texts: Arc::new(HashSet::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension.max(1);
        self
    }

    /// Simulated latency per call; keeps calls overlapping in concurrency tests.
    pub fn with_latency_ms(mut self, ms: u64) -> Self {
        self.latency = Duration::from_millis(ms);
        self
    }

    /// Calls for exactly this text fail with [`Error::Embedding`].
    pub fn failing_on(mut self, text: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.failing_texts).insert(text.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Same text, same vector: character codes folded into a unit vector.
    pub fn vector_for(text: &str, dimension: usize) -> Vec<f32> {
        let mut vec = vec![0.0f32; dimension];
        for (i, c) in text.chars().enumerate() {
            vec[(c as usize + i) % dimension] += 0.1;
        }
        let magnitude: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            vec.iter_mut().for_each(|x| *x /= magnitude);
        }
        vec
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed_text(&self, text: &str) -> Result<Vector> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing_texts.contains(text) {
            return Err(Error::Embedding(format!("simulated failure for {text:?}")));
        }
        Ok(Vector::from(Self::vector_for(text, self.dimension)))
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

// =============================================================================
// GENERATION
// =============================================================================

/// Generation backend returning a fixed response, optionally as fragments.
#[derive(Clone)]
pub struct MockGenerationBackend {
    fragments: Vec<String>,
    fail_after: Option<usize>,
    calls: Arc<AtomicUsize>,
}

impl Default for MockGenerationBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGenerationBackend {
    pub fn new() -> Self {
        Self {
            fragments: vec!["Mock response".to_string()],
            fail_after: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set a fixed response delivered as one fragment.
    pub fn with_fixed_response(self, response: impl Into<String>) -> Self {
        self.with_fragments([response.into()])
    }

    /// Set the fragments a stream yields; `generate` returns them joined.
    pub fn with_fragments<I, S>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fragments = fragments.into_iter().map(Into::into).collect();
        self
    }

    /// Streams yield an error after `n` fragments; `generate` fails outright.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn stream(&self) -> TokenStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut items: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(Error::Inference("simulated stream failure".into())));
        }
        token_stream(items)
    }
}

#[async_trait]
impl GenerationBackend for MockGenerationBackend {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some() {
            return Err(Error::Inference("simulated failure".into()));
        }
        Ok(self.fragments.concat())
    }

    async fn generate_with_system(&self, _system: &str, prompt: &str) -> Result<String> {
        self.generate(prompt).await
    }

    fn model_name(&self) -> &str {
        "mock-generate"
    }
}

#[async_trait]
impl StreamingGeneration for MockGenerationBackend {
    async fn generate_stream(&self, _prompt: &str) -> Result<TokenStream> {
        Ok(self.stream())
    }

    async fn generate_with_system_stream(&self, _system: &str, _prompt: &str) -> Result<TokenStream> {
        Ok(self.stream())
    }
}

// =============================================================================
// SINK
// =============================================================================

/// One write observed by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Send { text: String },
    Edit { handle: u64, text: String },
    Finalize { handle: u64, text: String },
}

/// Message sink that records writes. Every edit returns a fresh handle.
#[derive(Clone, Default)]
pub struct RecordingSink {
    calls: Arc<Mutex<Vec<SinkCall>>>,
    next_handle: Arc<AtomicUsize>,
    fail_edits: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `edit` fail, simulating a rejected message update.
    pub fn failing_edits(mut self) -> Self {
        self.fail_edits = true;
        self
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        lock(&self.calls).clone()
    }

    /// Texts of mid-stream edits, in order.
    pub fn edits(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                SinkCall::Edit { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Texts of final writes, in order.
    pub fn finals(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                SinkCall::Finalize { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn issue_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst) as u64 + 1
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    type Handle = u64;

    async fn send(&self, text: &str) -> Result<u64> {
        lock(&self.calls).push(SinkCall::Send {
            text: text.to_string(),
        });
        Ok(self.issue_handle())
    }

    async fn edit(&self, handle: &u64, text: &str) -> Result<u64> {
        if self.fail_edits {
            return Err(Error::Request("message edit rejected".into()));
        }
        lock(&self.calls).push(SinkCall::Edit {
            handle: *handle,
            text: text.to_string(),
        });
        Ok(self.issue_handle())
    }

    async fn finalize(&self, handle: &u64, text: &str) -> Result<u64> {
        lock(&self.calls).push(SinkCall::Finalize {
            handle: *handle,
            text: text.to_string(),
        });
        Ok(*handle)
    }
}
