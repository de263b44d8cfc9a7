//! Streaming chunk delivery: turn a token stream into throttled edits of one
//! outbound message.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, trace, warn};

use hearth_cache::Cache;
use hearth_core::{defaults, Error, Result};

use crate::streaming::TokenStream;

/// Outbound message surface (chat or bot message) that text is delivered to.
///
/// `edit` and `finalize` may return a new handle; later writes must target it.
#[async_trait]
pub trait MessageSink: Send + Sync {
    type Handle: Clone + Send + Sync;

    /// Post a new message.
    async fn send(&self, text: &str) -> Result<Self::Handle>;

    /// Replace the message text mid-stream.
    async fn edit(&self, handle: &Self::Handle, text: &str) -> Result<Self::Handle>;

    /// Terminal write of the complete text. Defaults to `edit`.
    async fn finalize(&self, handle: &Self::Handle, text: &str) -> Result<Self::Handle> {
        self.edit(handle, text).await
    }
}

/// Streaming delivery configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Pending bytes at which a mid-stream edit is issued.
    pub flush_threshold: usize,
    /// Text written in place of the message when the upstream fails.
    pub failure_notice: String,
    /// Text of the initial message when no handle is supplied.
    pub placeholder: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_threshold: defaults::STREAM_FLUSH_THRESHOLD,
            failure_notice: defaults::STREAM_FAILURE_NOTICE.to_string(),
            placeholder: defaults::STREAM_PLACEHOLDER.to_string(),
        }
    }
}

impl StreamConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `STREAM_FLUSH_THRESHOLD` | `200` | Pending bytes per mid-stream edit |
    pub fn from_env() -> Self {
        let flush_threshold = std::env::var("STREAM_FLUSH_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::STREAM_FLUSH_THRESHOLD)
            .max(1);
        Self {
            flush_threshold,
            ..Self::default()
        }
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    pub fn with_failure_notice(mut self, notice: impl Into<String>) -> Self {
        self.failure_notice = notice.into();
        self
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }
}

/// Accumulated and unflushed text of one streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBuffer {
    accumulated: String,
    pending: String,
    threshold: usize,
}

impl StreamBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            accumulated: String::new(),
            pending: String::new(),
            threshold: threshold.max(1),
        }
    }

    /// Append a fragment. Returns the full text to flush once the pending tail
    /// reaches the threshold. Empty fragments are keep-alives.
    pub fn push(&mut self, fragment: &str) -> Option<&str> {
        if fragment.is_empty() {
            return None;
        }
        self.pending.push_str(fragment);
        if self.pending.len() < self.threshold {
            return None;
        }
        self.accumulated.push_str(&self.pending);
        self.pending.clear();
        Some(&self.accumulated)
    }

    /// End-of-stream: fold the pending tail in and return the complete text.
    pub fn finish(&mut self) -> &str {
        self.accumulated.push_str(&self.pending);
        self.pending.clear();
        &self.accumulated
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }
}

/// Result of one streaming delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The stream ended and the complete text was written.
    Completed {
        text: String,
        /// Sink writes after the initial message, final write included.
        flushes: usize,
    },
    /// The upstream failed and the failure notice was written.
    Failed { error: String },
}

impl DeliveryOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DeliveryOutcome::Completed { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            DeliveryOutcome::Completed { text, .. } => Some(text),
            DeliveryOutcome::Failed { .. } => None,
        }
    }
}

/// Drives a [`TokenStream`] into a [`MessageSink`].
pub struct StreamDelivery<S: MessageSink> {
    sink: S,
    config: StreamConfig,
}

impl<S: MessageSink> StreamDelivery<S> {
    pub fn new(sink: S, config: StreamConfig) -> Self {
        Self { sink, config }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Consume `stream`, editing the message at `handle` (or a new placeholder
    /// message) as text arrives.
    ///
    /// Upstream errors end delivery with [`DeliveryOutcome::Failed`] after one
    /// failure notice; the stream is not polled again. Sink errors are returned.
    pub async fn deliver(
        &self,
        handle: Option<S::Handle>,
        mut stream: TokenStream,
    ) -> Result<DeliveryOutcome> {
        let mut handle = match handle {
            Some(handle) => handle,
            None => self.sink.send(&self.config.placeholder).await?,
        };
        let mut buffer = StreamBuffer::new(self.config.flush_threshold);
        let mut flushes = 0;

        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => {
                    if let Some(text) = buffer.push(&fragment) {
                        trace!(subsystem = "stream", flush_len = text.len(), "Mid-stream flush");
                        handle = self.sink.edit(&handle, text).await?;
                        flushes += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        subsystem = "stream",
                        error = %e,
                        delivered_len = buffer.accumulated().len(),
                        "Upstream stream failed, sending failure notice"
                    );
                    self.sink
                        .finalize(&handle, &self.config.failure_notice)
                        .await?;
                    return Ok(DeliveryOutcome::Failed {
                        error: e.to_string(),
                    });
                }
            }
        }

        let text = buffer.finish().to_string();
        self.sink.finalize(&handle, &text).await?;
        flushes += 1;
        debug!(subsystem = "stream", flush_len = text.len(), flushes, "Stream delivered");

        Ok(DeliveryOutcome::Completed { text, flushes })
    }

    /// Write already-complete text as a single final write.
    pub async fn deliver_text(&self, handle: Option<S::Handle>, text: &str) -> Result<DeliveryOutcome> {
        match handle {
            Some(handle) => {
                self.sink.finalize(&handle, text).await?;
            }
            None => {
                self.sink.send(text).await?;
            }
        }
        Ok(DeliveryOutcome::Completed {
            text: text.to_string(),
            flushes: 1,
        })
    }
}

/// Stream a generation through `delivery`, memoizing only the complete text.
///
/// On a cache hit the stored text is written in one final write and
/// `make_stream` is never called. A failed stream caches nothing.
pub async fn memoized_stream<S, F, Fut>(
    cache: &Cache,
    domain: &str,
    key: &str,
    ttl: Duration,
    delivery: &StreamDelivery<S>,
    handle: Option<S::Handle>,
    make_stream: F,
) -> Result<DeliveryOutcome>
where
    S: MessageSink,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<TokenStream>>,
{
    let streamed = AtomicBool::new(false);
    let flushes = AtomicUsize::new(0);
    let (streamed_ref, flushes_ref) = (&streamed, &flushes);
    let stream_handle = handle.clone();

    let result = cache
        .run_in_cache(domain, key, ttl, || async move {
            streamed_ref.store(true, Ordering::SeqCst);
            let stream = make_stream().await?;
            match delivery.deliver(stream_handle, stream).await? {
                DeliveryOutcome::Completed { text, flushes } => {
                    flushes_ref.store(flushes, Ordering::SeqCst);
                    Ok(text)
                }
                DeliveryOutcome::Failed { error } => Err(Error::Stream(error)),
            }
        })
        .await;

    let delivered_here = streamed.load(Ordering::SeqCst);
    match result {
        Ok(text) if delivered_here => Ok(DeliveryOutcome::Completed {
            text,
            flushes: flushes.load(Ordering::SeqCst),
        }),
        Ok(text) => delivery.deliver_text(handle, &text).await,
        Err(Error::Stream(error)) if delivered_here => Ok(DeliveryOutcome::Failed { error }),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockGenerationBackend, RecordingSink, SinkCall};
    use crate::streaming::{token_stream, StreamingGeneration};
    use hearth_db::MemoryCacheStore;
    use std::sync::Arc;

    fn fragments(items: &[&str]) -> TokenStream {
        token_stream(
            items
                .iter()
                .map(|s| Ok(s.to_string()))
                .collect::<Vec<_>>(),
        )
    }

    fn delivery(threshold: usize) -> StreamDelivery<RecordingSink> {
        StreamDelivery::new(
            RecordingSink::new(),
            StreamConfig::default()
                .with_flush_threshold(threshold)
                .with_failure_notice("generation failed"),
        )
    }

    #[tokio::test]
    async fn test_deliver_flush_boundary() {
        let delivery = delivery(4);
        let outcome = delivery
            .deliver(Some(7), fragments(&["ab", "cd", "ef"]))
            .await
            .unwrap();

        assert_eq!(delivery.sink().edits(), vec!["abcd".to_string()]);
        assert_eq!(delivery.sink().finals(), vec!["abcdef".to_string()]);
        assert_eq!(
            outcome,
            DeliveryOutcome::Completed {
                text: "abcdef".into(),
                flushes: 2
            }
        );
    }

    #[tokio::test]
    async fn test_deliver_targets_latest_handle() {
        let delivery = delivery(2);
        delivery
            .deliver(None, fragments(&["ab", "cd", "e"]))
            .await
            .unwrap();

        let calls = delivery.sink().calls();
        let SinkCall::Send { text } = &calls[0] else {
            panic!("expected placeholder send, got {:?}", calls[0]);
        };
        assert_eq!(text, defaults::STREAM_PLACEHOLDER);
        // send -> 1, first edit targets 1 and yields 2, second edit targets 2 ...
        assert_eq!(
            calls[1..].to_vec(),
            vec![
                SinkCall::Edit { handle: 1, text: "ab".into() },
                SinkCall::Edit { handle: 2, text: "abcd".into() },
                SinkCall::Finalize { handle: 3, text: "abcde".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_deliver_ignores_keep_alives() {
        let delivery = delivery(3);
        let outcome = delivery
            .deliver(Some(1), fragments(&["", "a", "", "", "b"]))
            .await
            .unwrap();
        assert!(delivery.sink().edits().is_empty());
        assert_eq!(outcome.text(), Some("ab"));
    }

    #[tokio::test]
    async fn test_deliver_error_sends_notice_and_stops() {
        let delivery = delivery(100);
        let stream = token_stream(vec![
            Ok("partial".to_string()),
            Err(Error::Inference("connection reset".into())),
            Ok("never read".to_string()),
        ]);
        let outcome = delivery.deliver(Some(1), stream).await.unwrap();

        assert_eq!(delivery.sink().finals(), vec!["generation failed".to_string()]);
        match outcome {
            DeliveryOutcome::Failed { error } => assert!(error.contains("connection reset")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deliver_empty_stream_still_finalizes() {
        let delivery = delivery(4);
        let outcome = delivery.deliver(Some(1), fragments(&[])).await.unwrap();
        assert_eq!(delivery.sink().finals(), vec![String::new()]);
        assert_eq!(outcome.text(), Some(""));
    }

    #[tokio::test]
    async fn test_deliver_sink_error_is_returned() {
        let delivery = StreamDelivery::new(
            RecordingSink::new().failing_edits(),
            StreamConfig::default().with_flush_threshold(1),
        );
        let err = delivery
            .deliver(Some(1), fragments(&["abc"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Request(_)));
    }

    #[tokio::test]
    async fn test_memoized_stream_caches_only_complete_text() {
        let cache = Cache::new(Arc::new(MemoryCacheStore::new()));
        let backend = MockGenerationBackend::new().with_fragments(["Hel", "lo"]);
        let ttl = Duration::from_secs(60);

        let first = delivery(2);
        let outcome = memoized_stream(&cache, "summary", "greeting", ttl, &first, Some(1), || {
            backend.generate_stream("hi")
        })
        .await
        .unwrap();
        assert_eq!(outcome.text(), Some("Hello"));
        assert_eq!(cache.get_json::<String>("summary", "greeting").await.as_deref(), Some("Hello"));

        // Second call is served from the cache without touching the backend.
        let second = delivery(2);
        let outcome = memoized_stream(&cache, "summary", "greeting", ttl, &second, None, || {
            backend.generate_stream("hi")
        })
        .await
        .unwrap();
        assert_eq!(outcome.text(), Some("Hello"));
        assert_eq!(backend.call_count(), 1);
        assert_eq!(second.sink().calls(), vec![SinkCall::Send { text: "Hello".into() }]);
    }

    #[tokio::test]
    async fn test_memoized_stream_failure_is_not_cached() {
        let cache = Cache::new(Arc::new(MemoryCacheStore::new()));
        let backend = MockGenerationBackend::new()
            .with_fragments(["par", "tial"])
            .failing_after(1);

        let delivery = delivery(100);
        let outcome = memoized_stream(
            &cache,
            "summary",
            "broken",
            Duration::from_secs(60),
            &delivery,
            Some(1),
            || backend.generate_stream("hi"),
        )
        .await
        .unwrap();

        assert!(!outcome.is_completed());
        assert!(cache.get("summary", "broken").await.is_none());
        assert_eq!(delivery.sink().finals(), vec!["generation failed".to_string()]);
    }

    #[test]
    fn test_buffer_flush_boundary() {
        let mut buffer = StreamBuffer::new(4);
        assert_eq!(buffer.push("ab"), None);
        assert_eq!(buffer.push("cd"), Some("abcd"));
        assert_eq!(buffer.pending(), "");
        assert_eq!(buffer.push("ef"), None);
        assert_eq!(buffer.finish(), "abcdef");
    }

    #[test]
    fn test_buffer_ignores_keep_alive() {
        let mut buffer = StreamBuffer::new(1);
        assert_eq!(buffer.push(""), None);
        assert_eq!(buffer.accumulated(), "");
        assert_eq!(buffer.finish(), "");
    }

    #[test]
    fn test_buffer_large_fragment_flushes_immediately() {
        let mut buffer = StreamBuffer::new(3);
        assert_eq!(buffer.push("hello"), Some("hello"));
        assert_eq!(buffer.push("!"), None);
        assert_eq!(buffer.finish(), "hello!");
    }

    #[test]
    fn test_stream_config_builders() {
        let config = StreamConfig::default()
            .with_flush_threshold(0)
            .with_failure_notice("oops")
            .with_placeholder("...");
        assert_eq!(config.flush_threshold, 1);
        assert_eq!(config.failure_notice, "oops");
        assert_eq!(config.placeholder, "...");
    }

    #[test]
    fn test_outcome_accessors() {
        let done = DeliveryOutcome::Completed {
            text: "hi".into(),
            flushes: 1,
        };
        assert!(done.is_completed());
        assert_eq!(done.text(), Some("hi"));
        let failed = DeliveryOutcome::Failed {
            error: "boom".into(),
        };
        assert!(!failed.is_completed());
        assert_eq!(failed.text(), None);
    }
}
