//! Content summarization with the generation backend, memoized per content key.
//!
//! Uses a map-reduce strategy for large content:
//! 1. If text < chunk_size: summarize directly
//! 2. If text >= chunk_size: split → summarize chunks → summarize summaries

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use hearth_cache::{domains, Cache};
use hearth_core::{
    defaults, ContentSummarizerArgs, Error, GenerationBackend, JobKind, Result,
};

use crate::handler::{JobContext, JobHandler, JobResult, TransactionScope};

const SYSTEM_PROMPT: &str =
    "You are a precise summarizer. Keep names, numbers and dates exactly as written.";

/// Handler for [`JobKind::ContentSummarizer`].
pub struct ContentSummarizerHandler {
    cache: Cache,
    backend: Arc<dyn GenerationBackend>,
    chunk_size: usize,
    max_summary_length: usize,
}

impl ContentSummarizerHandler {
    pub fn new(cache: Cache, backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            cache,
            backend,
            chunk_size: 4000,
            max_summary_length: 500,
        }
    }

    /// Set the chunk size for map-reduce splitting (default: 4000).
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Set the target maximum summary length (default: 500).
    pub fn with_max_summary_length(mut self, length: usize) -> Self {
        self.max_summary_length = length;
        self
    }

    /// Summarize `text`, splitting it first when it exceeds the chunk size.
    pub async fn summarize(&self, text: &str) -> Result<String> {
        if text.len() < self.chunk_size {
            return self.summarize_direct(text).await;
        }

        let chunks = self.split_into_chunks(text);
        let mut summaries = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            summaries.push(self.summarize_direct(chunk).await?);
        }
        if summaries.len() == 1 {
            return Ok(summaries.remove(0));
        }
        debug!(chunks = summaries.len(), "Combining chunk summaries");
        self.summarize_direct(&summaries.join("\n\n")).await
    }

    /// Split on line boundaries into chunks of roughly `chunk_size` bytes.
    fn split_into_chunks(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();

        for line in text.lines() {
            if !current.is_empty() && current.len() + line.len() + 1 > self.chunk_size {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        if chunks.is_empty() {
            chunks.push(text.to_string());
        }
        chunks
    }

    async fn summarize_direct(&self, text: &str) -> Result<String> {
        let prompt = format!(
            "Summarize the following text in approximately {} characters or less. \
            Focus on the key points and main ideas:\n\n{}",
            self.max_summary_length, text
        );
        let summary = self.backend.generate_with_system(SYSTEM_PROMPT, &prompt).await?;
        Ok(summary.trim().to_string())
    }
}

#[async_trait]
impl JobHandler for ContentSummarizerHandler {
    fn kind(&self) -> JobKind {
        JobKind::ContentSummarizer
    }

    // Generation can take minutes; don't hold a transaction open across it.
    fn transaction_scope(&self) -> TransactionScope {
        TransactionScope::Handler
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let args: ContentSummarizerArgs = match ctx.args() {
            Ok(args) => args,
            Err(e) => return e.into(),
        };
        if args.content.trim().is_empty() {
            return Error::InvalidInput("nothing to summarize".into()).into();
        }
        if args.content_key.is_empty() {
            return Error::InvalidInput("content_key must not be empty".into()).into();
        }

        let ttl = domains::default_ttl(domains::SUMMARY)
            .unwrap_or(Duration::from_secs(defaults::CACHE_SUMMARY_TTL_SECS));
        let summary: String = match self
            .cache
            .run_in_cache(domains::SUMMARY, &args.content_key, ttl, || {
                self.summarize(&args.content)
            })
            .await
        {
            Ok(summary) => summary,
            Err(e) => return e.into(),
        };

        info!(
            subsystem = "jobs",
            component = "summarizer",
            job_id = %ctx.job_id(),
            content_key = %args.content_key,
            summary_len = summary.len(),
            "Content summarized"
        );
        JobResult::Success(Some(json!({
            "content_key": args.content_key,
            "summary": summary,
            "model": self.backend.model_name(),
        })))
    }
}
