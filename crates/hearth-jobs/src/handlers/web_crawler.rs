//! Fetch a web page through the reader collaborator, memoized by URL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use hearth_cache::{domains, Cache};
use hearth_core::{defaults, Error, JobKind, WebCrawlerArgs, WebPage, WebReader};

use crate::handler::{JobContext, JobHandler, JobResult, TransactionScope};

/// Handler for [`JobKind::WebCrawler`].
pub struct WebCrawlerHandler {
    cache: Cache,
    reader: Arc<dyn WebReader>,
}

impl WebCrawlerHandler {
    pub fn new(cache: Cache, reader: Arc<dyn WebReader>) -> Self {
        Self { cache, reader }
    }
}

#[async_trait]
impl JobHandler for WebCrawlerHandler {
    fn kind(&self) -> JobKind {
        JobKind::WebCrawler
    }

    fn transaction_scope(&self) -> TransactionScope {
        TransactionScope::Handler
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let args: WebCrawlerArgs = match ctx.args() {
            Ok(args) => args,
            Err(e) => return e.into(),
        };
        let url = args.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Error::InvalidInput(format!("not an http(s) url: {url:?}")).into();
        }

        let ttl = domains::default_ttl(domains::WEB_READER)
            .unwrap_or(Duration::from_secs(defaults::CACHE_WEB_READER_TTL_SECS));
        let page: WebPage = match self
            .cache
            .run_in_cache(domains::WEB_READER, &domains::hashed_key(url), ttl, || {
                self.reader.read(url)
            })
            .await
        {
            Ok(page) => page,
            Err(e) => return e.into(),
        };

        info!(
            subsystem = "jobs",
            component = "web_crawler",
            job_id = %ctx.job_id(),
            url,
            content_len = page.content.len(),
            "Web page read"
        );
        JobResult::Success(Some(json!({
            "url": page.url,
            "title": page.title,
            "content_len": page.content.len(),
        })))
    }
}
