//! Periodic sweep of expired cache entries.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use hearth_cache::Cache;
use hearth_core::{CacheReaperArgs, JobKind};

use crate::handler::{JobContext, JobHandler, JobResult, TransactionScope};

/// Handler for [`JobKind::CacheReaper`].
pub struct CacheReaperHandler {
    cache: Cache,
}

impl CacheReaperHandler {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl JobHandler for CacheReaperHandler {
    fn kind(&self) -> JobKind {
        JobKind::CacheReaper
    }

    // Deletes through the cache store's own connection.
    fn transaction_scope(&self) -> TransactionScope {
        TransactionScope::Handler
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        if let Err(e) = ctx.args::<CacheReaperArgs>() {
            return e.into();
        }
        // Store errors are logged inside the cache layer and count as zero.
        let removed = self.cache.delete_expired(Utc::now()).await;
        info!(
            subsystem = "jobs",
            component = "cache_reaper",
            row_count = removed,
            "Expired cache entries reaped"
        );
        JobResult::Success(Some(json!({ "removed": removed })))
    }
}
