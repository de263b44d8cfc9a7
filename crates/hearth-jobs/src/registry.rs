//! Mapping from job kind to handler.

use std::sync::Arc;

use tracing::debug;

use hearth_core::{Error, JobKind, Result};

use crate::handler::JobHandler;

/// One handler slot per [`JobKind`].
///
/// Built once at startup and shared read-only with the engine. Lookup is an
/// exhaustive match, so adding a kind without a slot fails to compile.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    web_crawler: Option<Arc<dyn JobHandler>>,
    create_embeddings: Option<Arc<dyn JobHandler>>,
    send_email: Option<Arc<dyn JobHandler>>,
    content_summarizer: Option<Arc<dyn JobHandler>>,
    cache_reaper: Option<Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its kind. Registering a kind twice is an error.
    pub fn register<H: JobHandler + 'static>(&mut self, handler: H) -> Result<()> {
        self.register_arc(Arc::new(handler))
    }

    pub(crate) fn register_arc(&mut self, handler: Arc<dyn JobHandler>) -> Result<()> {
        let kind = handler.kind();
        let slot = self.slot_mut(kind);
        if slot.is_some() {
            return Err(Error::Config(format!(
                "handler for job kind {kind} registered twice"
            )));
        }
        *slot = Some(handler);
        debug!(subsystem = "jobs", component = "registry", job_kind = %kind, "Registered job handler");
        Ok(())
    }

    /// Handler registered for `kind`, if any.
    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        match kind {
            JobKind::WebCrawler => self.web_crawler.clone(),
            JobKind::CreateEmbeddings => self.create_embeddings.clone(),
            JobKind::SendEmail => self.send_email.clone(),
            JobKind::ContentSummarizer => self.content_summarizer.clone(),
            JobKind::CacheReaper => self.cache_reaper.clone(),
        }
    }

    /// Resolve a stored kind string to its handler.
    ///
    /// An unparseable kind is [`Error::UnknownJobKind`]; a known kind without a
    /// handler is [`Error::NotFound`]. The engine discards the job in both cases.
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn JobHandler>> {
        let parsed: JobKind = kind.parse()?;
        self.get(parsed).ok_or_else(|| {
            Error::NotFound(format!("no handler registered for job kind {parsed}"))
        })
    }

    /// Kinds with a registered handler.
    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).is_some())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds().is_empty()
    }

    fn slot_mut(&mut self, kind: JobKind) -> &mut Option<Arc<dyn JobHandler>> {
        match kind {
            JobKind::WebCrawler => &mut self.web_crawler,
            JobKind::CreateEmbeddings => &mut self.create_embeddings,
            JobKind::SendEmail => &mut self.send_email,
            JobKind::ContentSummarizer => &mut self.content_summarizer,
            JobKind::CacheReaper => &mut self.cache_reaper,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoOpHandler;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        registry.register(NoOpHandler::new(JobKind::SendEmail)).unwrap();

        let handler = registry.resolve("send_email").unwrap();
        assert_eq!(handler.kind(), JobKind::SendEmail);
        assert_eq!(registry.kinds(), vec![JobKind::SendEmail]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(NoOpHandler::new(JobKind::CacheReaper)).unwrap();
        let err = registry
            .register(NoOpHandler::new(JobKind::CacheReaper))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_kind() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.resolve("fax_machine"),
            Err(Error::UnknownJobKind(_))
        ));
    }

    #[test]
    fn test_known_kind_without_handler() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("web_crawler").err().unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
