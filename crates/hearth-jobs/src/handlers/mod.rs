//! Handlers for each job kind.

mod cache_reaper;
mod content_summarizer;
mod embeddings;
mod send_email;
mod web_crawler;

pub use cache_reaper::CacheReaperHandler;
pub use content_summarizer::ContentSummarizerHandler;
pub use embeddings::CreateEmbeddingsHandler;
pub use send_email::SendEmailHandler;
pub use web_crawler::WebCrawlerHandler;
