//! Token streams produced by streaming generation backends.

use std::pin::Pin;

use futures::{stream, Stream};

use hearth_core::Result;

/// Stream of generation fragments.
///
/// An empty fragment is a keep-alive. The stream ending is end-of-stream; an
/// `Err` item is a fatal upstream failure.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Streaming generation trait extension.
#[async_trait::async_trait]
pub trait StreamingGeneration: Send + Sync {
    /// Generate text with streaming response.
    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream>;

    /// Generate text with system context and streaming response.
    async fn generate_with_system_stream(&self, system: &str, prompt: &str) -> Result<TokenStream>;
}

/// Build a [`TokenStream`] from already-known items.
pub fn token_stream<I>(items: I) -> TokenStream
where
    I: IntoIterator<Item = Result<String>>,
    I::IntoIter: Send + 'static,
{
    Box::pin(stream::iter(items))
}
