//! Well-known cache domains.
//!
//! Unrelated consumers share one physical store; the domain keeps their keys
//! from colliding.

use std::time::Duration;

use sha2::{Digest, Sha256};

use hearth_core::defaults;

/// Readable content of fetched web pages, keyed by hashed URL.
pub const WEB_READER: &str = "web_reader";

/// Web search results, keyed by hashed query.
pub const WEB_SEARCH: &str = "web_search";

/// Generated summaries, keyed by content key.
pub const SUMMARY: &str = "summary";

/// Default time-to-live for a well-known domain, `None` for business domains.
pub fn default_ttl(domain: &str) -> Option<Duration> {
    let secs = match domain {
        WEB_READER => defaults::CACHE_WEB_READER_TTL_SECS,
        WEB_SEARCH => defaults::CACHE_WEB_SEARCH_TTL_SECS,
        SUMMARY => defaults::CACHE_SUMMARY_TTL_SECS,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Fixed-length key for arbitrary input (URLs, queries, prompts).
pub fn hashed_key(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}
