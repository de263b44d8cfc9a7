//! Cache service over a [`CacheStore`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, trace, warn};

use hearth_core::{defaults, CacheEntry, CacheStore, Result};

use crate::single_flight::SingleFlight;

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Interval between expired-entry sweeps.
    pub reap_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(defaults::CACHE_REAP_INTERVAL_SECS),
        }
    }
}

impl CacheConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CACHE_REAP_INTERVAL_SECS` | `600` | Expired-entry sweep interval |
    pub fn from_env() -> Self {
        let reap_interval = std::env::var("CACHE_REAP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| Self::default().reap_interval);
        Self { reap_interval }
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}

/// Domain-scoped key/value cache.
///
/// Store failures never reach the caller: reads degrade to a miss and writes
/// to a no-op, each logged at `warn`.
#[derive(Clone)]
pub struct Cache {
    store: Option<Arc<dyn CacheStore>>,
    flights: Arc<SingleFlight>,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store: Some(store),
            flights: Arc::new(SingleFlight::new()),
        }
    }

    /// A cache that never stores anything. `run_in_cache` still deduplicates
    /// concurrent calls.
    pub fn disabled() -> Self {
        Self {
            store: None,
            flights: Arc::new(SingleFlight::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Look up a value. Expired entries are a miss even before they are reaped.
    pub async fn get(&self, domain: &str, key: &str) -> Option<JsonValue> {
        let store = self.store.as_ref()?;
        match store.get(domain, key).await {
            Ok(Some(entry)) if !entry.is_expired_at(Utc::now()) => {
                trace!(subsystem = "cache", cache_domain = domain, key, "Cache hit");
                Some(entry.value)
            }
            Ok(Some(_)) => {
                trace!(subsystem = "cache", cache_domain = domain, key, "Cache entry expired");
                None
            }
            Ok(None) => {
                trace!(subsystem = "cache", cache_domain = domain, key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(
                    subsystem = "cache",
                    op = "get",
                    cache_domain = domain,
                    key,
                    error = %e,
                    "Cache read failed, treating as miss"
                );
                None
            }
        }
    }

    /// Insert or replace a value expiring after `ttl`.
    pub async fn set(&self, domain: &str, key: &str, value: JsonValue, ttl: Duration) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let entry = CacheEntry {
            domain: domain.to_string(),
            key: key.to_string(),
            value,
            expires_at: expires_at(Utc::now(), ttl),
        };
        if let Err(e) = store.set(entry).await {
            warn!(
                subsystem = "cache",
                op = "set",
                cache_domain = domain,
                key,
                error = %e,
                "Cache write failed"
            );
        }
    }

    pub async fn delete(&self, domain: &str, key: &str) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(e) = store.delete(domain, key).await {
            warn!(
                subsystem = "cache",
                op = "delete",
                cache_domain = domain,
                key,
                error = %e,
                "Cache delete failed"
            );
        }
    }

    /// Remove every entry expired at `now`. Returns rows removed (0 on failure).
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> u64 {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        match store.delete_expired(now).await {
            Ok(removed) => {
                debug!(subsystem = "cache", op = "delete_expired", row_count = removed, "Reaped expired cache entries");
                removed
            }
            Err(e) => {
                warn!(subsystem = "cache", op = "delete_expired", error = %e, "Cache reap failed");
                0
            }
        }
    }

    /// Typed [`get`](Self::get). A stored value that no longer decodes is a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, domain: &str, key: &str) -> Option<T> {
        let value = self.get(domain, key).await?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(
                    subsystem = "cache",
                    cache_domain = domain,
                    key,
                    error = %e,
                    "Cached value does not decode, treating as miss"
                );
                None
            }
        }
    }

    /// Typed [`set`](Self::set).
    pub async fn set_json<T: Serialize>(&self, domain: &str, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_value(value) {
            Ok(json) => self.set(domain, key, json, ttl).await,
            Err(e) => warn!(
                subsystem = "cache",
                cache_domain = domain,
                key,
                error = %e,
                "Value does not serialize, not cached"
            ),
        }
    }

    /// Return the cached value for `(domain, key)`, or compute, store, and return it.
    ///
    /// Concurrent calls for the same key in this process run `compute` once;
    /// the others wait for and receive its result. Errors from `compute`
    /// propagate and nothing is stored.
    pub async fn run_in_cache<T, F, Fut>(
        &self,
        domain: &str,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get_json::<T>(domain, key).await {
            return Ok(hit);
        }

        let flight_key = format!("{domain}:{key}");
        let value = self
            .flights
            .run(&flight_key, || async move {
                // A flight that settled between our miss and now has stored it.
                if let Some(hit) = self.get(domain, key).await {
                    return Ok(hit);
                }
                let start = Instant::now();
                let computed = compute().await?;
                let value = serde_json::to_value(&computed)?;
                self.set(domain, key, value.clone(), ttl).await;
                debug!(
                    subsystem = "cache",
                    op = "run_in_cache",
                    cache_domain = domain,
                    key,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Computed and cached value"
                );
                Ok(value)
            })
            .await?;

        Ok(serde_json::from_value(value)?)
    }
}

fn expires_at(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
