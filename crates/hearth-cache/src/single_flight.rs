//! In-process single-flight: concurrent callers for one key share one computation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;

use hearth_core::Result;

type Flight = Arc<OnceCell<JsonValue>>;

/// Deduplicates concurrent computations keyed by string.
///
/// The first caller for a key runs its `init`; callers arriving while it is in
/// flight wait and receive the same value. If the running `init` fails or is
/// cancelled, one waiter runs its own `init` instead. Once the flight settles
/// the key is forgotten, so later callers start fresh.
#[derive(Default)]
pub struct SingleFlight {
    flights: Mutex<HashMap<String, Flight>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, init: F) -> Result<JsonValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JsonValue>>,
    {
        let flight = {
            let mut flights = self.lock();
            flights.entry(key.to_string()).or_default().clone()
        };

        let result = flight.get_or_try_init(init).await.cloned();

        let mut flights = self.lock();
        if flights
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &flight))
        {
            flights.remove(key);
        }
        result
    }

    /// Number of keys with a computation in progress.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Flight>> {
        // The map holds no invariant a panicking holder could break.
        self.flights.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::Error;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_init() {
        let flights = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run("k", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("value"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!("value"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_init_is_not_remembered() {
        let flights = SingleFlight::new();
        let err = flights
            .run("k", || async { Err(Error::Inference("down".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inference(_)));

        let value = flights.run("k", || async { Ok(json!(2)) }).await.unwrap();
        assert_eq!(value, json!(2));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_share() {
        let flights = SingleFlight::new();
        let a = flights.run("a", || async { Ok(json!("a")) }).await.unwrap();
        let b = flights.run("b", || async { Ok(json!("b")) }).await.unwrap();
        assert_ne!(a, b);
    }
}
