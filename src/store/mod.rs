//! Counter store abstraction.
//!
//! Rate limit counters live in a shared store with atomic
//! increment-with-expiry semantics. This module defines the store trait,
//! the composite counter key, and the retry/fail-open wrapper used by the
//! middleware. Two backends are provided: [`MemoryStore`] for single-node
//! deployments and tests, and [`RedisStore`] for shared state.
//!
//! Fixed-window tradeoff: two concurrent requests racing for the same
//! window may both observe a count that permits them even if their
//! combined count exceeds the ceiling by one. Enforcement is eventual,
//! not strict.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ratelimit::policy::RouteClass;

/// Errors from a counter store backend.
///
/// Timeouts are enforced by the retry wrapper, not the backends, so a
/// slow store surfaces as an elapsed deadline rather than an error value.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Key identifying one rate limit counter.
///
/// The window start is floored to the window boundary, so all requests in
/// the same window share a key and a fresh window produces a fresh key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The resolved client key.
    pub client: String,
    /// The route class being counted.
    pub class: RouteClass,
    /// Window start, epoch seconds, floored to the window boundary.
    pub window_start: u64,
}

impl CounterKey {
    /// Create a key for the window containing `now_epoch`.
    pub fn new(client: &str, class: RouteClass, now_epoch: u64, window: Duration) -> Self {
        let window_secs = window.as_secs().max(1);
        Self {
            client: client.to_string(),
            class,
            window_start: (now_epoch / window_secs) * window_secs,
        }
    }

    /// Render the key for the backing store.
    /// Format: "ratelimit|{client}|{class}|{window_start}"
    pub fn to_store_key(&self) -> String {
        format!(
            "ratelimit|{}|{}|{}",
            self.client, self.class, self.window_start
        )
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

/// The state of one counter window after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Requests counted in this window, including the current one.
    pub count: u64,
    /// Epoch second at which the window expires.
    pub expires_at: u64,
}

/// Outcome of consulting the counter store for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    /// The request was counted.
    Counted(WindowSnapshot),
    /// The store was skipped (bypass identity or unlimited class).
    Skipped,
    /// The store could not be reached; the decision engine fails open.
    Unavailable,
}

/// Trait for counter store backends.
///
/// Implementations must make the increment and the expiry-set of a fresh
/// key a single atomic operation, and must not lose updates under
/// concurrent increments of the same key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter for `key`, creating it with an
    /// expiry of `window` on first touch.
    ///
    /// The counter increments even for requests that will be denied; the
    /// window-scoped key expires with the window, so growth is bounded.
    async fn increment(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> std::result::Result<WindowSnapshot, StoreError>;
}

/// Bounds on the store round trip.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Deadline for a single store call.
    pub timeout: Duration,
    /// Base backoff before the single retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(150),
            backoff: Duration::from_millis(25),
        }
    }
}

/// Increment with a bounded timeout and one jittered retry.
///
/// Any failure after the retry degrades to [`StoreStatus::Unavailable`];
/// the caller never sees a store error.
pub async fn increment_with_retry(
    store: &dyn CounterStore,
    key: &CounterKey,
    window: Duration,
    retry: &RetryPolicy,
) -> StoreStatus {
    for attempt in 0..2u8 {
        match tokio::time::timeout(retry.timeout, store.increment(key, window)).await {
            Ok(Ok(snapshot)) => return StoreStatus::Counted(snapshot),
            Ok(Err(error)) => {
                debug!(key = %key, attempt, error = %error, "counter store call failed");
            }
            Err(_) => {
                debug!(key = %key, attempt, "counter store call timed out");
            }
        }

        if attempt == 0 {
            let jitter = rand::thread_rng().gen_range(0..=retry.backoff.as_millis() as u64);
            tokio::time::sleep(retry.backoff + Duration::from_millis(jitter)).await;
        }
    }

    warn!(key = %key, "counter store unavailable, failing open");
    counter!("rate_limit_store_failures_total").increment(1);
    StoreStatus::Unavailable
}

/// Current time as epoch seconds.
pub fn epoch_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Store that fails a configurable number of times before succeeding.
    struct FlakyStore {
        failures: AtomicU64,
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn increment(
            &self,
            key: &CounterKey,
            window: Duration,
        ) -> std::result::Result<WindowSnapshot, StoreError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Backend("connection refused".to_string()));
            }
            Ok(WindowSnapshot {
                count: 1,
                expires_at: key.window_start + window.as_secs(),
            })
        }
    }

    fn test_key() -> CounterKey {
        CounterKey::new("ip:203.0.113.9", RouteClass::Api, 120, Duration::from_secs(60))
    }

    #[test]
    fn test_key_floors_window_start() {
        let key = CounterKey::new("ip:1.2.3.4", RouteClass::Api, 125, Duration::from_secs(60));
        assert_eq!(key.window_start, 120);

        let key = CounterKey::new("ip:1.2.3.4", RouteClass::Api, 179, Duration::from_secs(60));
        assert_eq!(key.window_start, 120);

        let key = CounterKey::new("ip:1.2.3.4", RouteClass::Api, 180, Duration::from_secs(60));
        assert_eq!(key.window_start, 180);
    }

    #[test]
    fn test_key_rendering() {
        let key = test_key();
        assert_eq!(key.to_store_key(), "ratelimit|ip:203.0.113.9|api|120");
    }

    #[test]
    fn test_same_window_same_key() {
        let a = CounterKey::new("ip:1.2.3.4", RouteClass::Api, 121, Duration::from_secs(60));
        let b = CounterKey::new("ip:1.2.3.4", RouteClass::Api, 150, Duration::from_secs(60));
        assert_eq!(a, b);
    }

    #[test]
    fn test_classes_do_not_share_keys() {
        let api = CounterKey::new("ip:1.2.3.4", RouteClass::Api, 121, Duration::from_secs(60));
        let auth = CounterKey::new("ip:1.2.3.4", RouteClass::Auth, 121, Duration::from_secs(60));
        assert_ne!(api.to_store_key(), auth.to_store_key());
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let store = FlakyStore {
            failures: AtomicU64::new(1),
        };
        let status = increment_with_retry(
            &store,
            &test_key(),
            Duration::from_secs(60),
            &RetryPolicy {
                timeout: Duration::from_millis(50),
                backoff: Duration::from_millis(1),
            },
        )
        .await;

        assert!(matches!(status, StoreStatus::Counted(_)));
    }

    #[tokio::test]
    async fn test_persistent_failure_degrades_to_unavailable() {
        let store = FlakyStore {
            failures: AtomicU64::new(u64::MAX),
        };
        let status = increment_with_retry(
            &store,
            &test_key(),
            Duration::from_secs(60),
            &RetryPolicy {
                timeout: Duration::from_millis(50),
                backoff: Duration::from_millis(1),
            },
        )
        .await;

        assert_eq!(status, StoreStatus::Unavailable);
    }
}
