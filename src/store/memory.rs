//! In-memory counter store.
//!
//! Fixed-window counters in a concurrent map. Used when no external store
//! is configured, and by tests. Counters are scoped to a single process,
//! so limits are enforced per node rather than fleet-wide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{epoch_now, CounterKey, CounterStore, StoreError, WindowSnapshot};

/// One counter window.
struct WindowEntry {
    count: AtomicU64,
    expires_at: u64,
}

/// In-memory implementation of [`CounterStore`].
///
/// The backing store's expiry mechanism is an explicit sweep task owned by
/// this instance: it runs on its own timer, removes expired windows, and
/// is aborted when the store is dropped.
pub struct MemoryStore {
    entries: Arc<DashMap<String, WindowEntry>>,
    sweeper: Option<JoinHandle<()>>,
}

impl MemoryStore {
    /// Create a store whose sweep task runs every `sweep_interval`.
    pub fn new(sweep_interval: Duration) -> Self {
        let entries: Arc<DashMap<String, WindowEntry>> = Arc::new(DashMap::new());

        let sweep_entries = Arc::clone(&entries);
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = Self::sweep_map(&sweep_entries, epoch_now());
                if removed > 0 {
                    debug!(removed, "swept expired rate limit windows");
                }
            }
        });

        Self {
            entries,
            sweeper: Some(sweeper),
        }
    }

    /// Remove windows that expired at or before `now`.
    ///
    /// Returns the number of entries removed. Exposed for tests; the owned
    /// sweep task calls this on its own timer.
    pub fn sweep(&self, now: u64) -> usize {
        Self::sweep_map(&self.entries, now)
    }

    fn sweep_map(entries: &DashMap<String, WindowEntry>, now: u64) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of live counter windows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> Result<WindowSnapshot, StoreError> {
        let expires_at = key.window_start + window.as_secs();

        // Creating the entry and bumping its counter happen under the same
        // map shard guard, so a fresh window cannot lose its expiry.
        let entry = self
            .entries
            .entry(key.to_store_key())
            .or_insert_with(|| WindowEntry {
                count: AtomicU64::new(0),
                expires_at,
            });

        let count = entry.count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(WindowSnapshot {
            count,
            expires_at: entry.expires_at,
        })
    }
}
