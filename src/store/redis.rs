//! Redis-backed counter store.
//!
//! Counters are shared across all nodes pointing at the same Redis, so
//! limits are enforced fleet-wide. Expiry is delegated to Redis TTLs.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::error::Result;

use super::{CounterKey, CounterStore, StoreError, WindowSnapshot};

/// The increment and the expiry-set of a fresh key must be one atomic
/// operation, or a crash between them leaves a counter that never expires.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Redis implementation of [`CounterStore`].
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis and return a store using the given key prefix.
    ///
    /// Connection failures here are startup errors; transient failures
    /// after startup degrade to fail-open instead.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
        })
    }

    fn key_for(&self, key: &CounterKey) -> String {
        format!("{}:{}", self.key_prefix, key.to_store_key())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(
        &self,
        key: &CounterKey,
        window: Duration,
    ) -> std::result::Result<WindowSnapshot, StoreError> {
        let window_secs = window.as_secs().max(1);
        let mut connection = self.connection.clone();

        let count: u64 = Script::new(INCREMENT_SCRIPT)
            .key(self.key_for(key))
            .arg(window_secs)
            .invoke_async(&mut connection)
            .await
            .map_err(|error| StoreError::Backend(error.to_string()))?;

        Ok(WindowSnapshot {
            count,
            expires_at: key.window_start + window_secs,
        })
    }
}
