//! Redis-backed shared cache tier.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::error::{FxError, FxResult};
use crate::remote::RemoteCache;

/// Keys requested per SCAN round trip.
const SCAN_BATCH: usize = 100;

/// Shared tier over a Redis server.
///
/// The connection manager reconnects on its own after a dropped connection;
/// callers see the failed command as [`FxError::Cache`] and the cache above
/// reports it as degraded.
#[derive(Clone)]
pub struct RedisRemoteCache {
    conn: ConnectionManager,
}

impl RedisRemoteCache {
    /// Connect to `url` (for example `redis://localhost:6379`).
    ///
    /// Gives up after `timeout` instead of retrying the first connection.
    pub async fn connect(url: &str, timeout: Duration) -> FxResult<Self> {
        let client = redis::Client::open(url).map_err(cache_error)?;
        let conn = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| FxError::Cache(format!("connect timed out after {timeout:?}")))?
            .map_err(cache_error)?;

        info!("Connected to Redis cache tier");
        Ok(Self { conn })
    }
}

fn cache_error(e: redis::RedisError) -> FxError {
    FxError::Cache(e.to_string())
}

/// Redis expiries are whole seconds and must be positive.
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl RemoteCache for RedisRemoteCache {
    async fn get(&self, key: &str) -> FxResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> FxResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expiry_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(cache_error)
    }

    async fn delete(&self, key: &str) -> FxResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> FxResult<u64> {
        let mut conn = self.conn.clone();
        let mut cursor = 0u64;
        let mut removed = 0u64;

        // SCAN rather than KEYS: never blocks the server on a large keyspace.
        loop {
            let (next, keys) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<_, (u64, Vec<String>)>(&mut conn)
                .await
                .map_err(cache_error)?;

            if !keys.is_empty() {
                removed += redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, u64>(&mut conn)
                    .await
                    .map_err(cache_error)?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern, removed, "Redis keys deleted");
        Ok(removed)
    }
}
