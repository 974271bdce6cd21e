//! Shared (tier-2) cache backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{FxError, FxResult};

/// Key-value cache service shared across instances.
///
/// Values are opaque strings; expiry is enforced by the backend itself.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Fetch a live value.
    async fn get(&self, key: &str) -> FxResult<Option<String>>;

    /// Store a value that expires after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> FxResult<()>;

    /// Delete one key.
    async fn delete(&self, key: &str) -> FxResult<()>;

    /// Delete every key matching a glob pattern (`*` wildcard); returns the count.
    async fn delete_pattern(&self, pattern: &str) -> FxResult<u64>;
}

/// Glob match supporting `*` only.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// In-process stand-in for a shared cache service.
///
/// Suitable for single-instance deployments and tests; it offers no
/// sharing across processes.
#[derive(Default)]
pub struct MemoryRemoteCache {
    entries: DashMap<String, (String, Instant)>,
    unavailable: AtomicBool,
}

impl MemoryRemoteCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Simulate an outage: every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> FxResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FxError::Cache("remote cache unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteCache for MemoryRemoteCache {
    async fn get(&self, key: &str) -> FxResult<Option<String>> {
        self.check_available()?;
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> FxResult<()> {
        self.check_available()?;
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> FxResult<()> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> FxResult<u64> {
        self.check_available()?;
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let matched = glob_match(pattern, key);
            removed += u64::from(matched);
            !matched
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("currency:rate:*", "currency:rate:USD:EUR"));
        assert!(glob_match("currency:rates:all*", "currency:rates:all:EUR"));
        assert!(glob_match("currency:supported", "currency:supported"));
        assert!(glob_match("a*b*c", "a-x-b-y-c"));
        assert!(!glob_match("currency:rate:*", "currency:rates:all"));
        assert!(!glob_match("currency:supported", "currency:supported:x"));
        assert!(!glob_match("a*bc", "abc-bd"));
    }

    #[tokio::test]
    async fn test_set_get_and_expiry() {
        let cache = MemoryRemoteCache::new();

        cache.set("k", "v".to_string(), Duration::from_millis(30)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_delete_pattern() {
        let cache = MemoryRemoteCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("currency:rate:USD:EUR", "1".into(), ttl).await.unwrap();
        cache.set("currency:rate:EUR:USD", "1".into(), ttl).await.unwrap();
        cache.set("session:abc", "1".into(), ttl).await.unwrap();

        let removed = cache.delete_pattern("currency:rate:*").await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_pattern_counts_under_concurrent_inserts() {
        let cache = std::sync::Arc::new(MemoryRemoteCache::new());
        for i in 0..100 {
            cache.set(&format!("currency:rate:A:{i}"), "1".into(), Duration::from_secs(60)).await.unwrap();
        }

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..1_000 {
                    cache.set(&format!("other:{i}"), "1".into(), Duration::from_secs(60)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let removed = cache.delete_pattern("currency:*").await.unwrap();
        writer.await.unwrap();

        assert_eq!(removed, 100);
        assert_eq!(cache.len(), 1_000);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let cache = MemoryRemoteCache::new();
        cache.set_unavailable(true);

        assert!(matches!(cache.get("k").await, Err(FxError::Cache(_))));
    }
}
