//! Two-tier FX rate cache.
//!
//! Tier 1 is an in-process concurrent map with a short TTL. Tier 2 is a
//! shared [`RemoteCache`] with a longer TTL that survives restarts and is
//! visible to every instance. Reads go tier 1 → tier 2 (promoting hits);
//! writes go to both. Tier-2 failures never escape this module: reads
//! report them as [`CacheLookup::Degraded`] and writes log and continue.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fxrates_common::{constants, is_older_than, Currency, CurrencyPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{FxError, FxResult};
use crate::remote::RemoteCache;

/// A cached rate, as held by either tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRate {
    pub rate: Decimal,
    /// When the provider observed the rate.
    pub fetched_at: DateTime<Utc>,
    /// When the entry was inserted into the tier it was read from.
    pub cached_at: DateTime<Utc>,
}

impl CachedRate {
    fn new(rate: Decimal, fetched_at: DateTime<Utc>) -> Self {
        Self {
            rate,
            fetched_at,
            cached_at: Utc::now(),
        }
    }

    fn is_valid(&self, ttl: Duration) -> bool {
        !is_older_than(self.cached_at, ttl, Utc::now())
    }

    fn restamped(mut self) -> Self {
        self.cached_at = Utc::now();
        self
    }
}

/// All cached rates for one base currency, keyed by target.
pub type CachedRates = BTreeMap<Currency, CachedRate>;

#[derive(Debug, Clone)]
struct CachedAggregate {
    rates: CachedRates,
    cached_at: DateTime<Utc>,
}

impl CachedAggregate {
    fn is_valid(&self, ttl: Duration) -> bool {
        !is_older_than(self.cached_at, ttl, Utc::now())
    }
}

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Remote,
}

/// Outcome of a cache read.
///
/// `Degraded` means tier 2 could not be consulted. Callers treat it as a
/// miss; it exists so the ignored error is visible at the call site.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Hit { value: T, tier: CacheTier },
    Miss,
    Degraded { reason: String },
}

impl<T> CacheLookup<T> {
    /// The cached value on a hit.
    pub fn into_option(self) -> Option<T> {
        match self {
            CacheLookup::Hit { value, .. } => Some(value),
            CacheLookup::Miss | CacheLookup::Degraded { .. } => None,
        }
    }

    /// Check if this lookup was a hit.
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }
}

/// Configuration for the rate cache.
#[derive(Debug, Clone)]
pub struct RateCacheConfig {
    /// Tier-1 TTL.
    pub local_ttl: Duration,
    /// Tier-2 TTL, enforced by the remote service.
    pub remote_ttl: Duration,
    /// Interval between tier-1 expiry sweeps.
    pub cleanup_interval: Duration,
    /// Upper bound on each tier-2 call.
    pub remote_timeout: Duration,
    /// Namespace prefix for tier-2 keys.
    pub key_prefix: String,
}

impl Default for RateCacheConfig {
    fn default() -> Self {
        Self {
            local_ttl: constants::local_cache_ttl(),
            remote_ttl: constants::remote_cache_ttl(),
            cleanup_interval: constants::cache_cleanup_interval(),
            remote_timeout: constants::remote_cache_timeout(),
            key_prefix: "currency".to_string(),
        }
    }
}

/// Tier-1 storage, shared with the cleanup task.
#[derive(Default)]
struct LocalTier {
    rates: DashMap<CurrencyPair, CachedRate>,
    aggregates: DashMap<Currency, CachedAggregate>,
}

impl LocalTier {
    fn sweep(&self, ttl: Duration) -> usize {
        // Counted inside retain: writers may insert while the sweep runs.
        let mut removed = 0;
        self.rates.retain(|_, entry| {
            let keep = entry.is_valid(ttl);
            removed += usize::from(!keep);
            keep
        });
        self.aggregates.retain(|_, entry| {
            let keep = entry.is_valid(ttl);
            removed += usize::from(!keep);
            keep
        });
        removed
    }

    fn clear(&self) {
        self.rates.clear();
        self.aggregates.clear();
    }
}

/// Thread-safe two-tier rate cache.
pub struct RateCache {
    local: Arc<LocalTier>,
    remote: Option<Arc<dyn RemoteCache>>,
    config: RateCacheConfig,
}

impl RateCache {
    /// Create a cache with only the in-process tier.
    pub fn local_only(config: RateCacheConfig) -> Self {
        Self {
            local: Arc::new(LocalTier::default()),
            remote: None,
            config,
        }
    }

    /// Create a cache backed by a shared tier.
    pub fn with_remote(remote: Arc<dyn RemoteCache>, config: RateCacheConfig) -> Self {
        Self {
            local: Arc::new(LocalTier::default()),
            remote: Some(remote),
            config,
        }
    }

    /// Look up a pair: tier 1, then tier 2 with promotion.
    pub async fn get_rate(&self, pair: &CurrencyPair) -> CacheLookup<CachedRate> {
        if let Some(entry) = self.local.rates.get(pair) {
            if entry.is_valid(self.config.local_ttl) {
                debug!(pair = %pair, "Tier-1 cache hit");
                return CacheLookup::Hit {
                    value: entry.clone(),
                    tier: CacheTier::Local,
                };
            }
        }

        let Some(remote) = &self.remote else {
            debug!(pair = %pair, "Cache miss");
            return CacheLookup::Miss;
        };

        let key = self.rate_key(pair);
        match self.remote_get::<CachedRate>(remote.as_ref(), &key).await {
            Ok(Some(cached)) => {
                debug!(pair = %pair, "Tier-2 cache hit");
                let promoted = cached.restamped();
                self.local.rates.insert(pair.clone(), promoted.clone());
                CacheLookup::Hit {
                    value: promoted,
                    tier: CacheTier::Remote,
                }
            }
            Ok(None) => {
                debug!(pair = %pair, "Cache miss");
                CacheLookup::Miss
            }
            Err(e) => {
                warn!(pair = %pair, error = %e, "Tier-2 read failed, treating as miss");
                CacheLookup::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Write a pair to both tiers. Tier-2 failures are logged and ignored.
    pub async fn set_rate(&self, pair: &CurrencyPair, rate: Decimal, fetched_at: DateTime<Utc>) {
        let cached = CachedRate::new(rate, fetched_at);
        self.local.rates.insert(pair.clone(), cached.clone());

        if let Some(remote) = &self.remote {
            let key = self.rate_key(pair);
            if let Err(e) = self.remote_set(remote.as_ref(), &key, &cached).await {
                warn!(pair = %pair, error = %e, "Tier-2 write failed");
            }
        }
    }

    /// Look up the aggregate of all rates for `base`.
    pub async fn get_all_rates(&self, base: &Currency) -> CacheLookup<CachedRates> {
        if let Some(entry) = self.local.aggregates.get(base) {
            if entry.is_valid(self.config.local_ttl) {
                return CacheLookup::Hit {
                    value: entry.rates.clone(),
                    tier: CacheTier::Local,
                };
            }
        }

        let Some(remote) = &self.remote else {
            return CacheLookup::Miss;
        };

        let key = self.aggregate_key(base);
        match self.remote_get::<CachedRates>(remote.as_ref(), &key).await {
            Ok(Some(rates)) => {
                self.local.aggregates.insert(
                    base.clone(),
                    CachedAggregate {
                        rates: rates.clone(),
                        cached_at: Utc::now(),
                    },
                );
                CacheLookup::Hit {
                    value: rates,
                    tier: CacheTier::Remote,
                }
            }
            Ok(None) => CacheLookup::Miss,
            Err(e) => {
                warn!(base = %base, error = %e, "Tier-2 aggregate read failed, treating as miss");
                CacheLookup::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Write the aggregate of all rates for `base` to both tiers.
    pub async fn set_all_rates(
        &self,
        base: &Currency,
        rates: &BTreeMap<Currency, Decimal>,
        fetched_at: DateTime<Utc>,
    ) {
        let cached: CachedRates = rates
            .iter()
            .map(|(target, rate)| (target.clone(), CachedRate::new(*rate, fetched_at)))
            .collect();

        self.local.aggregates.insert(
            base.clone(),
            CachedAggregate {
                rates: cached.clone(),
                cached_at: Utc::now(),
            },
        );

        if let Some(remote) = &self.remote {
            let key = self.aggregate_key(base);
            if let Err(e) = self.remote_set(remote.as_ref(), &key, &cached).await {
                warn!(base = %base, error = %e, "Tier-2 aggregate write failed");
            }
        }
    }

    /// Clear tier 1 and delete every engine key from tier 2.
    pub async fn invalidate_all(&self) {
        self.local.clear();

        let Some(remote) = &self.remote else {
            return;
        };

        let prefix = &self.config.key_prefix;
        let patterns = [
            format!("{prefix}:rate:*"),
            format!("{prefix}:rates:all*"),
            format!("{prefix}:supported"),
        ];
        for pattern in &patterns {
            let result = self
                .bounded("delete pattern", remote.delete_pattern(pattern))
                .await;
            match result {
                Ok(removed) => debug!(pattern = %pattern, removed, "Tier-2 keys invalidated"),
                Err(e) => warn!(pattern = %pattern, error = %e, "Tier-2 invalidation failed"),
            }
        }
    }

    /// Remove expired tier-1 entries; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.local.sweep(self.config.local_ttl)
    }

    /// Start the periodic tier-1 sweep.
    pub fn spawn_cleanup(&self) -> CleanupTask {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let local = self.local.clone();
        let ttl = self.config.local_ttl;
        let period = self.config.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let removed = local.sweep(ttl);
                        if removed > 0 {
                            debug!(removed, "Expired tier-1 entries swept");
                        }
                    }
                }
            }
        });

        CleanupTask {
            shutdown_tx,
            handle,
        }
    }

    /// Get tier-1 statistics.
    pub fn stats(&self) -> CacheStats {
        let ttl = self.config.local_ttl;
        let (mut valid, mut expired) = (0, 0);
        for entry in self.local.rates.iter() {
            if entry.is_valid(ttl) {
                valid += 1;
            } else {
                expired += 1;
            }
        }

        CacheStats {
            total_entries: valid + expired,
            valid_entries: valid,
            expired_entries: expired,
            aggregate_entries: self.local.aggregates.len(),
        }
    }

    /// Number of pair entries in tier 1.
    pub fn len(&self) -> usize {
        self.local.rates.len()
    }

    /// Check if tier 1 holds no pairs.
    pub fn is_empty(&self) -> bool {
        self.local.rates.is_empty()
    }

    fn rate_key(&self, pair: &CurrencyPair) -> String {
        format!(
            "{}:rate:{}:{}",
            self.config.key_prefix,
            pair.base.code(),
            pair.target.code()
        )
    }

    fn aggregate_key(&self, base: &Currency) -> String {
        format!("{}:rates:all:{}", self.config.key_prefix, base.code())
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = FxResult<T>>,
    ) -> FxResult<T> {
        match tokio::time::timeout(self.config.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FxError::Cache(format!("{operation} timed out"))),
        }
    }

    async fn remote_get<T: serde::de::DeserializeOwned>(
        &self,
        remote: &dyn RemoteCache,
        key: &str,
    ) -> FxResult<Option<T>> {
        let Some(raw) = self.bounded("get", remote.get(key)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| FxError::Cache(format!("undecodable entry {key}: {e}")))
    }

    async fn remote_set<T: Serialize>(
        &self,
        remote: &dyn RemoteCache,
        key: &str,
        value: &T,
    ) -> FxResult<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| FxError::Cache(format!("unencodable entry {key}: {e}")))?;
        self.bounded("set", remote.set(key, raw, self.config.remote_ttl))
            .await
    }
}

/// Handle to the background tier-1 sweep.
pub struct CleanupTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Signal the sweep to exit and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Cache cleanup task ended abnormally");
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub aggregate_entries: usize,
}

/// Shared rate cache.
pub type SharedRateCache = Arc<RateCache>;
