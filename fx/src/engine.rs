//! Main FX engine implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use fxrates_common::{Currency, CurrencyPair};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheLookup, CacheStats, RateCache};
use crate::conversion::{BulkConvertItem, BulkConvertResponse, ConversionQuote};
use crate::error::{FxError, FxResult};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::provider::{LatestRates, RateProvider, SupportedCurrency};
use crate::store::{ExchangeRate, RateStore, RateUpdate};

/// Configuration for the FX engine.
#[derive(Debug, Clone)]
pub struct FxEngineConfig {
    /// Pivot currency for cross rates and the table fetched on refresh.
    pub base_currency: Currency,
}

impl Default for FxEngineConfig {
    fn default() -> Self {
        Self {
            base_currency: Currency::eur(),
        }
    }
}

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub base: Currency,
    /// Forward and inverse rows written.
    pub rates_written: usize,
    /// Publication date reported by the provider.
    pub provider_date: NaiveDate,
    pub fetched_at: DateTime<Utc>,
}

/// A rate together with when the provider observed it.
#[derive(Debug, Clone, Copy)]
struct Leg {
    rate: Decimal,
    fetched_at: DateTime<Utc>,
}

impl Leg {
    fn inverted(self) -> Option<Leg> {
        Decimal::ONE.checked_div(self.rate).map(|rate| Leg {
            rate,
            fetched_at: self.fetched_at,
        })
    }

    fn then(self, next: Leg) -> Option<Leg> {
        self.rate.checked_mul(next.rate).map(|rate| Leg {
            rate,
            fetched_at: self.fetched_at.min(next.fetched_at),
        })
    }
}

impl From<&ExchangeRate> for Leg {
    fn from(row: &ExchangeRate) -> Self {
        Leg {
            rate: row.rate,
            fetched_at: row.fetched_at,
        }
    }
}

fn is_positive(rate: Decimal) -> bool {
    rate > Decimal::ZERO
}

/// Drops the pair's single-flight lock from the map once its last waiter
/// is gone, including when the resolving future is cancelled.
struct FlightGuard<'a> {
    inflight: &'a DashMap<CurrencyPair, Arc<Mutex<()>>>,
    pair: &'a CurrencyPair,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        // Runs after the caller's handle is dropped: only the map is left.
        self.inflight
            .remove_if(self.pair, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// The conversion engine.
///
/// Resolves rates through the two-tier cache, the durable store, derived
/// rates (inverse, then cross through the base currency) and finally the
/// provider. Every successful step writes the cache before returning.
/// Concurrent resolutions of the same pair are collapsed so only one of
/// them reaches the store or provider; refresh cycles never overlap.
pub struct FxEngine {
    cache: Arc<RateCache>,
    store: Arc<dyn RateStore>,
    provider: Arc<dyn RateProvider>,
    metrics: Arc<EngineMetrics>,
    config: FxEngineConfig,
    inflight: DashMap<CurrencyPair, Arc<Mutex<()>>>,
    refresh_lock: Mutex<()>,
}

impl FxEngine {
    /// Create a new FX engine over its collaborators.
    pub fn new(
        cache: Arc<RateCache>,
        store: Arc<dyn RateStore>,
        provider: Arc<dyn RateProvider>,
        config: FxEngineConfig,
    ) -> Self {
        Self {
            cache,
            store,
            provider,
            metrics: Arc::new(EngineMetrics::new()),
            config,
            inflight: DashMap::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    /// The configured base currency.
    pub fn base_currency(&self) -> &Currency {
        &self.config.base_currency
    }

    /// Get the rate converting one unit of `from` into `to`.
    #[instrument(skip_all, fields(from = %from, to = %to))]
    pub async fn get_rate(&self, from: &Currency, to: &Currency) -> FxResult<Decimal> {
        if from == to {
            return Ok(Decimal::ONE);
        }

        let pair = CurrencyPair::new(from.clone(), to.clone());
        if let Some(rate) = self.cached_rate(&pair).await {
            return Ok(rate);
        }

        let result = {
            let _flight = FlightGuard {
                inflight: &self.inflight,
                pair: &pair,
            };
            // Declared after the guard so the handle is dropped first.
            let flight = self
                .inflight
                .entry(pair.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let _lock = flight.lock().await;
            self.resolve(&pair).await
        };

        if matches!(result, Err(FxError::RateNotFound(_))) {
            self.metrics.rate_not_found();
        }
        result
    }

    /// Convert `amount` of `from` into `to`.
    pub async fn convert(&self, amount: Decimal, from: &Currency, to: &Currency) -> FxResult<Decimal> {
        if from == to {
            return Ok(amount);
        }
        let rate = self.get_rate(from, to).await?;
        amount.checked_mul(rate).ok_or_else(|| FxError::ArithmeticOverflow {
            pair: CurrencyPair::new(from.clone(), to.clone()),
        })
    }

    /// Convert and report the rate applied.
    pub async fn quote(
        &self,
        amount: Decimal,
        from: &Currency,
        to: &Currency,
    ) -> FxResult<ConversionQuote> {
        let rate = self.get_rate(from, to).await?;
        ConversionQuote::new(amount, from.clone(), to.clone(), rate)
    }

    /// Convert every item into `to`, failing the whole batch on the first
    /// unresolvable item.
    #[instrument(skip_all, fields(to = %to, items = items.len()))]
    pub async fn bulk_convert(
        &self,
        items: &[BulkConvertItem],
        to: &Currency,
    ) -> FxResult<BulkConvertResponse> {
        let mut quotes = Vec::with_capacity(items.len());
        let mut total = Decimal::ZERO;

        for (index, item) in items.iter().enumerate() {
            let pair = CurrencyPair::new(item.from.clone(), to.clone());
            let failed = |e: FxError| FxError::BulkConversionFailed {
                index,
                pair: pair.clone(),
                source: Box::new(e),
            };

            let quote = self.quote(item.amount, &item.from, to).await.map_err(failed)?;
            total = total.checked_add(quote.converted).ok_or_else(|| {
                failed(FxError::ArithmeticOverflow { pair: pair.clone() })
            })?;
            quotes.push(quote);
        }

        Ok(BulkConvertResponse {
            to: to.clone(),
            items: quotes,
            total,
            rate_date: self.get_rate_date().await?,
        })
    }

    /// Every known rate quoted against `base`.
    #[instrument(skip_all, fields(base = %base))]
    pub async fn get_all_rates(&self, base: &Currency) -> FxResult<BTreeMap<Currency, Decimal>> {
        if let CacheLookup::Hit { value, tier } = self.cache.get_all_rates(base).await {
            self.metrics.cache_hit(tier);
            return Ok(value.into_iter().map(|(target, c)| (target, c.rate)).collect());
        }

        let rows = self.store.get_rates_for_base(base).await?;
        if !rows.is_empty() {
            self.metrics.store_hit();
            let fetched_at = rows
                .iter()
                .map(|row| row.fetched_at)
                .max()
                .unwrap_or_else(Utc::now);
            let rates: BTreeMap<Currency, Decimal> = rows
                .into_iter()
                .map(|row| (row.target_currency, row.rate))
                .collect();
            self.cache.set_all_rates(base, &rates, fetched_at).await;
            return Ok(rates);
        }

        debug!("No stored rates for base, asking provider");
        self.metrics.provider_fetch();
        let latest = self.provider.get_latest_rates(base).await?;
        let rates: BTreeMap<Currency, Decimal> = latest
            .rates
            .into_iter()
            .filter(|(target, rate)| target != base && is_positive(*rate))
            .collect();
        self.cache.set_all_rates(base, &rates, Utc::now()).await;
        Ok(rates)
    }

    /// Fetch the full table for the base currency and persist forward and
    /// inverse rows for every quoted target.
    ///
    /// Cache writes happen before the store write; a store failure fails the
    /// whole cycle.
    #[instrument(skip_all, fields(base = %self.config.base_currency))]
    pub async fn refresh_rates(&self) -> FxResult<RefreshSummary> {
        let _guard = self.refresh_lock.lock().await;

        let result = self.refresh_locked().await;
        self.metrics.refresh(result.is_ok());
        result
    }

    async fn refresh_locked(&self) -> FxResult<RefreshSummary> {
        let base = &self.config.base_currency;
        let latest = self.provider.get_latest_rates(base).await?;
        if &latest.base != base {
            return Err(FxError::provider(
                "latest rates",
                format!("requested base {} but received {}", base, latest.base),
            ));
        }

        let fetched_at = Utc::now();
        let (forward, updates) = Self::build_refresh_rows(&latest, fetched_at);

        for update in &updates {
            self.cache.set_rate(&update.pair, update.rate, fetched_at).await;
        }
        self.cache.set_all_rates(base, &forward, fetched_at).await;

        let written = self.store.bulk_upsert_rates(&updates).await?;

        info!(
            rates = written,
            provider_date = %latest.date,
            "Exchange rates refreshed"
        );

        Ok(RefreshSummary {
            base: base.clone(),
            rates_written: written,
            provider_date: latest.date,
            fetched_at,
        })
    }

    fn build_refresh_rows(
        latest: &LatestRates,
        fetched_at: DateTime<Utc>,
    ) -> (BTreeMap<Currency, Decimal>, Vec<RateUpdate>) {
        let mut forward = BTreeMap::new();
        let mut updates = Vec::with_capacity(latest.rates.len() * 2);

        for (target, rate) in &latest.rates {
            if target == &latest.base {
                continue;
            }

            // Zero and negative quotes are dropped along with their inverse.
            if !is_positive(*rate) {
                warn!(target = %target, rate = %rate, "Skipping non-positive quote");
                continue;
            }
            let Some(inverse) = Decimal::ONE.checked_div(*rate) else {
                warn!(target = %target, rate = %rate, "Skipping quote with no inverse");
                continue;
            };

            let pair = CurrencyPair::new(latest.base.clone(), target.clone());
            forward.insert(target.clone(), *rate);
            updates.push(RateUpdate::new(pair.inverse(), inverse, fetched_at));
            updates.push(RateUpdate::new(pair, *rate, fetched_at));
        }

        (forward, updates)
    }

    /// Currencies the provider can quote, sorted by code.
    pub async fn get_supported_currencies(&self) -> FxResult<Vec<SupportedCurrency>> {
        let mut currencies = self.provider.get_supported_currencies().await?;
        currencies.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(currencies)
    }

    /// Calendar date of the newest stored rate, or today for an empty store.
    pub async fn get_rate_date(&self) -> FxResult<NaiveDate> {
        Ok(self
            .store
            .get_latest_fetch_time()
            .await?
            .map(|at| at.date_naive())
            .unwrap_or_else(fxrates_common::today))
    }

    /// Provider rate table for `base` on `date`.
    pub async fn get_historical_rates(
        &self,
        date: NaiveDate,
        base: &Currency,
    ) -> FxResult<LatestRates> {
        self.provider.get_historical_rates(date, base).await
    }

    /// Remove stored rates fetched more than `max_age` ago.
    pub async fn prune_rates(&self, max_age: Duration) -> FxResult<u64> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| FxError::persistence("delete old rates", e))?;
        let removed = self.store.delete_old_rates(Utc::now() - max_age).await?;
        if removed > 0 {
            info!(removed, "Pruned stale exchange rates");
        }
        Ok(removed)
    }

    /// Drop every cached rate in both tiers.
    pub async fn invalidate_cache(&self) {
        self.cache.invalidate_all().await;
    }

    /// Get engine statistics.
    pub fn stats(&self) -> FxEngineStats {
        FxEngineStats {
            cache_stats: self.cache.stats(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Shared cache handle.
    pub fn cache(&self) -> Arc<RateCache> {
        self.cache.clone()
    }

    // --- Resolution ---

    async fn cached_rate(&self, pair: &CurrencyPair) -> Option<Decimal> {
        match self.cache.get_rate(pair).await {
            CacheLookup::Hit { value, tier } => {
                self.metrics.cache_hit(tier);
                Some(value.rate)
            }
            CacheLookup::Miss | CacheLookup::Degraded { .. } => None,
        }
    }

    async fn resolve(&self, pair: &CurrencyPair) -> FxResult<Decimal> {
        // Another caller may have resolved the pair while we waited.
        if let Some(rate) = self.cached_rate(pair).await {
            return Ok(rate);
        }

        if let Some(row) = self.store.get_rate(pair).await? {
            debug!(pair = %pair, "Rate served from store");
            self.metrics.store_hit();
            self.cache.set_rate(pair, row.rate, row.fetched_at).await;
            return Ok(row.rate);
        }

        if let Some(leg) = self.derive(pair).await? {
            debug!(pair = %pair, rate = %leg.rate, "Rate derived");
            self.metrics.derived_rate();
            self.cache.set_rate(pair, leg.rate, leg.fetched_at).await;
            return Ok(leg.rate);
        }

        self.fetch_from_provider(pair).await
    }

    /// Inverse of the direct pair, then the cross rate through the base.
    async fn derive(&self, pair: &CurrencyPair) -> FxResult<Option<Leg>> {
        if let Some(leg) = self.inverse_leg(pair).await? {
            return Ok(Some(leg));
        }

        let base = &self.config.base_currency;
        if &pair.base == base || &pair.target == base {
            // Both legs collapse to the pair itself, already tried.
            return Ok(None);
        }

        let Some(to_base) = self.leg(&CurrencyPair::new(pair.base.clone(), base.clone())).await?
        else {
            return Ok(None);
        };
        let Some(from_base) = self
            .leg(&CurrencyPair::new(base.clone(), pair.target.clone()))
            .await?
        else {
            return Ok(None);
        };

        Ok(to_base.then(from_base))
    }

    /// One cross-rate leg: cache, store, then inverse.
    async fn leg(&self, pair: &CurrencyPair) -> FxResult<Option<Leg>> {
        if let Some(cached) = self.cache.get_rate(pair).await.into_option() {
            return Ok(Some(Leg {
                rate: cached.rate,
                fetched_at: cached.fetched_at,
            }));
        }

        if let Some(row) = self.store.get_rate(pair).await? {
            self.cache.set_rate(pair, row.rate, row.fetched_at).await;
            return Ok(Some(Leg::from(&row)));
        }

        self.inverse_leg(pair).await
    }

    async fn inverse_leg(&self, pair: &CurrencyPair) -> FxResult<Option<Leg>> {
        let inverse = pair.inverse();
        let found = match self.cache.get_rate(&inverse).await.into_option() {
            Some(cached) => Some(Leg {
                rate: cached.rate,
                fetched_at: cached.fetched_at,
            }),
            None => self.store.get_rate(&inverse).await?.as_ref().map(Leg::from),
        };

        Ok(found.and_then(Leg::inverted))
    }

    async fn fetch_from_provider(&self, pair: &CurrencyPair) -> FxResult<Decimal> {
        self.metrics.provider_fetch();

        let latest = self
            .provider
            .get_latest_rates_for_currencies(&pair.base, std::slice::from_ref(&pair.target))
            .await
            .map_err(|e| match e {
                FxError::ProviderUnavailable { operation, message } => {
                    FxError::ProviderUnavailable {
                        operation: format!("{operation} for {pair}"),
                        message,
                    }
                }
                other => other,
            })?;

        let Some(rate) = latest.rate_for(&pair.target).filter(|r| is_positive(*r)) else {
            return Err(FxError::RateNotFound(pair.clone()));
        };

        let fetched_at = Utc::now();
        self.store
            .upsert_rate(&RateUpdate::new(pair.clone(), rate, fetched_at))
            .await
            .map_err(|e| match e {
                FxError::PersistenceFailure { operation, message } => {
                    FxError::PersistenceFailure {
                        operation: format!("{operation} for {pair}"),
                        message,
                    }
                }
                other => other,
            })?;
        self.cache.set_rate(pair, rate, fetched_at).await;

        info!(pair = %pair, rate = %rate, "Rate fetched from provider");
        Ok(rate)
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct FxEngineStats {
    pub cache_stats: CacheStats,
    pub metrics: MetricsSnapshot,
}

/// Shared engine.
pub type SharedFxEngine = Arc<FxEngine>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RateCacheConfig;
    use crate::provider::MockRateProvider;
    use crate::remote::MemoryRemoteCache;
    use crate::store::MemoryRateStore;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    struct Harness {
        engine: FxEngine,
        cache: Arc<RateCache>,
        store: Arc<MemoryRateStore>,
        provider: Arc<MockRateProvider>,
    }

    fn setup_engine() -> Harness {
        let remote = Arc::new(MemoryRemoteCache::new());
        let cache = Arc::new(RateCache::with_remote(remote, RateCacheConfig::default()));
        let store = Arc::new(MemoryRateStore::new());
        let provider = Arc::new(MockRateProvider::new("test"));

        let engine = FxEngine::new(
            cache.clone(),
            store.clone(),
            provider.clone(),
            FxEngineConfig::default(),
        );

        Harness {
            engine,
            cache,
            store,
            provider,
        }
    }

    fn pair(base: &str, target: &str) -> CurrencyPair {
        CurrencyPair::new(Currency::new(base), Currency::new(target))
    }

    async fn store_rate(h: &Harness, base: &str, target: &str, rate: Decimal) {
        h.store
            .upsert_rate(&RateUpdate::new(pair(base, target), rate, Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_identity_rate_needs_no_collaborators() {
        let h = setup_engine();
        h.provider.set_failure(Some("down"));

        let rate = h.engine.get_rate(&Currency::usd(), &Currency::usd()).await.unwrap();

        assert_eq!(rate, Decimal::ONE);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.store.read_count(), 0);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_cached_rate_short_circuits() {
        let h = setup_engine();
        h.cache.set_rate(&pair("USD", "EUR"), dec!(0.92), Utc::now()).await;

        let rate = h.engine.get_rate(&Currency::usd(), &Currency::eur()).await.unwrap();

        assert_eq!(rate, dec!(0.92));
        assert_eq!(h.store.read_count(), 0);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.engine.stats().metrics.local_hits, 1);
    }

    #[tokio::test]
    async fn test_cross_rate_through_base() {
        let h = setup_engine();
        h.cache.set_rate(&pair("USD", "EUR"), dec!(0.92), Utc::now()).await;
        h.cache.set_rate(&pair("EUR", "JPY"), dec!(160), Utc::now()).await;

        let rate = h.engine.get_rate(&Currency::usd(), &Currency::jpy()).await.unwrap();

        assert_eq!(rate, dec!(147.2));
        assert_eq!(h.provider.call_count(), 0);
        // The derived pair is now cached.
        assert!(h.cache.get_rate(&pair("USD", "JPY")).await.is_hit());
    }

    #[tokio::test]
    async fn test_inverse_fallback_from_store() {
        let h = setup_engine();
        store_rate(&h, "EUR", "USD", dec!(1.10)).await;

        let rate = h.engine.get_rate(&Currency::usd(), &Currency::eur()).await.unwrap();

        assert_eq!(rate, dec!(1) / dec!(1.10));
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.engine.stats().metrics.derived, 1);
    }

    #[tokio::test]
    async fn test_cross_rate_legs_use_inverse_fallback() {
        let h = setup_engine();
        // Only EUR-based rows: USD->EUR comes from inverting EUR->USD.
        store_rate(&h, "EUR", "USD", dec!(1.25)).await;
        store_rate(&h, "EUR", "GBP", dec!(0.85)).await;

        let rate = h.engine.get_rate(&Currency::usd(), &Currency::gbp()).await.unwrap();

        assert_eq!(rate, dec!(0.68));
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_store_hit_populates_cache() {
        let h = setup_engine();
        store_rate(&h, "EUR", "USD", dec!(1.10)).await;

        assert_eq!(
            h.engine.get_rate(&Currency::eur(), &Currency::usd()).await.unwrap(),
            dec!(1.10)
        );
        let reads = h.store.read_count();

        assert_eq!(
            h.engine.get_rate(&Currency::eur(), &Currency::usd()).await.unwrap(),
            dec!(1.10)
        );
        assert_eq!(h.store.read_count(), reads);
    }

    #[tokio::test]
    async fn test_provider_is_last_resort_and_persists() {
        let h = setup_engine();
        h.provider.set_rates(Currency::eur(), [(Currency::gbp(), dec!(0.85))]);

        let rate = h.engine.get_rate(&Currency::eur(), &Currency::gbp()).await.unwrap();
        assert_eq!(rate, dec!(0.85));
        assert_eq!(h.provider.call_count(), 1);

        let stored = h.store.get_rate(&pair("EUR", "GBP")).await.unwrap().unwrap();
        assert_eq!(stored.rate, dec!(0.85));

        h.engine.get_rate(&Currency::eur(), &Currency::gbp()).await.unwrap();
        assert_eq!(h.provider.call_count(), 1);
        assert!(h.engine.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_rate_not_found() {
        let h = setup_engine();
        h.provider.set_rates(Currency::new("XYZ"), []);

        let result = h.engine.get_rate(&Currency::new("XYZ"), &Currency::new("ABC")).await;

        match result {
            Err(FxError::RateNotFound(p)) => assert_eq!(p, pair("XYZ", "ABC")),
            other => panic!("expected RateNotFound, got {other:?}"),
        }
        assert_eq!(h.engine.stats().metrics.not_found, 1);
    }

    #[tokio::test]
    async fn test_provider_outage_names_pair() {
        let h = setup_engine();
        h.provider.set_failure(Some("connection reset"));

        let err = h
            .engine
            .get_rate(&Currency::usd(), &Currency::gbp())
            .await
            .unwrap_err();

        assert!(matches!(err, FxError::ProviderUnavailable { .. }));
        assert!(err.to_string().contains("USD/GBP"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_store_lookup() {
        let h = setup_engine();
        store_rate(&h, "EUR", "USD", dec!(1.10)).await;
        h.engine.get_rate(&Currency::eur(), &Currency::usd()).await.unwrap();
        let reads = h.store.read_count();

        h.engine.invalidate_cache().await;
        assert!(!h.cache.get_rate(&pair("EUR", "USD")).await.is_hit());

        h.engine.get_rate(&Currency::eur(), &Currency::usd()).await.unwrap();
        assert!(h.store.read_count() > reads);
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let h = setup_engine();
        h.provider.set_rates(Currency::eur(), [(Currency::gbp(), dec!(0.85))]);

        let (eur, gbp) = (Currency::eur(), Currency::gbp());
        let (a, b) = tokio::join!(
            h.engine.get_rate(&eur, &gbp),
            h.engine.get_rate(&eur, &gbp),
        );

        assert_eq!(a.unwrap(), dec!(0.85));
        assert_eq!(b.unwrap(), dec!(0.85));
        assert_eq!(h.provider.call_count(), 1);
        assert!(h.engine.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_provider_rate_not_cached_when_store_write_fails() {
        let h = setup_engine();
        h.provider.set_rates(Currency::eur(), [(Currency::gbp(), dec!(0.85))]);
        h.store.set_write_failure(Some("connection lost"));

        let err = h
            .engine
            .get_rate(&Currency::eur(), &Currency::gbp())
            .await
            .unwrap_err();

        assert!(matches!(err, FxError::PersistenceFailure { .. }));
        assert!(err.to_string().contains("EUR/GBP"));
        assert!(!h.cache.get_rate(&pair("EUR", "GBP")).await.is_hit());
        assert!(h.engine.inflight.is_empty());

        h.store.set_write_failure(None);
        assert_eq!(
            h.engine.get_rate(&Currency::eur(), &Currency::gbp()).await.unwrap(),
            dec!(0.85)
        );
        assert_eq!(h.store.len(), 1);
    }

    /// Store whose point reads never finish before the caller gives up.
    struct SlowStore {
        inner: MemoryRateStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl RateStore for SlowStore {
        async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<Option<ExchangeRate>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_rate(pair).await
        }

        async fn get_rates_for_base(&self, base: &Currency) -> FxResult<Vec<ExchangeRate>> {
            self.inner.get_rates_for_base(base).await
        }

        async fn get_all_rates(&self) -> FxResult<Vec<ExchangeRate>> {
            self.inner.get_all_rates().await
        }

        async fn upsert_rate(&self, update: &RateUpdate) -> FxResult<ExchangeRate> {
            self.inner.upsert_rate(update).await
        }

        async fn bulk_upsert_rates(&self, updates: &[RateUpdate]) -> FxResult<usize> {
            self.inner.bulk_upsert_rates(updates).await
        }

        async fn delete_old_rates(&self, older_than: DateTime<Utc>) -> FxResult<u64> {
            self.inner.delete_old_rates(older_than).await
        }

        async fn get_latest_fetch_time(&self) -> FxResult<Option<DateTime<Utc>>> {
            self.inner.get_latest_fetch_time().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_lookup_releases_inflight_entry() {
        let store = Arc::new(SlowStore {
            inner: MemoryRateStore::new(),
            delay: Duration::from_secs(60),
        });
        let engine = FxEngine::new(
            Arc::new(RateCache::local_only(RateCacheConfig::default())),
            store,
            Arc::new(MockRateProvider::new("test")),
            FxEngineConfig::default(),
        );
        let (usd, gbp) = (Currency::usd(), Currency::gbp());

        let first = tokio::time::timeout(Duration::from_secs(1), engine.get_rate(&usd, &gbp)).await;
        assert!(first.is_err());
        assert!(engine.inflight.is_empty());

        // Two callers share one lock; cancelling both leaves nothing behind.
        let both = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(engine.get_rate(&usd, &gbp), engine.get_rate(&usd, &gbp))
        })
        .await;
        assert!(both.is_err());
        assert!(engine.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_convert() {
        let h = setup_engine();
        h.cache.set_rate(&pair("USD", "EUR"), dec!(0.92), Utc::now()).await;

        let eur = h
            .engine
            .convert(dec!(1000), &Currency::usd(), &Currency::eur())
            .await
            .unwrap();

        assert_eq!(eur, dec!(920));
    }

    #[tokio::test]
    async fn test_convert_overflow_is_an_error() {
        let h = setup_engine();
        h.cache.set_rate(&pair("EUR", "JPY"), dec!(160), Utc::now()).await;

        let err = h
            .engine
            .convert(Decimal::MAX, &Currency::eur(), &Currency::jpy())
            .await
            .unwrap_err();
        assert!(matches!(err, FxError::ArithmeticOverflow { .. }));

        let err = h
            .engine
            .quote(Decimal::MAX, &Currency::eur(), &Currency::jpy())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "ARITHMETIC_OVERFLOW");
    }

    #[tokio::test]
    async fn test_bulk_convert_totals() {
        let h = setup_engine();
        h.cache.set_rate(&pair("USD", "GBP"), dec!(0.79), Utc::now()).await;
        h.cache.set_rate(&pair("EUR", "GBP"), dec!(0.85), Utc::now()).await;

        let items = vec![
            BulkConvertItem::new(dec!(100), Currency::usd()),
            BulkConvertItem::new(dec!(50), Currency::eur()),
        ];
        let response = h.engine.bulk_convert(&items, &Currency::gbp()).await.unwrap();

        assert_eq!(response.items.len(), 2);
        assert_eq!(response.items[0].converted, dec!(79));
        assert_eq!(response.items[1].converted, dec!(42.5));
        assert_eq!(response.total, dec!(121.5));
        assert_eq!(response.rate_date, fxrates_common::today());
    }

    #[tokio::test]
    async fn test_bulk_convert_fails_fast() {
        let h = setup_engine();
        h.cache.set_rate(&pair("USD", "GBP"), dec!(0.79), Utc::now()).await;
        h.provider.set_rates(Currency::new("XYZ"), []);

        let items = vec![
            BulkConvertItem::new(dec!(100), Currency::usd()),
            BulkConvertItem::new(dec!(50), Currency::new("XYZ")),
            BulkConvertItem::new(dec!(10), Currency::gbp()),
        ];
        let err = h.engine.bulk_convert(&items, &Currency::gbp()).await.unwrap_err();

        match err {
            FxError::BulkConversionFailed { index, pair: p, source } => {
                assert_eq!(index, 1);
                assert_eq!(p, pair("XYZ", "GBP"));
                assert!(matches!(*source, FxError::RateNotFound(_)));
            }
            other => panic!("expected BulkConversionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bulk_convert_total_overflow_names_item() {
        let h = setup_engine();
        h.cache.set_rate(&pair("USD", "GBP"), dec!(1), Utc::now()).await;

        let items = vec![
            BulkConvertItem::new(Decimal::MAX, Currency::usd()),
            BulkConvertItem::new(Decimal::MAX, Currency::usd()),
        ];
        let err = h.engine.bulk_convert(&items, &Currency::gbp()).await.unwrap_err();

        match err {
            FxError::BulkConversionFailed { index, pair: p, source } => {
                assert_eq!(index, 1);
                assert_eq!(p, pair("USD", "GBP"));
                assert!(matches!(*source, FxError::ArithmeticOverflow { .. }));
            }
            other => panic!("expected BulkConversionFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_writes_forward_and_inverse() {
        let h = setup_engine();
        h.provider.set_rates(
            Currency::eur(),
            [(Currency::usd(), dec!(1.10)), (Currency::jpy(), dec!(160))],
        );

        let summary = h.engine.refresh_rates().await.unwrap();
        assert_eq!(summary.rates_written, 4);
        assert_eq!(h.store.len(), 4);

        let expected = [
            ("EUR", "USD", dec!(1.10)),
            ("USD", "EUR", dec!(1) / dec!(1.10)),
            ("EUR", "JPY", dec!(160)),
            ("JPY", "EUR", dec!(0.00625)),
        ];
        for (base, target, rate) in expected {
            let row = h.store.get_rate(&pair(base, target)).await.unwrap().unwrap();
            assert_eq!(row.rate, rate, "{base}/{target}");

            let cached = h.cache.get_rate(&pair(base, target)).await.into_option().unwrap();
            assert_eq!(cached.rate, rate, "{base}/{target} cached");
        }
        assert_eq!(h.engine.stats().metrics.refreshes_succeeded, 1);
    }

    #[tokio::test]
    async fn test_refresh_skips_zero_quotes() {
        let h = setup_engine();
        h.provider.set_rates(
            Currency::eur(),
            [(Currency::usd(), dec!(1.10)), (Currency::new("CHF"), Decimal::ZERO)],
        );

        let summary = h.engine.refresh_rates().await.unwrap();

        assert_eq!(summary.rates_written, 2);
        assert!(h.store.get_rate(&pair("CHF", "EUR")).await.unwrap().is_none());
        assert!(h.store.get_rate(&pair("EUR", "CHF")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_skips_negative_quotes() {
        let h = setup_engine();
        h.provider.set_rates(
            Currency::eur(),
            [(Currency::usd(), dec!(1.10)), (Currency::new("CHF"), dec!(-0.95))],
        );

        let summary = h.engine.refresh_rates().await.unwrap();

        assert_eq!(summary.rates_written, 2);
        assert!(h.store.get_rate(&pair("EUR", "CHF")).await.unwrap().is_none());
        assert!(h.store.get_rate(&pair("CHF", "EUR")).await.unwrap().is_none());
        assert!(!h.cache.get_rate(&pair("EUR", "CHF")).await.is_hit());
    }

    #[tokio::test]
    async fn test_zero_rate_is_not_inverted() {
        let h = setup_engine();
        store_rate(&h, "EUR", "CHF", Decimal::ZERO).await;
        h.provider.set_rates(Currency::new("CHF"), []);

        let result = h.engine.get_rate(&Currency::new("CHF"), &Currency::eur()).await;

        assert!(matches!(result, Err(FxError::RateNotFound(_))));
        assert_eq!(h.provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_store_failure_fails_cycle() {
        let h = setup_engine();
        h.provider.set_rates(Currency::eur(), [(Currency::usd(), dec!(1.10))]);
        h.store.set_write_failure(Some("connection lost"));

        let result = h.engine.refresh_rates().await;

        assert!(matches!(result, Err(FxError::PersistenceFailure { .. })));
        assert!(h.store.is_empty());
        assert_eq!(h.engine.stats().metrics.refreshes_failed, 1);
    }

    #[tokio::test]
    async fn test_rate_date() {
        let h = setup_engine();
        assert_eq!(h.engine.get_rate_date().await.unwrap(), fxrates_common::today());

        let fetched_at = DateTime::parse_from_rfc3339("2024-03-01T16:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        h.store
            .upsert_rate(&RateUpdate::new(pair("EUR", "USD"), dec!(1.08), fetched_at))
            .await
            .unwrap();

        assert_eq!(
            h.engine.get_rate_date().await.unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }

    #[tokio::test]
    async fn test_all_rates_prefers_store() {
        let h = setup_engine();
        store_rate(&h, "EUR", "USD", dec!(1.10)).await;
        store_rate(&h, "EUR", "JPY", dec!(160)).await;
        h.provider.set_failure(Some("should not be called"));

        let rates = h.engine.get_all_rates(&Currency::eur()).await.unwrap();

        assert_eq!(rates.len(), 2);
        assert_eq!(rates[&Currency::jpy()], dec!(160));
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_all_rates_falls_back_to_provider() {
        let h = setup_engine();
        h.provider.set_rates(
            Currency::usd(),
            [(Currency::eur(), dec!(0.92)), (Currency::gbp(), dec!(0.79))],
        );

        let rates = h.engine.get_all_rates(&Currency::usd()).await.unwrap();
        assert_eq!(rates[&Currency::gbp()], dec!(0.79));
        assert_eq!(h.provider.call_count(), 1);

        // Served from the aggregate cache the second time.
        h.engine.get_all_rates(&Currency::usd()).await.unwrap();
        assert_eq!(h.provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_supported_currencies_sorted() {
        let h = setup_engine();
        h.provider.set_currencies(vec![
            SupportedCurrency {
                code: Currency::usd(),
                name: "United States Dollar".into(),
            },
            SupportedCurrency {
                code: Currency::eur(),
                name: "Euro".into(),
            },
        ]);

        let currencies = h.engine.get_supported_currencies().await.unwrap();

        let codes: Vec<_> = currencies.iter().map(|c| c.code.code()).collect();
        assert_eq!(codes, vec!["EUR", "USD"]);
    }

    #[tokio::test]
    async fn test_prune_rates() {
        let h = setup_engine();
        let old = Utc::now() - chrono::Duration::days(40);
        h.store
            .upsert_rate(&RateUpdate::new(pair("EUR", "SEK"), dec!(11.5), old))
            .await
            .unwrap();
        store_rate(&h, "EUR", "USD", dec!(1.10)).await;

        let removed = h
            .engine
            .prune_rates(Duration::from_secs(30 * 24 * 3600))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(h.store.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_same_currency_convert_is_identity(
            mantissa in any::<i64>(),
            scale in 0u32..12,
            code in "[A-Z]{3}",
        ) {
            let h = setup_engine();
            h.provider.set_failure(Some("down"));
            let amount = Decimal::new(mantissa, scale);
            let currency = Currency::new(&code);

            let converted =
                tokio_test::block_on(h.engine.convert(amount, &currency, &currency)).unwrap();
            let rate = tokio_test::block_on(h.engine.get_rate(&currency, &currency)).unwrap();

            prop_assert_eq!(converted, amount);
            prop_assert_eq!(rate, Decimal::ONE);
        }
    }
}
