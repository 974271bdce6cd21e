//! Durable rate store contract and an in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxrates_common::{Currency, CurrencyPair};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FxError, FxResult};

/// A persisted exchange rate, unique per (base, target).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub id: Uuid,
    pub base_currency: Currency,
    pub target_currency: Currency,
    pub rate: Decimal,
    /// When the provider observed this rate.
    pub fetched_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeRate {
    /// The pair this row prices.
    pub fn pair(&self) -> CurrencyPair {
        CurrencyPair::new(self.base_currency.clone(), self.target_currency.clone())
    }
}

/// A rate to insert or overwrite.
#[derive(Debug, Clone, PartialEq)]
pub struct RateUpdate {
    pub pair: CurrencyPair,
    pub rate: Decimal,
    pub fetched_at: DateTime<Utc>,
}

impl RateUpdate {
    /// Create a new rate update.
    pub fn new(pair: CurrencyPair, rate: Decimal, fetched_at: DateTime<Utc>) -> Self {
        Self {
            pair,
            rate,
            fetched_at,
        }
    }
}

/// Durable storage for exchange rates.
///
/// Upserts are keyed on (base, target): an existing row has its rate,
/// `fetched_at` and `updated_at` overwritten in place.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Point lookup for one pair.
    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<Option<ExchangeRate>>;

    /// Every row quoted against `base`.
    async fn get_rates_for_base(&self, base: &Currency) -> FxResult<Vec<ExchangeRate>>;

    /// Every row.
    async fn get_all_rates(&self) -> FxResult<Vec<ExchangeRate>>;

    /// Insert or overwrite a single pair.
    async fn upsert_rate(&self, update: &RateUpdate) -> FxResult<ExchangeRate>;

    /// Insert or overwrite many pairs. All or nothing.
    async fn bulk_upsert_rates(&self, updates: &[RateUpdate]) -> FxResult<usize>;

    /// Remove rows fetched before `older_than`; returns the number removed.
    async fn delete_old_rates(&self, older_than: DateTime<Utc>) -> FxResult<u64>;

    /// Most recent `fetched_at` across all rows.
    async fn get_latest_fetch_time(&self) -> FxResult<Option<DateTime<Utc>>>;
}

/// In-process rate store.
///
/// Used by tests and single-node deployments without a database. Bulk
/// upserts apply under one write lock, so readers never observe a partial
/// batch.
#[derive(Default)]
pub struct MemoryRateStore {
    rows: RwLock<HashMap<CurrencyPair, ExchangeRate>>,
    reads: AtomicUsize,
    write_failure: RwLock<Option<String>>,
}

impl MemoryRateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of read operations served.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Make writes fail with `message` until cleared with `None`.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn set_write_failure(&self, message: Option<&str>) {
        *self.write_failure.write() = message.map(str::to_string);
    }

    fn check_writable(&self, operation: &str) -> FxResult<()> {
        match self.write_failure.read().as_ref() {
            Some(message) => Err(FxError::persistence(operation, message)),
            None => Ok(()),
        }
    }

    fn apply(rows: &mut HashMap<CurrencyPair, ExchangeRate>, update: &RateUpdate) -> ExchangeRate {
        let now = Utc::now();
        let row = rows
            .entry(update.pair.clone())
            .and_modify(|row| {
                row.rate = update.rate;
                row.fetched_at = update.fetched_at;
                row.updated_at = now;
            })
            .or_insert_with(|| ExchangeRate {
                id: Uuid::now_v7(),
                base_currency: update.pair.base.clone(),
                target_currency: update.pair.target.clone(),
                rate: update.rate,
                fetched_at: update.fetched_at,
                created_at: now,
                updated_at: now,
            });
        row.clone()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<Option<ExchangeRate>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.read().get(pair).cloned())
    }

    async fn get_rates_for_base(&self, base: &Currency) -> FxResult<Vec<ExchangeRate>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut rows: Vec<ExchangeRate> = self
            .rows
            .read()
            .values()
            .filter(|row| &row.base_currency == base)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.target_currency.cmp(&b.target_currency));
        Ok(rows)
    }

    async fn get_all_rates(&self) -> FxResult<Vec<ExchangeRate>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut rows: Vec<ExchangeRate> = self.rows.read().values().cloned().collect();
        rows.sort_by(|a, b| {
            (&a.base_currency, &a.target_currency).cmp(&(&b.base_currency, &b.target_currency))
        });
        Ok(rows)
    }

    async fn upsert_rate(&self, update: &RateUpdate) -> FxResult<ExchangeRate> {
        self.check_writable("upsert rate")?;
        Ok(Self::apply(&mut self.rows.write(), update))
    }

    async fn bulk_upsert_rates(&self, updates: &[RateUpdate]) -> FxResult<usize> {
        self.check_writable("bulk upsert rates")?;
        let mut rows = self.rows.write();
        for update in updates {
            Self::apply(&mut rows, update);
        }
        Ok(updates.len())
    }

    async fn delete_old_rates(&self, older_than: DateTime<Utc>) -> FxResult<u64> {
        self.check_writable("delete old rates")?;
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, row| row.fetched_at >= older_than);
        Ok((before - rows.len()) as u64)
    }

    async fn get_latest_fetch_time(&self) -> FxResult<Option<DateTime<Utc>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.read().values().map(|row| row.fetched_at).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn update(base: &str, target: &str, rate: Decimal) -> RateUpdate {
        RateUpdate::new(
            CurrencyPair::new(Currency::new(base), Currency::new(target)),
            rate,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_upsert_overwrites_in_place() {
        let store = MemoryRateStore::new();

        let first = store.upsert_rate(&update("EUR", "USD", dec!(1.10))).await.unwrap();
        let second = store.upsert_rate(&update("EUR", "USD", dec!(1.12))).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.rate, dec!(1.12));
    }

    #[tokio::test]
    async fn test_bulk_upsert_is_all_or_nothing() {
        let store = MemoryRateStore::new();
        store.set_write_failure(Some("disk full"));

        let result = store
            .bulk_upsert_rates(&[update("EUR", "USD", dec!(1.10)), update("USD", "EUR", dec!(0.9))])
            .await;

        assert!(matches!(result, Err(FxError::PersistenceFailure { .. })));
        assert!(store.is_empty());

        store.set_write_failure(None);
        let written = store
            .bulk_upsert_rates(&[update("EUR", "USD", dec!(1.10)), update("USD", "EUR", dec!(0.9))])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_rates_for_base_and_latest_fetch() {
        let store = MemoryRateStore::new();
        let old = Utc::now() - Duration::days(10);

        store
            .upsert_rate(&RateUpdate::new(
                CurrencyPair::new(Currency::eur(), Currency::jpy()),
                dec!(160),
                old,
            ))
            .await
            .unwrap();
        let recent = store.upsert_rate(&update("EUR", "USD", dec!(1.10))).await.unwrap();
        store.upsert_rate(&update("USD", "EUR", dec!(0.9))).await.unwrap();

        let eur_rows = store.get_rates_for_base(&Currency::eur()).await.unwrap();
        let targets: Vec<_> = eur_rows.iter().map(|r| r.target_currency.code()).collect();
        assert_eq!(targets, vec!["JPY", "USD"]);

        let latest = store.get_latest_fetch_time().await.unwrap().unwrap();
        assert!(latest >= recent.fetched_at);

        let removed = store.delete_old_rates(Utc::now() - Duration::days(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_store_has_no_fetch_time() {
        let store = MemoryRateStore::new();
        assert!(store.get_latest_fetch_time().await.unwrap().is_none());
        assert!(store.get_all_rates().await.unwrap().is_empty());
    }
}
