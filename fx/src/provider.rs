//! Rate provider traits and response types.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use fxrates_common::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FxResult;

/// A rate table quoted against a single base currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestRates {
    /// Amount of `base` the rates are quoted for (1 unless converting).
    #[serde(default = "one")]
    pub amount: Decimal,
    pub base: Currency,
    pub date: NaiveDate,
    pub rates: BTreeMap<Currency, Decimal>,
}

impl LatestRates {
    /// Rate for a single target, if quoted.
    pub fn rate_for(&self, target: &Currency) -> Option<Decimal> {
        self.rates.get(target).copied()
    }
}

fn one() -> Decimal {
    Decimal::ONE
}

/// A currency the provider can quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedCurrency {
    pub code: Currency,
    pub name: String,
}

/// Trait for FX rate providers.
///
/// Implementations are plain request/response clients: any transport, HTTP
/// status or decoding failure is returned as
/// [`FxError::ProviderUnavailable`](crate::FxError::ProviderUnavailable)
/// without retrying.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Full latest rate table for `base`.
    async fn get_latest_rates(&self, base: &Currency) -> FxResult<LatestRates>;

    /// Latest rates for `base` restricted to `targets`.
    async fn get_latest_rates_for_currencies(
        &self,
        base: &Currency,
        targets: &[Currency],
    ) -> FxResult<LatestRates>;

    /// All currencies the provider quotes.
    async fn get_supported_currencies(&self) -> FxResult<Vec<SupportedCurrency>>;

    /// Convert `amount` of `from` into `to`; `rates[to]` holds the converted amount.
    async fn convert(&self, amount: Decimal, from: &Currency, to: &Currency)
        -> FxResult<LatestRates>;

    /// Rate table for `base` as published on `date`.
    async fn get_historical_rates(&self, date: NaiveDate, base: &Currency)
        -> FxResult<LatestRates>;
}

/// Mock rate provider for testing.
#[cfg(any(test, feature = "test-utils"))]
pub struct MockRateProvider {
    name: String,
    tables: dashmap::DashMap<Currency, BTreeMap<Currency, Decimal>>,
    currencies: parking_lot::RwLock<Vec<SupportedCurrency>>,
    failure: parking_lot::RwLock<Option<String>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockRateProvider {
    /// Create a new mock provider.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: dashmap::DashMap::new(),
            currencies: parking_lot::RwLock::new(Vec::new()),
            failure: parking_lot::RwLock::new(None),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Set the rate table quoted against `base`.
    pub fn set_rates(&self, base: Currency, rates: impl IntoIterator<Item = (Currency, Decimal)>) {
        self.tables.insert(base, rates.into_iter().collect());
    }

    /// Set the supported currency list.
    pub fn set_currencies(&self, currencies: Vec<SupportedCurrency>) {
        *self.currencies.write() = currencies;
    }

    /// Make every call fail with `message` until cleared with `None`.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.write() = message.map(str::to_string);
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn begin(&self, operation: &str) -> FxResult<()> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match self.failure.read().as_ref() {
            Some(message) => Err(crate::FxError::provider(operation, message)),
            None => Ok(()),
        }
    }

    fn table(&self, base: &Currency) -> FxResult<LatestRates> {
        let rates = self
            .tables
            .get(base)
            .map(|t| t.clone())
            .ok_or_else(|| crate::FxError::provider("latest rates", format!("unknown base {base}")))?;
        Ok(LatestRates {
            amount: Decimal::ONE,
            base: base.clone(),
            date: fxrates_common::today(),
            rates,
        })
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl RateProvider for MockRateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_latest_rates(&self, base: &Currency) -> FxResult<LatestRates> {
        self.begin("latest rates")?;
        self.table(base)
    }

    async fn get_latest_rates_for_currencies(
        &self,
        base: &Currency,
        targets: &[Currency],
    ) -> FxResult<LatestRates> {
        self.begin("latest rates")?;
        let mut latest = self.table(base)?;
        latest.rates.retain(|code, _| targets.contains(code));
        Ok(latest)
    }

    async fn get_supported_currencies(&self) -> FxResult<Vec<SupportedCurrency>> {
        self.begin("supported currencies")?;
        Ok(self.currencies.read().clone())
    }

    async fn convert(
        &self,
        amount: Decimal,
        from: &Currency,
        to: &Currency,
    ) -> FxResult<LatestRates> {
        self.begin("convert")?;
        let mut latest = self.table(from)?;
        latest.rates.retain(|code, _| code == to);
        for value in latest.rates.values_mut() {
            *value *= amount;
        }
        latest.amount = amount;
        Ok(latest)
    }

    async fn get_historical_rates(
        &self,
        date: NaiveDate,
        base: &Currency,
    ) -> FxResult<LatestRates> {
        self.begin("historical rates")?;
        let mut latest = self.table(base)?;
        latest.date = date;
        Ok(latest)
    }
}
