//! Currency conversion request and result types.

use chrono::NaiveDate;
use fxrates_common::{Currency, CurrencyPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{FxError, FxResult};

/// A single resolved conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionQuote {
    /// Input amount.
    pub amount: Decimal,
    pub from: Currency,
    pub to: Currency,
    /// Rate applied (1 for same-currency conversions).
    pub rate: Decimal,
    /// `amount * rate`, unrounded.
    pub converted: Decimal,
}

impl ConversionQuote {
    /// Build a quote by applying `rate` to `amount`.
    ///
    /// Fails with [`FxError::ArithmeticOverflow`] when the product does not
    /// fit in a `Decimal`.
    pub fn new(amount: Decimal, from: Currency, to: Currency, rate: Decimal) -> FxResult<Self> {
        let Some(converted) = amount.checked_mul(rate) else {
            return Err(FxError::ArithmeticOverflow {
                pair: CurrencyPair::new(from, to),
            });
        };
        Ok(Self {
            amount,
            from,
            to,
            rate,
            converted,
        })
    }

    /// Get the currency pair.
    pub fn pair(&self) -> CurrencyPair {
        CurrencyPair::new(self.from.clone(), self.to.clone())
    }
}

/// One line of a bulk conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkConvertItem {
    pub amount: Decimal,
    pub from: Currency,
}

impl BulkConvertItem {
    pub fn new(amount: Decimal, from: Currency) -> Self {
        Self { amount, from }
    }
}

/// Result of converting every item into one target currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkConvertResponse {
    pub to: Currency,
    /// Per-item quotes, in request order.
    pub items: Vec<ConversionQuote>,
    /// Sum of every item's converted amount.
    pub total: Decimal,
    /// Calendar date of the newest stored rate.
    pub rate_date: NaiveDate,
}
