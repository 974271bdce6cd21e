//! Currency codes and currency pairs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CurrencyError;

/// ISO 4217 currency code.
///
/// Always three ASCII letters, stored uppercase. Construct with
/// [`Currency::parse`] at trust boundaries; [`Currency::new`] is for codes
/// known to be valid at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Create a currency from a code known to be valid.
    ///
    /// # Panics
    ///
    /// Panics if `code` is not three ASCII letters.
    pub fn new(code: impl AsRef<str>) -> Self {
        match Self::parse(code.as_ref()) {
            Ok(currency) => currency,
            Err(e) => panic!("{}", e),
        }
    }

    /// Parse and normalize a currency code.
    ///
    /// Surrounding whitespace is trimmed and the code is uppercased.
    pub fn parse(code: &str) -> Result<Self, CurrencyError> {
        let trimmed = code.trim();
        if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CurrencyError::InvalidCode(code.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Common currencies
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn eur() -> Self {
        Self("EUR".to_string())
    }

    pub fn gbp() -> Self {
        Self("GBP".to_string())
    }

    pub fn jpy() -> Self {
        Self("JPY".to_string())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Currency {
    type Err = CurrencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = CurrencyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl AsRef<str> for Currency {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A directed currency pair: one unit of `base` is worth `rate` units of `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: Currency,
    pub target: Currency,
}

impl CurrencyPair {
    /// Create a new currency pair.
    pub fn new(base: Currency, target: Currency) -> Self {
        Self { base, target }
    }

    /// Parse both legs of a pair from raw codes.
    pub fn parse(base: &str, target: &str) -> Result<Self, CurrencyError> {
        Ok(Self {
            base: Currency::parse(base)?,
            target: Currency::parse(target)?,
        })
    }

    /// Get the inverse pair.
    pub fn inverse(&self) -> Self {
        Self {
            base: self.target.clone(),
            target: self.base.clone(),
        }
    }

    /// Whether both legs are the same currency.
    pub fn is_identity(&self) -> bool {
        self.base == self.target
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.target)
    }
}
