//! Error types for shared currency handling.

use thiserror::Error;

/// Errors raised while validating currency input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CurrencyError {
    /// Code is not three ASCII letters.
    #[error("Invalid currency code: {0:?}")]
    InvalidCode(String),
}

impl CurrencyError {
    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CurrencyError::InvalidCode(_) => "INVALID_CURRENCY_CODE",
        }
    }
}
