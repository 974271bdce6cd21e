//! FX engine error types.

use fxrates_common::{CurrencyError, CurrencyPair};
use thiserror::Error;

/// Errors that can occur in the FX engine.
#[derive(Debug, Error)]
pub enum FxError {
    /// No direct, derived or provider rate exists for the pair.
    #[error("Rate not found for {0}")]
    RateNotFound(CurrencyPair),

    /// The FX source failed at the transport, HTTP or decoding level.
    #[error("Rate provider unavailable during {operation}: {message}")]
    ProviderUnavailable { operation: String, message: String },

    /// The durable rate store failed to read or write.
    #[error("Persistence failure during {operation}: {message}")]
    PersistenceFailure { operation: String, message: String },

    /// Malformed currency code.
    #[error(transparent)]
    InvalidCurrencyCode(#[from] CurrencyError),

    /// One item of a bulk conversion could not be resolved.
    #[error("Bulk conversion failed at item {index} ({pair}): {source}")]
    BulkConversionFailed {
        index: usize,
        pair: CurrencyPair,
        #[source]
        source: Box<FxError>,
    },

    /// Applying a rate exceeded the decimal range.
    #[error("Arithmetic overflow converting {pair}")]
    ArithmeticOverflow { pair: CurrencyPair },

    /// The shared cache tier failed. Never surfaced past the cache.
    #[error("Remote cache error: {0}")]
    Cache(String),
}

impl FxError {
    /// Build a provider error with operation context.
    pub fn provider(operation: impl Into<String>, message: impl ToString) -> Self {
        FxError::ProviderUnavailable {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Build a persistence error with operation context.
    pub fn persistence(operation: impl Into<String>, message: impl ToString) -> Self {
        FxError::PersistenceFailure {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Check if a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FxError::ProviderUnavailable { .. }
            | FxError::PersistenceFailure { .. }
            | FxError::Cache(_) => true,
            FxError::BulkConversionFailed { source, .. } => source.is_retryable(),
            FxError::RateNotFound(_)
            | FxError::InvalidCurrencyCode(_)
            | FxError::ArithmeticOverflow { .. } => false,
        }
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            FxError::RateNotFound(_) => "RATE_NOT_FOUND",
            FxError::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            FxError::PersistenceFailure { .. } => "PERSISTENCE_FAILURE",
            FxError::InvalidCurrencyCode(e) => e.error_code(),
            FxError::BulkConversionFailed { .. } => "BULK_CONVERSION_FAILED",
            FxError::ArithmeticOverflow { .. } => "ARITHMETIC_OVERFLOW",
            FxError::Cache(_) => "CACHE_ERROR",
        }
    }
}

/// Result type for FX operations.
pub type FxResult<T> = Result<T, FxError>;
