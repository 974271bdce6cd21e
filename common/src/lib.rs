//! FxRates Common Types
//!
//! Shared types used across the fxrates crates: validated currency codes,
//! currency pairs and the timing constants the cache and updater default to.

pub mod currency;
pub mod error;
pub mod time;

pub use currency::*;
pub use error::*;
pub use time::*;
