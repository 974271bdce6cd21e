//! FxRates Engine
//!
//! Exchange-rate lookup, conversion and refresh over a two-tier cache and a
//! durable rate store.
//!
//! # Features
//!
//! - In-process cache backed by an optional shared (Redis) cache tier
//! - Inverse and cross-rate derivation through a base currency
//! - Provider fallback on a miss, with concurrent misses collapsed
//! - Scheduled refresh with bounded retry
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fxrates_fx::{FxEngine, FxEngineConfig, RateCache, RateCacheConfig};
//! use fxrates_common::Currency;
//!
//! let cache = Arc::new(RateCache::local_only(RateCacheConfig::default()));
//! let engine = FxEngine::new(cache, store, provider, FxEngineConfig::default());
//!
//! // Get current rate
//! let rate = engine.get_rate(&Currency::usd(), &Currency::eur()).await?;
//!
//! // Convert amount
//! let eur = engine.convert(dec!(1000), &Currency::usd(), &Currency::eur()).await?;
//! ```

pub mod cache;
pub mod conversion;
pub mod engine;
pub mod error;
pub mod http_provider;
pub mod metrics;
pub mod pg_store;
pub mod provider;
pub mod redis_cache;
pub mod remote;
pub mod store;
pub mod updater;

pub use cache::{CacheLookup, CacheTier, RateCache, RateCacheConfig};
pub use conversion::{BulkConvertItem, BulkConvertResponse, ConversionQuote};
pub use engine::{FxEngine, FxEngineConfig, RefreshSummary};
pub use error::{FxError, FxResult};
pub use http_provider::{HttpRateProvider, ProviderConfig};
pub use metrics::EngineMetrics;
pub use pg_store::PgRateStore;
pub use provider::{LatestRates, RateProvider, SupportedCurrency};
pub use redis_cache::RedisRemoteCache;
pub use remote::{MemoryRemoteCache, RemoteCache};
pub use store::{ExchangeRate, MemoryRateStore, RateStore, RateUpdate};
pub use updater::{RateRefresher, RateUpdater, UpdaterConfig, UpdaterStatus};

#[cfg(any(test, feature = "test-utils"))]
pub use provider::MockRateProvider;
