//! Service configuration.

use std::str::FromStr;
use std::time::Duration;

use fxrates_common::Currency;
use fxrates_fx::{FxEngineConfig, ProviderConfig, RateCacheConfig, UpdaterConfig};
use tracing::warn;

/// Main service configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Postgres connection string.
    pub database_url: String,
    /// Connection pool size.
    pub max_db_connections: u32,
    /// Shared cache tier; tier 1 only when unset.
    pub redis_url: Option<String>,
    pub provider: ProviderConfig,
    pub engine: FxEngineConfig,
    pub cache: RateCacheConfig,
    pub updater: UpdaterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/fxrates".to_string(),
            max_db_connections: 10,
            redis_url: None,
            provider: ProviderConfig::default(),
            engine: FxEngineConfig::default(),
            cache: RateCacheConfig::default(),
            updater: UpdaterConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key source.
    ///
    /// Unset keys keep their defaults; unparsable values are logged and
    /// ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }

        if let Some(n) = parsed(&lookup, "DATABASE_MAX_CONNECTIONS") {
            config.max_db_connections = n;
        }

        if let Some(url) = lookup("REDIS_URL").filter(|url| !url.trim().is_empty()) {
            config.redis_url = Some(url);
        }

        if let Some(url) = lookup("FX_PROVIDER_URL") {
            config.provider.base_url = url;
        }

        if let Some(base) = parsed::<Currency>(&lookup, "FX_BASE_CURRENCY") {
            config.engine.base_currency = base;
        }

        if let Some(secs) = parsed(&lookup, "FX_UPDATE_INTERVAL_SECS") {
            config.updater.interval = Duration::from_secs(secs);
        }

        if let Some(secs) = parsed(&lookup, "FX_RETRY_DELAY_SECS") {
            config.updater.retry_delay = Duration::from_secs(secs);
        }

        if let Some(n) = parsed(&lookup, "FX_MAX_RETRIES") {
            config.updater.max_retries = n;
        }

        if let Some(days) = parsed::<u64>(&lookup, "FX_RATE_RETENTION_DAYS") {
            config.updater.retention = Some(Duration::from_secs(days * 24 * 60 * 60));
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.database_url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.max_db_connections == 0 {
            return Err("Database pool needs at least one connection".to_string());
        }

        if !self.provider.base_url.starts_with("http://")
            && !self.provider.base_url.starts_with("https://")
        {
            return Err(format!(
                "Provider URL must be http(s): {}",
                self.provider.base_url
            ));
        }

        if let Some(url) = &self.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(format!("Redis URL must be redis(s): {url}"));
            }
        }

        if self.updater.interval.is_zero() {
            return Err("Update interval cannot be zero".to_string());
        }

        if self.updater.max_retries == 0 {
            return Err("Max retries must be at least 1".to_string());
        }

        if self.updater.retention.is_some_and(|r| r.is_zero()) {
            return Err("Rate retention cannot be zero days".to_string());
        }

        Ok(())
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}
