//! Time utilities and timing constants for the rate engine.

use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;

/// Engine timing constants.
pub mod constants {
    use super::Duration;

    /// Tier-1 (in-process) cache TTL (5 minutes).
    pub const fn local_cache_ttl() -> Duration {
        Duration::from_secs(5 * 60)
    }

    /// Tier-2 (shared remote) cache TTL (1 hour).
    pub const fn remote_cache_ttl() -> Duration {
        Duration::from_secs(60 * 60)
    }

    /// Interval between tier-1 expiry sweeps (1 minute).
    pub const fn cache_cleanup_interval() -> Duration {
        Duration::from_secs(60)
    }

    /// Upper bound on a single tier-2 round trip.
    pub const fn remote_cache_timeout() -> Duration {
        Duration::from_secs(2)
    }

    /// Provider HTTP client timeout (10 seconds).
    pub const fn provider_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Scheduled refresh interval (1 hour).
    pub const fn refresh_interval() -> Duration {
        Duration::from_secs(60 * 60)
    }

    /// Delay before retrying a failed refresh (5 minutes).
    pub const fn refresh_retry_delay() -> Duration {
        Duration::from_secs(5 * 60)
    }

    /// Consecutive failed attempts before the updater waits for the next tick.
    pub const MAX_REFRESH_RETRIES: u32 = 3;
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Today's calendar date in UTC.
pub fn today() -> NaiveDate {
    now().date_naive()
}

/// Whether `timestamp` is older than `max_age` relative to `reference`.
pub fn is_older_than(timestamp: Timestamp, max_age: Duration, reference: Timestamp) -> bool {
    match chrono::Duration::from_std(max_age) {
        Ok(max_age) => reference.signed_duration_since(timestamp) > max_age,
        Err(_) => false,
    }
}
