//! Counters for rate resolution and refresh outcomes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::cache::CacheTier;

/// Engine metrics.
#[derive(Default)]
pub struct EngineMetrics {
    /// Rates served from tier 1.
    pub local_hits: AtomicU64,
    /// Rates served from tier 2.
    pub remote_hits: AtomicU64,
    /// Rates served from a direct store row.
    pub store_hits: AtomicU64,
    /// Rates derived by inversion or through the base currency.
    pub derived: AtomicU64,
    /// Rates fetched from the provider on a miss.
    pub provider_fetches: AtomicU64,
    /// Lookups that exhausted every source.
    pub not_found: AtomicU64,
    pub refreshes_succeeded: AtomicU64,
    pub refreshes_failed: AtomicU64,
}

impl EngineMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cache hit on `tier`.
    pub fn cache_hit(&self, tier: CacheTier) {
        match tier {
            CacheTier::Local => self.local_hits.fetch_add(1, Ordering::Relaxed),
            CacheTier::Remote => self.remote_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn store_hit(&self) {
        self.store_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn derived_rate(&self) {
        self.derived.fetch_add(1, Ordering::Relaxed);
    }

    pub fn provider_fetch(&self) {
        self.provider_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a refresh outcome.
    pub fn refresh(&self, succeeded: bool) {
        if succeeded {
            self.refreshes_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.refreshes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
            derived: self.derived.load(Ordering::Relaxed),
            provider_fetches: self.provider_fetches.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            refreshes_succeeded: self.refreshes_succeeded.load(Ordering::Relaxed),
            refreshes_failed: self.refreshes_failed.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let counters = [
            ("fxrates_cache_local_hits_total", "Rates served from the in-process cache", s.local_hits),
            ("fxrates_cache_remote_hits_total", "Rates served from the shared cache", s.remote_hits),
            ("fxrates_store_hits_total", "Rates served from the rate store", s.store_hits),
            ("fxrates_derived_rates_total", "Rates derived by inversion or cross-rate", s.derived),
            ("fxrates_provider_fetches_total", "Rates fetched from the provider on a miss", s.provider_fetches),
            ("fxrates_rate_not_found_total", "Lookups with no resolvable rate", s.not_found),
            ("fxrates_refreshes_succeeded_total", "Successful refresh cycles", s.refreshes_succeeded),
            ("fxrates_refreshes_failed_total", "Failed refresh cycles", s.refreshes_failed),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub store_hits: u64,
    pub derived: u64,
    pub provider_fetches: u64,
    pub not_found: u64,
    pub refreshes_succeeded: u64,
    pub refreshes_failed: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<EngineMetrics>;
