//! Background rate refresh scheduling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxrates_common::time::constants;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::engine::{FxEngine, RefreshSummary};
use crate::error::FxResult;

/// Something that can refresh the rate set on demand.
#[async_trait]
pub trait RateRefresher: Send + Sync {
    /// Run one full refresh cycle.
    async fn refresh_rates(&self) -> FxResult<RefreshSummary>;

    /// Remove stored rates older than `max_age`.
    async fn prune_rates(&self, max_age: Duration) -> FxResult<u64>;
}

#[async_trait]
impl RateRefresher for FxEngine {
    async fn refresh_rates(&self) -> FxResult<RefreshSummary> {
        FxEngine::refresh_rates(self).await
    }

    async fn prune_rates(&self, max_age: Duration) -> FxResult<u64> {
        FxEngine::prune_rates(self, max_age).await
    }
}

/// Configuration for the rate updater.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Time between scheduled refreshes.
    pub interval: Duration,
    /// Delay before retrying a failed refresh.
    pub retry_delay: Duration,
    /// Consecutive failures tolerated before waiting for the next tick.
    pub max_retries: u32,
    /// Prune rates older than this after each successful refresh.
    pub retention: Option<Duration>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            interval: constants::refresh_interval(),
            retry_delay: constants::refresh_retry_delay(),
            max_retries: constants::MAX_REFRESH_RETRIES,
            retention: None,
        }
    }
}

/// Point-in-time view of the updater.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdaterStatus {
    pub running: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub interval_secs: u64,
    /// Consecutive failures since the last success or exhausted budget.
    pub retry_count: u32,
}

#[derive(Debug, Default)]
struct UpdaterState {
    running: bool,
    last_update: Option<DateTime<Utc>>,
    last_error: Option<String>,
    retry_count: u32,
}

struct UpdaterInner {
    refresher: Arc<dyn RateRefresher>,
    config: UpdaterConfig,
    state: Mutex<UpdaterState>,
}

impl UpdaterInner {
    async fn attempt(&self) -> FxResult<RefreshSummary> {
        let result = self.refresher.refresh_rates().await;

        match &result {
            Ok(summary) => {
                {
                    let mut state = self.state.lock();
                    state.last_update = Some(summary.fetched_at);
                    state.last_error = None;
                    state.retry_count = 0;
                }
                if let Some(retention) = self.config.retention {
                    if let Err(e) = self.refresher.prune_rates(retention).await {
                        warn!(error = %e, "Failed to prune old rates");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Rate refresh failed");
                self.state.lock().last_error = Some(e.to_string());
            }
        }

        result
    }

    /// Run a scheduled attempt and return when to retry, if at all.
    async fn scheduled_attempt(&self) -> Option<Instant> {
        if self.attempt().await.is_ok() {
            return None;
        }

        let mut state = self.state.lock();
        state.retry_count += 1;
        if state.retry_count < self.config.max_retries {
            info!(
                retry = state.retry_count,
                delay_secs = self.config.retry_delay.as_secs(),
                "Scheduling refresh retry"
            );
            Some(Instant::now() + self.config.retry_delay)
        } else {
            error!(
                failures = state.retry_count,
                "Refresh retry budget exhausted, waiting for next interval"
            );
            state.retry_count = 0;
            None
        }
    }
}

struct UpdaterTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodically refreshes rates with bounded retry.
pub struct RateUpdater {
    inner: Arc<UpdaterInner>,
    task: tokio::sync::Mutex<Option<UpdaterTask>>,
}

impl RateUpdater {
    /// Create a stopped updater.
    pub fn new(refresher: Arc<dyn RateRefresher>, config: UpdaterConfig) -> Self {
        Self {
            inner: Arc::new(UpdaterInner {
                refresher,
                config,
                state: Mutex::new(UpdaterState::default()),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Refresh once immediately, then keep refreshing on the interval.
    ///
    /// Calling `start` on a running updater does nothing.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("Rate updater already running");
            return;
        }

        self.inner.state.lock().running = true;
        info!(
            interval_secs = self.inner.config.interval.as_secs(),
            "Starting rate updater"
        );

        let first_retry = self.inner.scheduled_attempt().await;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let inner = self.inner.clone();
        let period = inner.config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut retry_at = first_retry;

            loop {
                let retry = async move {
                    match retry_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        retry_at = inner.scheduled_attempt().await;
                    }
                    _ = retry => {
                        retry_at = inner.scheduled_attempt().await;
                    }
                }
            }
        });

        *task = Some(UpdaterTask {
            shutdown_tx,
            handle,
        });
    }

    /// Signal the loop to exit and wait for it.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };

        let _ = task.shutdown_tx.send(()).await;
        if let Err(e) = task.handle.await {
            error!(error = %e, "Rate updater task ended abnormally");
        }

        self.inner.state.lock().running = false;
        info!("Rate updater stopped");
    }

    /// Refresh now, independent of the schedule.
    pub async fn force_update(&self) -> FxResult<RefreshSummary> {
        self.inner.attempt().await
    }

    /// Get the current status.
    pub fn status(&self) -> UpdaterStatus {
        let state = self.inner.state.lock();
        UpdaterStatus {
            running: state.running,
            last_update: state.last_update,
            last_error: state.last_error.clone(),
            interval_secs: self.inner.config.interval.as_secs(),
            retry_count: state.retry_count,
        }
    }
}
