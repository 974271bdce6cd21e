//! Service wiring and lifecycle.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use fxrates_fx::cache::CleanupTask;
use fxrates_fx::{
    FxEngine, HttpRateProvider, PgRateStore, RateCache, RateProvider, RateStore, RateUpdater,
    RedisRemoteCache, RemoteCache, UpdaterStatus,
};

use crate::config::ServerConfig;

/// Lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// The engine plus its background tasks.
pub struct FxService {
    engine: Arc<FxEngine>,
    updater: RateUpdater,
    cleanup: Mutex<Option<CleanupTask>>,
    state: RwLock<ServiceState>,
}

impl FxService {
    /// Connect to Postgres, Redis and the HTTP provider described by `config`.
    ///
    /// An unreachable Redis leaves the service on tier 1 alone.
    pub async fn connect(config: &ServerConfig) -> anyhow::Result<Self> {
        let store = PgRateStore::connect(&config.database_url, config.max_db_connections).await?;
        store.ensure_schema().await?;
        info!("Rate store ready");

        let provider = HttpRateProvider::new(config.provider.clone())?;
        info!(provider = %provider.name(), "Rate provider configured");

        let remote: Option<Arc<dyn RemoteCache>> = match &config.redis_url {
            Some(url) => match RedisRemoteCache::connect(url, config.cache.remote_timeout).await {
                Ok(redis) => Some(Arc::new(redis)),
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, running without shared cache");
                    None
                }
            },
            None => None,
        };

        Ok(Self::from_parts(
            Arc::new(store),
            Arc::new(provider),
            remote,
            config,
        ))
    }

    /// Assemble the service over already-built collaborators.
    pub fn from_parts(
        store: Arc<dyn RateStore>,
        provider: Arc<dyn RateProvider>,
        remote: Option<Arc<dyn RemoteCache>>,
        config: &ServerConfig,
    ) -> Self {
        let cache = Arc::new(match remote {
            Some(remote) => RateCache::with_remote(remote, config.cache.clone()),
            None => RateCache::local_only(config.cache.clone()),
        });
        let engine = Arc::new(FxEngine::new(
            cache,
            store,
            provider,
            config.engine.clone(),
        ));
        let updater = RateUpdater::new(engine.clone(), config.updater.clone());

        Self {
            engine,
            updater,
            cleanup: Mutex::new(None),
            state: RwLock::new(ServiceState::Starting),
        }
    }

    /// Start cache cleanup and the rate updater.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        info!(base = %self.engine.base_currency(), "Starting FX service");

        *self.cleanup.lock() = Some(self.engine.cache().spawn_cleanup());
        self.updater.start().await;

        *self.state.write() = ServiceState::Running;
        info!("FX service started");
    }

    /// Stop background tasks and wait for them to exit.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        info!("Stopping FX service");
        *self.state.write() = ServiceState::ShuttingDown;

        self.updater.stop().await;
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup.stop().await;
        }

        *self.state.write() = ServiceState::Stopped;
        info!("FX service stopped");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn engine(&self) -> &Arc<FxEngine> {
        &self.engine
    }

    pub fn updater_status(&self) -> UpdaterStatus {
        self.updater.status()
    }
}
