//! FxRates Service Binary
//!
//! Keeps exchange rates fresh in the rate store until interrupted.

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fxrates_server::{FxService, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting FxRates service");

    // Load configuration
    let config = ServerConfig::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let service = FxService::connect(&config).await?;
    service.start().await;

    info!(
        base = %config.engine.base_currency,
        provider = %config.provider.base_url,
        interval_secs = config.updater.interval.as_secs(),
        "FxRates service running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    service.stop().await;

    info!(status = ?service.updater_status(), "FxRates service shutdown complete");
    Ok(())
}
