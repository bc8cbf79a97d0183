//! Market Ingest
//!
//! Streams market data from the configured exchanges into the durable queue
//! and persists it until interrupted.

use market_ingest::{Config, Pipeline};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(filter)
        .init();

    info!("Starting Market Ingest");
    info!(
        exchanges = ?config.exchange_names(),
        queue = %config.queue.url,
        persistence = config.persistence.database_url.is_some(),
        "Configuration loaded"
    );

    let pipeline = Pipeline::connect(config).await?;
    pipeline
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await;

    Ok(())
}
