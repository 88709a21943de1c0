use anyhow::{Context, Result};
use tracing::info;

use place_reviews::config::AppConfig;
use place_reviews::{init_tracing, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load().context("failed to load configuration")?;
    info!(
        data_dir = %config.data_dir.display(),
        sessions = config.max_extractor_sessions,
        ttl_minutes = config.cache_ttl_minutes,
        "place reviews service starting"
    );

    let state = AppState::initialize(config).context("failed to initialize service state")?;
    let tasks = state
        .start_background()
        .context("failed to start background tasks")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    state.shutdown();
    tasks.join().await;
    info!("place reviews service stopped");
    Ok(())
}
