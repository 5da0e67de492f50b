// =============================================================================
// Swing Signal Engine — Main Entry Point
// =============================================================================
//
// Boots the `Engine`, mounts the REST + WebSocket surface over it with axum,
// and serves until Ctrl+C. The engine starts with no outbound connections —
// `live_start`/`stream_start` are explicit, separate calls made over the API,
// never automatic on boot.
// =============================================================================

mod aggregator;
mod api;
mod backtest;
mod candle_store;
mod config;
mod csv_import;
mod detector;
mod engine;
mod error;
mod event_bus;
mod feed;
mod indicators;
mod micro_stream;
mod mtf;
mod scalp_card;
mod types;
mod veto;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;
use crate::engine::Engine;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("swing signal engine starting up");

    let config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    info!(symbol = %config.symbol, enable_micro_gate = config.enable_micro_gate, "runtime config loaded");

    let engine = Arc::new(Engine::new(config, CONFIG_PATH));
    engine.start();

    let bind_addr = std::env::var("SWING_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let app = api::rest::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "api server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "api server failed");
        }
    });

    info!("engine running. press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    server.abort();
    engine.stop();

    if let Err(e) = engine.config_snapshot().save(CONFIG_PATH) {
        tracing::error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("swing signal engine shut down complete");
    Ok(())
}
