// =============================================================================
// SentiStream — Main Entry Point
// =============================================================================
//
// Real-time streaming backend for the sentiment dashboard: serves the
// `/api/v1/stream` push endpoint, the ingest endpoint the upstream compute
// pipeline writes to, and the health/metrics surface.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod cache;
mod config;
mod connection;
mod error;
mod store;
mod stream;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::StreamConfig;

const CONFIG_PATH: &str = "stream_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        SentiStream — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = StreamConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        StreamConfig::default()
    });

    // Override tickers from env if available.
    if let Ok(tickers) = std::env::var("SENTI_TICKERS") {
        config.tickers = tickers
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(
        max_connections = config.max_connections,
        poll_interval_secs = config.poll_interval_secs,
        cache_capacity = config.cache_capacity,
        tickers = ?config.tickers,
        "stream service configured"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config));

    // ── 3. Start the API server ──────────────────────────────────────────
    let bind_addr = std::env::var("SENTI_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3002".into());

    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {bind_addr}: {e}"))?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save stream config on shutdown");
    }

    info!("SentiStream shut down complete.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}
