// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Authentication is handled by the
// surrounding platform (the dashboard gateway), not here.
//
// CORS is configured permissively for development; tighten
// `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::types::SentimentItem;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/metrics", get(metrics))
        .route("/api/v1/ingest", post(ingest))
        // ── Streaming (handled in the ws module, mounted here) ──────
        .route("/api/v1/stream", get(crate::api::ws::stream_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Metrics
// =============================================================================

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics_snapshot())
}

// =============================================================================
// Ingest — upstream compute pipeline pushes fresh sentiment results
// =============================================================================

#[derive(Deserialize)]
struct IngestRequest {
    ticker: String,
    items: Vec<SentimentItem>,
}

#[derive(Serialize)]
struct IngestResponse {
    ticker: String,
    accepted: usize,
}

async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> impl IntoResponse {
    let ticker = req.ticker.trim().to_uppercase();
    if ticker.is_empty() {
        return (StatusCode::BAD_REQUEST, "ticker must not be empty").into_response();
    }

    let accepted = state.store.ingest(&ticker, req.items);
    info!(ticker = %ticker, accepted, "sentiment items ingested");

    Json(IngestResponse { ticker, accepted }).into_response()
}
