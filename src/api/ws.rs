// =============================================================================
// Streaming endpoint — push-based bucket updates over WebSocket
// =============================================================================
//
// Clients connect to `/api/v1/stream?ticker=AAPL&resolution=5m[&from=ms]`
// and receive one JSON event per text frame: `partial_bucket` while a
// window accumulates, a terminal `bucket_update` when it completes, and
// `heartbeat` frames while idle.
//
// Admission happens before the upgrade: a saturated service answers with
// 503 so the client gets an explicit "try again" signal instead of a hung
// socket. After the upgrade the subscription is fixed — inbound text frames
// are ignored; changing ticker or resolution means reconnecting (ideally
// with `from` set to the last received window_start).
//
// One tokio task drives the whole connection: poll tick, heartbeat check,
// client frames and the lifetime deadline are multiplexed through a single
// `tokio::select!`, and the cancellation token is one of its arms, so a
// release from anywhere stops the loop within a tick.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::connection::ConnectionHandle;
use crate::store::SentimentStore;
use crate::stream::{BucketAggregator, EventDispatcher, PollCycle};
use crate::types::{Resolution, Subscription};

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct StreamQuery {
    ticker: String,
    resolution: String,
    /// Optional resume point (epoch ms of the last received window_start).
    from: Option<i64>,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

/// Axum handler for the streaming upgrade request.
///
/// Validates the subscription parameters and acquires a connection slot
/// before upgrading; rejection is an explicit HTTP status, never a hang.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let resolution: Resolution = match query.resolution.parse() {
        Ok(r) => r,
        Err(e) => {
            debug!(resolution = %query.resolution, "stream rejected: bad resolution");
            return (StatusCode::BAD_REQUEST, e).into_response();
        }
    };

    let ticker = query.ticker.trim().to_uppercase();
    if ticker.is_empty() {
        return (StatusCode::BAD_REQUEST, "ticker must not be empty").into_response();
    }
    if !state.config.read().allows_ticker(&ticker) {
        debug!(ticker = %ticker, "stream rejected: ticker not configured");
        return (StatusCode::NOT_FOUND, "ticker not configured").into_response();
    }

    let subscription = Subscription {
        ticker,
        resolution,
        from: query.from,
    };

    match state.connections.acquire(subscription) {
        Ok(handle) => ws
            .on_upgrade(move |socket| run_stream(socket, state, handle))
            .into_response(),
        Err(e) => {
            warn!(error = %e, "stream rejected at capacity");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "connection limit reached — try again shortly",
            )
                .into_response()
        }
    }
}

// =============================================================================
// Connection task
// =============================================================================

/// Drives a single streaming connection for its whole lifetime.
async fn run_stream(socket: WebSocket, state: Arc<AppState>, handle: ConnectionHandle) {
    state.connections.mark_active(handle.id);

    let (sender, mut receiver) = socket.split();

    let (poll_secs, idle_secs, max_stream_secs, policy) = {
        let cfg = state.config.read();
        (
            cfg.poll_interval_secs,
            cfg.heartbeat_idle_secs,
            cfg.max_stream_secs,
            cfg.aggregate_policy,
        )
    };

    let mut dispatcher = EventDispatcher::new(sender, handle.id, Duration::from_secs(idle_secs));

    let now_ms = Utc::now().timestamp_millis();
    let store: Arc<dyn SentimentStore> = state.store.clone();
    let mut poll = PollCycle::new(
        handle.subscription.clone(),
        state.cache.clone(),
        store,
        now_ms,
        // Shared cache entries stay live for one poll interval before a
        // tick refreshes them.
        (poll_secs.max(1) * 1000) as i64,
    );
    let mut aggregator = BucketAggregator::new(handle.subscription.resolution, policy);

    // Hosting runtimes cap execution time; close gracefully before the cap
    // instead of being killed mid-write.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(max_stream_secs);

    let mut poll_interval = interval(Duration::from_secs(poll_secs.max(1)));
    // A slow store query must not be followed by a burst of catch-up ticks.
    poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut heartbeat_check = interval(Duration::from_secs(1));

    'stream: loop {
        tokio::select! {
            // ── Cancellation (release, server shutdown) ─────────────────
            _ = handle.cancel.cancelled() => {
                info!(connection_id = %handle.id, "stream cancelled");
                break 'stream;
            }

            // ── Lifetime deadline: final frame, then drain ──────────────
            _ = tokio::time::sleep_until(deadline) => {
                state.connections.mark_draining(handle.id);
                info!(connection_id = %handle.id, "stream deadline reached — closing gracefully");
                let _ = dispatcher.heartbeat().await;
                break 'stream;
            }

            // ── Poll tick ───────────────────────────────────────────────
            _ = poll_interval.tick() => {
                let now_ms = Utc::now().timestamp_millis();
                match poll.tick(now_ms).await {
                    Ok(outcome) => {
                        state.record_poll(&outcome);
                        // Fold even when nothing changed: elapsed windows
                        // still owe their terminal bucket_update.
                        let events = aggregator.fold(&outcome.items, now_ms);
                        for ev in &events {
                            if let Err(e) = dispatcher.emit_bucket(ev).await {
                                debug!(connection_id = %handle.id, error = %e, "write failed — tearing down");
                                break 'stream;
                            }
                            state.record_events(1);
                        }
                    }
                    Err(_) => {
                        // Already logged inside the poll cycle; the next
                        // scheduled tick retries.
                        state.record_poll_failure();
                    }
                }
            }

            // ── Heartbeat check ─────────────────────────────────────────
            _ = heartbeat_check.tick() => {
                match dispatcher.maybe_heartbeat().await {
                    Ok(sent) => {
                        if sent {
                            state.record_events(1);
                        }
                    }
                    Err(e) => {
                        debug!(connection_id = %handle.id, error = %e, "heartbeat write failed — tearing down");
                        break 'stream;
                    }
                }
            }

            // ── Client frames ───────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if dispatcher.pong(data.into()).await.is_err() {
                            break 'stream;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Text(text))) => {
                        // Subscriptions are fixed for the connection's
                        // lifetime; mid-stream commands are not a thing.
                        debug!(connection_id = %handle.id, msg = %text, "mid-stream text frame ignored");
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(connection_id = %handle.id, "binary frame ignored");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(connection_id = %handle.id, "close frame received");
                        break 'stream;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %handle.id, error = %e, "receive error — tearing down");
                        break 'stream;
                    }
                    None => {
                        info!(connection_id = %handle.id, "client stream ended");
                        break 'stream;
                    }
                }
            }
        }
    }

    // Idempotent: also cancels the token if teardown started here rather
    // than through an external release.
    state.connections.release(handle.id);
}
