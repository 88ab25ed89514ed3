// =============================================================================
// Event Dispatcher — ordered, timestamped event frames per connection
// =============================================================================
//
// Wraps the send half of one connection's WebSocket. Every outbound frame
// is one JSON-encoded `StreamEvent`; frames leave in emission order with a
// per-connection sequence number, so the client can detect gaps.
//
// Latency is end-to-end: send time minus the newest contributing item's
// upstream timestamp. A negative value means the upstream clock and ours
// disagree — it is flagged (`is_clock_skew`) and passed through unclamped
// so the skew stays diagnosable.
//
// A write failure means the client is gone; the caller tears the connection
// down through the manager and never retries the write.
// =============================================================================

use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use chrono::Utc;
use futures_util::{Sink, SinkExt};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::stream::bucket::BucketEvent;

/// Wire-level event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BucketUpdate,
    PartialBucket,
    Heartbeat,
}

/// One outbound frame. Heartbeats carry no bucket fields.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub event_type: EventType,
    /// Per-connection emission counter, starting at 1.
    pub sequence: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_late_items: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_timestamp: Option<i64>,
    pub send_timestamp: i64,
    /// send_timestamp - origin_timestamp; absent on heartbeats. Negative
    /// under clock skew, never clamped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    pub is_clock_skew: bool,
}

impl StreamEvent {
    /// Build the wire event for one aggregator output.
    pub fn from_bucket(ev: &BucketEvent, sequence: u64, send_timestamp: i64) -> Self {
        let latency_ms = send_timestamp - ev.origin_timestamp;
        Self {
            event_type: if ev.bucket.is_complete {
                EventType::BucketUpdate
            } else {
                EventType::PartialBucket
            },
            sequence,
            window_start: Some(ev.bucket.window_start),
            window_end: Some(ev.bucket.window_end),
            item_count: Some(ev.bucket.item_count),
            aggregate_score: Some(ev.bucket.aggregate_score),
            has_late_items: Some(ev.bucket.has_late_items),
            origin_timestamp: Some(ev.origin_timestamp),
            send_timestamp,
            latency_ms: Some(latency_ms),
            is_clock_skew: latency_ms < 0,
        }
    }

    pub fn heartbeat(sequence: u64, send_timestamp: i64) -> Self {
        Self {
            event_type: EventType::Heartbeat,
            sequence,
            window_start: None,
            window_end: None,
            item_count: None,
            aggregate_score: None,
            has_late_items: None,
            origin_timestamp: None,
            send_timestamp,
            latency_ms: None,
            is_clock_skew: false,
        }
    }
}

/// Serializes events onto one connection's output stream in emission order.
pub struct EventDispatcher<S> {
    sender: S,
    connection_id: Uuid,
    sequence: u64,
    idle_window: Duration,
    last_emit_at: Instant,
}

impl<S> EventDispatcher<S>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    pub fn new(sender: S, connection_id: Uuid, idle_window: Duration) -> Self {
        Self {
            sender,
            connection_id,
            sequence: 0,
            idle_window,
            last_emit_at: Instant::now(),
        }
    }

    /// Emit one aggregator event. `Err` means the client is gone.
    pub async fn emit_bucket(&mut self, ev: &BucketEvent) -> Result<(), axum::Error> {
        let event = StreamEvent::from_bucket(ev, self.sequence + 1, Utc::now().timestamp_millis());
        if event.is_clock_skew {
            warn!(
                connection_id = %self.connection_id,
                origin_timestamp = ev.origin_timestamp,
                latency_ms = event.latency_ms.unwrap_or_default(),
                "negative event latency — upstream clock skew"
            );
        }
        self.send(event).await
    }

    /// Emit a heartbeat if nothing has gone out within the idle window.
    /// Returns whether a heartbeat was actually sent.
    pub async fn maybe_heartbeat(&mut self) -> Result<bool, axum::Error> {
        if self.last_emit_at.elapsed() < self.idle_window {
            return Ok(false);
        }
        self.heartbeat().await.map(|_| true)
    }

    /// Emit a heartbeat unconditionally. Also used as the final frame of a
    /// deadline-driven graceful close.
    pub async fn heartbeat(&mut self) -> Result<(), axum::Error> {
        let event = StreamEvent::heartbeat(self.sequence + 1, Utc::now().timestamp_millis());
        self.send(event).await
    }

    /// Answer a client Ping.
    pub async fn pong(&mut self, data: Vec<u8>) -> Result<(), axum::Error> {
        self.sender.send(Message::Pong(data.into())).await
    }

    /// Events emitted so far on this connection.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    async fn send(&mut self, event: StreamEvent) -> Result<(), axum::Error> {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                // Serialisation errors are not network errors; skip the
                // frame rather than killing the connection.
                warn!(connection_id = %self.connection_id, error = %e, "failed to serialise event");
                return Ok(());
            }
        };

        self.sender.send(Message::Text(json.into())).await?;
        self.sequence += 1;
        self.last_emit_at = Instant::now();
        debug!(
            connection_id = %self.connection_id,
            seq = self.sequence,
            event_type = ?event.event_type,
            "event sent"
        );
        Ok(())
    }
}
