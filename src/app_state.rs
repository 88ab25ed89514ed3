// =============================================================================
// Central Application State — SentiStream service
// =============================================================================
//
// Ties the shared components together: the connection manager and the query
// cache are the only state shared across connections, everything else in a
// stream task is task-local. Global counters back the metrics surface and
// are plain atomics so reading them never contends with the hot path.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::cache::{CacheStats, QueryCache};
use crate::config::StreamConfig;
use crate::connection::ConnectionManager;
use crate::store::MemoryStore;
use crate::stream::PollOutcome;

/// Shared service state, wrapped in `Arc` and handed to every axum handler
/// and stream task.
pub struct AppState {
    pub config: RwLock<StreamConfig>,
    pub connections: ConnectionManager,
    pub cache: Arc<QueryCache>,
    pub store: Arc<MemoryStore>,

    // ── Metrics counters ────────────────────────────────────────────────
    polls_total: AtomicU64,
    poll_failures: AtomicU64,
    poll_duration_ms_total: AtomicU64,
    events_emitted: AtomicU64,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            connections: ConnectionManager::new(config.max_connections),
            cache: Arc::new(QueryCache::new(config.cache_capacity)),
            store: Arc::new(MemoryStore::new()),
            config: RwLock::new(config),
            polls_total: AtomicU64::new(0),
            poll_failures: AtomicU64::new(0),
            poll_duration_ms_total: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    /// Record one completed poll tick.
    pub fn record_poll(&self, outcome: &PollOutcome) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
        self.poll_duration_ms_total
            .fetch_add(outcome.poll_duration_ms, Ordering::Relaxed);
    }

    /// Record one failed poll tick.
    pub fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` events written to some connection's stream.
    pub fn record_events(&self, count: u64) {
        self.events_emitted.fetch_add(count, Ordering::Relaxed);
    }

    /// Build the payload for the metrics endpoint.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let polls_total = self.polls_total.load(Ordering::Relaxed);
        let duration_total = self.poll_duration_ms_total.load(Ordering::Relaxed);

        MetricsSnapshot {
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            connections: ConnectionMetrics {
                current: self.connections.current_count(),
                active: self.connections.active_count(),
                max: self.connections.max_connections(),
            },
            cache: self.cache.stats(),
            polls: PollMetrics {
                total: polls_total,
                failures: self.poll_failures.load(Ordering::Relaxed),
                avg_duration_ms: if polls_total > 0 {
                    duration_total as f64 / polls_total as f64
                } else {
                    0.0
                },
            },
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            store_items: self.store.item_count(),
        }
    }
}

// =============================================================================
// Serialisable metrics payloads
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub server_time: i64,
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub cache: CacheStats,
    pub polls: PollMetrics,
    pub events_emitted: u64,
    pub store_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub current: usize,
    pub active: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollMetrics {
    pub total: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
}
