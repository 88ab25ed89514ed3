// =============================================================================
// Connection Manager — admission control for streaming connections
// =============================================================================
//
// Tracks every live streaming connection, enforces the `max_connections`
// bound atomically at acquire time, and owns each connection's cancellation
// token. Poll cycles and dispatchers only ever see a `ConnectionHandle`;
// the `Connection` record itself never leaves this module.
//
// Lifecycle: Acquiring → Active → Draining → Closed. No other transition is
// legal and a closed connection id is never reused (ids are random UUIDs).
//
// `release` is idempotent: releasing an id that is unknown or already
// released is a no-op, which lets the stream task, the axum disconnect path
// and server shutdown all call it without coordination.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AdmissionError;
use crate::types::Subscription;

/// Lifecycle state of one streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Admitted but the stream task has not started polling yet.
    Acquiring,
    Active,
    /// Graceful close in progress (deadline reached or shutdown).
    Draining,
    Closed,
}

impl ConnectionState {
    /// The next state in the lifecycle. Closed is terminal.
    fn next(self) -> Self {
        match self {
            Self::Acquiring => Self::Active,
            Self::Active => Self::Draining,
            Self::Draining => Self::Closed,
            Self::Closed => Self::Closed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Acquiring => write!(f, "Acquiring"),
            Self::Active => write!(f, "Active"),
            Self::Draining => write!(f, "Draining"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// One admitted streaming connection. Owned exclusively by the manager.
struct Connection {
    subscription: Subscription,
    acquired_at: DateTime<Utc>,
    state: ConnectionState,
    cancel: CancellationToken,
}

/// What the stream task receives on admission: the connection id, the
/// subscription it serves and the token that cancels its poll cycle.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub subscription: Subscription,
    pub cancel: CancellationToken,
}

/// Tracks active streaming connections and enforces the concurrency bound.
pub struct ConnectionManager {
    connections: Mutex<HashMap<Uuid, Connection>>,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    /// Admit a new connection or reject it at capacity.
    ///
    /// The bound check and the insert happen under one lock acquisition, so
    /// concurrent acquires can never overshoot `max_connections`. Rejection
    /// is immediate and reported to the caller; nothing is queued.
    pub fn acquire(&self, subscription: Subscription) -> Result<ConnectionHandle, AdmissionError> {
        let mut map = self.connections.lock();

        let current = map.len();
        if current >= self.max_connections {
            warn!(
                current,
                max = self.max_connections,
                ticker = %subscription.ticker,
                "connection rejected — at capacity"
            );
            return Err(AdmissionError::AtCapacity {
                current,
                max: self.max_connections,
            });
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        map.insert(
            id,
            Connection {
                subscription: subscription.clone(),
                acquired_at: Utc::now(),
                state: ConnectionState::Acquiring,
                cancel: cancel.clone(),
            },
        );

        info!(
            connection_id = %id,
            ticker = %subscription.ticker,
            resolution = %subscription.resolution,
            count = map.len(),
            "connection acquired"
        );

        Ok(ConnectionHandle {
            id,
            subscription,
            cancel,
        })
    }

    /// Transition Acquiring → Active. Returns `false` (and logs) when the
    /// connection is unknown or in any other state.
    pub fn mark_active(&self, id: Uuid) -> bool {
        let mut map = self.connections.lock();
        match map.get_mut(&id) {
            Some(conn) if conn.state == ConnectionState::Acquiring => {
                conn.state = ConnectionState::Active;
                debug!(connection_id = %id, "connection active");
                true
            }
            Some(conn) => {
                warn!(connection_id = %id, state = %conn.state, "illegal transition to Active ignored");
                false
            }
            None => false,
        }
    }

    /// Transition Active → Draining ahead of a graceful close.
    pub fn mark_draining(&self, id: Uuid) -> bool {
        let mut map = self.connections.lock();
        match map.get_mut(&id) {
            Some(conn) if conn.state == ConnectionState::Active => {
                conn.state = ConnectionState::Draining;
                debug!(connection_id = %id, "connection draining");
                true
            }
            Some(conn) => {
                warn!(connection_id = %id, state = %conn.state, "illegal transition to Draining ignored");
                false
            }
            None => false,
        }
    }

    /// Retire a connection: cancel its poll cycle and drop its record.
    ///
    /// Idempotent — releasing an unknown or already-released id is a no-op.
    /// Shared cache entries are untouched; the cache evicts on its own LRU
    /// schedule, not because one subscriber went away.
    pub fn release(&self, id: Uuid) {
        let removed = self.connections.lock().remove(&id);
        match removed {
            Some(mut conn) => {
                conn.cancel.cancel();
                // Walk the remaining lifecycle in order; an Active
                // connection passes through Draining on its way out rather
                // than jumping straight to Closed.
                while conn.state != ConnectionState::Closed {
                    let next = conn.state.next();
                    debug!(connection_id = %id, from = %conn.state, to = %next, "connection state advanced");
                    conn.state = next;
                }
                let held_for = Utc::now() - conn.acquired_at;
                info!(
                    connection_id = %id,
                    ticker = %conn.subscription.ticker,
                    held_secs = held_for.num_seconds(),
                    "connection released"
                );
            }
            None => {
                debug!(connection_id = %id, "release of unknown connection ignored");
            }
        }
    }

    /// Number of connections currently counted against the bound
    /// (states Acquiring, Active and Draining — closed records are removed
    /// on release, so they never linger here).
    pub fn current_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Number of connections in Active or Draining state.
    pub fn active_count(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|c| {
                matches!(
                    c.state,
                    ConnectionState::Active | ConnectionState::Draining
                )
            })
            .count()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Current state of a connection, if it is still tracked.
    pub fn state_of(&self, id: Uuid) -> Option<ConnectionState> {
        self.connections.lock().get(&id).map(|c| c.state)
    }
}
