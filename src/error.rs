// =============================================================================
// Error taxonomy
// =============================================================================
//
// Failures fall into distinct classes with different blast radii:
//   - Admission failures are reported synchronously to the caller and never
//     retried by the service.
//   - Backing-store failures are recovered locally (retry on the next poll
//     tick) and stay invisible to the client.
//   - Output-stream write failures are fatal to the one connection only;
//     they surface as `axum::Error` from the socket sink and trigger
//     teardown through the connection manager.
// =============================================================================

use thiserror::Error;

/// Returned by `ConnectionManager::acquire` when the service cannot admit
/// another streaming connection.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The concurrency bound is saturated. The caller should surface a
    /// "try again" signal to the client rather than queueing.
    #[error("connection limit reached ({current}/{max})")]
    AtCapacity { current: usize, max: usize },
}

/// Failures from the backing sentiment store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("backing store query failed: {0}")]
    Query(String),
}
