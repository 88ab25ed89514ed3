// =============================================================================
// Stream Configuration — tunable service settings with atomic save
// =============================================================================
//
// Every tunable of the streaming service lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry serde defaults so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::stream::AggregatePolicy;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_max_connections() -> usize {
    256
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_cache_capacity() -> usize {
    256
}

fn default_heartbeat_idle_secs() -> u64 {
    15
}

/// 14.5 minutes — comfortably inside a 15-minute hosting execution cap.
fn default_max_stream_secs() -> u64 {
    870
}

// =============================================================================
// StreamConfig
// =============================================================================

/// Top-level configuration for the streaming service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Hard bound on concurrent streaming connections. Acquire attempts
    /// beyond this are rejected immediately.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds between poll ticks for every connection.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Maximum entries in the shared query cache (LRU beyond this).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Idle seconds on a connection before a heartbeat frame is emitted to
    /// keep intermediaries from timing the connection out.
    #[serde(default = "default_heartbeat_idle_secs")]
    pub heartbeat_idle_secs: u64,

    /// Maximum lifetime of one streaming connection. Approaching this
    /// triggers a graceful close (final frame, then Draining) instead of
    /// letting the hosting runtime kill the task mid-write.
    #[serde(default = "default_max_stream_secs")]
    pub max_stream_secs: u64,

    /// How item scores combine into a bucket's aggregate.
    #[serde(default)]
    pub aggregate_policy: AggregatePolicy,

    /// Tickers clients may subscribe to. Empty means unrestricted.
    #[serde(default)]
    pub tickers: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            poll_interval_secs: default_poll_interval_secs(),
            cache_capacity: default_cache_capacity(),
            heartbeat_idle_secs: default_heartbeat_idle_secs(),
            max_stream_secs: default_max_stream_secs(),
            aggregate_policy: AggregatePolicy::default(),
            tickers: Vec::new(),
        }
    }
}

impl StreamConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read stream config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse stream config from {}", path.display()))?;

        info!(
            path = %path.display(),
            max_connections = config.max_connections,
            poll_interval_secs = config.poll_interval_secs,
            "stream config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise stream config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "stream config saved (atomic)");
        Ok(())
    }

    /// Whether `ticker` may be subscribed to under this config.
    pub fn allows_ticker(&self, ticker: &str) -> bool {
        self.tickers.is_empty() || self.tickers.iter().any(|t| t == ticker)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.poll_interval_secs, 2);
        assert_eq!(cfg.cache_capacity, 256);
        assert_eq!(cfg.heartbeat_idle_secs, 15);
        assert_eq!(cfg.max_stream_secs, 870);
        assert_eq!(cfg.aggregate_policy, AggregatePolicy::Mean);
        assert!(cfg.tickers.is_empty());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: StreamConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.aggregate_policy, AggregatePolicy::Mean);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "max_connections": 8, "aggregate_policy": "last_value" }"#;
        let cfg: StreamConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.aggregate_policy, AggregatePolicy::LastValue);
        assert_eq!(cfg.poll_interval_secs, 2);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = StreamConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: StreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.max_connections, cfg2.max_connections);
        assert_eq!(cfg.max_stream_secs, cfg2.max_stream_secs);
    }

    #[test]
    fn ticker_allowlist() {
        let mut cfg = StreamConfig::default();
        assert!(cfg.allows_ticker("AAPL"));

        cfg.tickers = vec!["AAPL".into(), "MSFT".into()];
        assert!(cfg.allows_ticker("AAPL"));
        assert!(!cfg.allows_ticker("TSLA"));
    }
}
