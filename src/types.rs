// =============================================================================
// Shared types used across the SentiStream service
// =============================================================================

use serde::{Deserialize, Serialize};

/// Bucket width a connection subscribes to.
///
/// Only this fixed set is accepted at connection-open time; there is no
/// free-form interval parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "10m")]
    TenMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl Resolution {
    /// Bucket width in milliseconds.
    pub fn as_millis(&self) -> i64 {
        match self {
            Self::OneMinute => 60_000,
            Self::FiveMinutes => 300_000,
            Self::TenMinutes => 600_000,
            Self::OneHour => 3_600_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::TenMinutes => "10m",
            Self::OneHour => "1h",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::OneMinute),
            "5m" => Ok(Self::FiveMinutes),
            "10m" => Ok(Self::TenMinutes),
            "1h" => Ok(Self::OneHour),
            other => Err(format!("unsupported resolution: {other}")),
        }
    }
}

/// Compute the owning window start for a timestamp at the given resolution:
/// `floor(ts / width) * width`. Works for negative timestamps too
/// (floor division, not truncation).
pub fn window_start(timestamp_ms: i64, resolution: Resolution) -> i64 {
    let width = resolution.as_millis();
    timestamp_ms.div_euclid(width) * width
}

/// A single raw sentiment/volatility result produced by the upstream compute
/// pipeline and held in the backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentItem {
    /// Epoch milliseconds at which the result was computed upstream.
    pub timestamp: i64,
    /// Sentiment/volatility score.
    pub score: f64,
    /// Which upstream source produced the result (news, social, ...).
    pub source: String,
}

/// What one streaming connection is subscribed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub ticker: String,
    pub resolution: Resolution,
    /// Optional start-of-window for resuming after a reconnect. When absent
    /// the stream starts from the window that owns the current time.
    pub from: Option<i64>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_roundtrip() {
        for s in ["1m", "5m", "10m", "1h"] {
            let r: Resolution = s.parse().unwrap();
            assert_eq!(r.as_str(), s);
        }
        assert!("2m".parse::<Resolution>().is_err());
        assert!("".parse::<Resolution>().is_err());
    }

    #[test]
    fn resolution_serde_uses_short_names() {
        let json = serde_json::to_string(&Resolution::FiveMinutes).unwrap();
        assert_eq!(json, "\"5m\"");
        let r: Resolution = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(r, Resolution::OneHour);
    }

    #[test]
    fn window_start_floors() {
        // 1700000123456 ms into a 5m grid.
        let ws = window_start(1_700_000_123_456, Resolution::FiveMinutes);
        assert_eq!(ws, 1_700_000_100_000);
        assert!(ws <= 1_700_000_123_456);
        assert_eq!(ws % 300_000, 0);

        // Exact boundary maps to itself.
        assert_eq!(window_start(600_000, Resolution::TenMinutes), 600_000);
    }

    #[test]
    fn window_start_negative_timestamps() {
        // Floor division, not truncation toward zero.
        assert_eq!(window_start(-1, Resolution::OneMinute), -60_000);
    }
}
