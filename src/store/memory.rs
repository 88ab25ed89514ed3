// =============================================================================
// In-memory sentiment store
// =============================================================================
//
// Backs the service when no external persistence layer is wired in: the
// upstream compute pipeline pushes freshly computed items through the
// ingest endpoint and poll cycles query them back out. Also the store used
// by the integration-style tests.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::store::SentimentStore;
use crate::types::{Resolution, SentimentItem};

/// Per-ticker retention cap. Old items beyond this are trimmed on ingest;
/// streaming only ever asks for recent windows.
const MAX_ITEMS_PER_TICKER: usize = 10_000;

/// Thread-safe in-memory item store keyed by ticker.
pub struct MemoryStore {
    items: RwLock<HashMap<String, Vec<SentimentItem>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Append freshly computed items for `ticker`, keeping the per-ticker
    /// series sorted by timestamp. Returns how many items were accepted.
    pub fn ingest(&self, ticker: &str, mut new_items: Vec<SentimentItem>) -> usize {
        if new_items.is_empty() {
            return 0;
        }
        let accepted = new_items.len();

        let mut map = self.items.write();
        let series = map.entry(ticker.to_uppercase()).or_default();
        series.append(&mut new_items);
        series.sort_by_key(|i| i.timestamp);

        if series.len() > MAX_ITEMS_PER_TICKER {
            let excess = series.len() - MAX_ITEMS_PER_TICKER;
            series.drain(..excess);
        }

        debug!(ticker = %ticker, accepted, total = series.len(), "items ingested");
        accepted
    }

    /// Total items held across all tickers.
    pub fn item_count(&self) -> usize {
        self.items.read().values().map(Vec::len).sum()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SentimentStore for MemoryStore {
    async fn query(
        &self,
        ticker: &str,
        _resolution: Resolution,
        since: i64,
    ) -> Result<Vec<SentimentItem>, StoreError> {
        let map = self.items.read();
        let result = map
            .get(&ticker.to_uppercase())
            .map(|series| {
                // Series is sorted, so find the first item past `since` and
                // clone the tail.
                let start = series.partition_point(|i| i.timestamp <= since);
                series[start..].to_vec()
            })
            .unwrap_or_default();
        Ok(result)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn item(ts: i64, score: f64) -> SentimentItem {
        SentimentItem {
            timestamp: ts,
            score,
            source: "news".into(),
        }
    }

    #[tokio::test]
    async fn query_returns_items_after_since_only() {
        let store = MemoryStore::new();
        store.ingest("AAPL", vec![item(100, 0.1), item(200, 0.2), item(300, 0.3)]);

        let result = store
            .query("AAPL", Resolution::OneMinute, 150)
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].timestamp, 200);

        // `since` is exclusive.
        let result = store
            .query("AAPL", Resolution::OneMinute, 300)
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn query_unknown_ticker_is_empty_not_error() {
        let store = MemoryStore::new();
        let result = store
            .query("ZZZZ", Resolution::OneHour, 0)
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn ingest_sorts_out_of_order_items() {
        let store = MemoryStore::new();
        store.ingest("msft", vec![item(300, 0.3), item(100, 0.1)]);
        store.ingest("MSFT", vec![item(200, 0.2)]);

        let result = store
            .query("MSFT", Resolution::OneMinute, 0)
            .await
            .unwrap();
        let stamps: Vec<i64> = result.iter().map(|i| i.timestamp).collect();
        assert_eq!(stamps, vec![100, 200, 300]);
    }
}
