// =============================================================================
// Poll Cycle — per-connection cache-first polling over the backing store
// =============================================================================
//
// One PollCycle per streaming connection, driven by the stream task's tick
// interval. Each tick resolves to one of:
//   - cache hit: the shared entry is younger than the freshness window AND
//     reaches at least as far back as this connection needs; serve straight
//     from the cache, no store round-trip;
//   - miss, stale entry, or entry that does not cover the connection's
//     range: query the store, repopulate the cache, serve the fresh result.
//
// Delivery is deduplicated by item identity (timestamp, source), not by a
// single max-timestamp watermark: an item landing in the store out of
// order still reaches the aggregator exactly once, where the late-arrival
// attribution lives.
//
// A failed store query is logged and the error is handed back to the stream
// task; the cycle itself keeps no retry state, so the next attempt happens
// on the next *scheduled* tick and never earlier (no retry storm).
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{CacheKey, QueryCache};
use crate::error::StoreError;
use crate::store::SentimentStore;
use crate::types::{window_start, SentimentItem, Subscription};

/// What one tick produced.
#[derive(Debug)]
pub struct PollOutcome {
    /// Items this connection has not delivered before, oldest-first.
    pub items: Vec<SentimentItem>,
    /// len of `items`; kept separate because the items are consumed by the
    /// aggregator while the count feeds the metrics surface.
    pub changed_count: usize,
    pub poll_duration_ms: u64,
    pub cache_hit: bool,
}

/// Diagnostic counters for one connection's poll loop. Non-authoritative;
/// the metrics endpoint aggregates the global equivalents.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStats {
    pub polls: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub last_item_count: usize,
    pub last_duration_ms: u64,
}

/// Per-connection polling engine. Holds the connection's delivery state;
/// the cache and store are shared and injected.
pub struct PollCycle {
    subscription: Subscription,
    cache: Arc<QueryCache>,
    store: Arc<dyn SentimentStore>,
    /// A shared cache entry older than this (relative to the tick's
    /// `now_ms`) is refreshed even on a key hit, so new items appearing
    /// mid-window reach connections within one freshness interval.
    freshness_ms: i64,
    /// Delivery lower bound, fixed at construction: the resume point, or
    /// the start of the window that was current at connect time.
    floor: i64,
    /// Timestamp of the newest item this connection has delivered.
    last_seen: i64,
    /// Identity of every item already delivered and still inside the query
    /// range. Pruned each tick as the range's lower bound advances.
    seen: HashSet<(i64, String)>,
    stats: PollStats,
}

impl PollCycle {
    /// `now_ms` anchors the cold-start floor when the subscription does not
    /// carry an explicit resume point; `freshness_ms` is how long a shared
    /// cache entry may be served before being refreshed (the poll interval
    /// is the natural choice).
    pub fn new(
        subscription: Subscription,
        cache: Arc<QueryCache>,
        store: Arc<dyn SentimentStore>,
        now_ms: i64,
        freshness_ms: i64,
    ) -> Self {
        let floor = subscription
            .from
            .unwrap_or_else(|| window_start(now_ms, subscription.resolution));
        Self {
            subscription,
            cache,
            store,
            freshness_ms,
            floor,
            last_seen: floor,
            seen: HashSet::new(),
            stats: PollStats::default(),
        }
    }

    /// Run one poll tick at wall-clock `now_ms`.
    ///
    /// On `Err` the delivery state and stats (other than the failure
    /// counter) are untouched, so the next tick retries the same range.
    pub async fn tick(&mut self, now_ms: i64) -> Result<PollOutcome, StoreError> {
        let started = Instant::now();
        let resolution = self.subscription.resolution;
        let current_window = window_start(now_ms, resolution);

        let key = CacheKey {
            ticker: self.subscription.ticker.clone(),
            resolution,
            window_start: current_window,
        };

        // Cover the current window and its predecessor so freshly opened
        // buckets and the just-closed one are both served from a single
        // entry. A resumed connection may need to reach further back.
        let since_needed = self
            .last_seen
            .min(current_window - resolution.as_millis());

        let (all_items, cache_hit) = match self.cache.get(&key) {
            Some(entry)
                if now_ms - entry.computed_at < self.freshness_ms
                    && entry.covers_since <= since_needed =>
            {
                (entry.items, true)
            }
            cached => {
                if cached.is_some() {
                    debug!(key = %key, "cache entry stale or too narrow — refreshing");
                }
                let fetched = match self
                    .store
                    .query(&self.subscription.ticker, resolution, since_needed)
                    .await
                {
                    Ok(items) => items,
                    Err(e) => {
                        self.stats.failures += 1;
                        warn!(
                            ticker = %self.subscription.ticker,
                            error = %e,
                            "backing-store query failed — will retry on next tick"
                        );
                        return Err(e);
                    }
                };
                self.cache.put(key, fetched.clone(), since_needed, now_ms);
                (fetched, false)
            }
        };

        // Queries from here on use a `since` at or past `since_needed`, so
        // identities at or below it can never resurface.
        self.seen.retain(|(ts, _)| *ts > since_needed);

        let items: Vec<SentimentItem> = all_items
            .into_iter()
            .filter(|i| {
                i.timestamp > self.floor && self.seen.insert((i.timestamp, i.source.clone()))
            })
            .collect();

        if let Some(newest) = items.iter().map(|i| i.timestamp).max() {
            self.last_seen = self.last_seen.max(newest);
        }

        let poll_duration_ms = started.elapsed().as_millis() as u64;
        self.stats.polls += 1;
        if cache_hit {
            self.stats.cache_hits += 1;
        }
        self.stats.last_item_count = items.len();
        self.stats.last_duration_ms = poll_duration_ms;

        let changed_count = items.len();
        Ok(PollOutcome {
            items,
            changed_count,
            poll_duration_ms,
            cache_hit,
        })
    }

    /// Newest item timestamp this connection has delivered.
    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{AggregatePolicy, BucketAggregator};
    use crate::types::Resolution;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Store that counts queries, accepts pushed items, and can be flipped
    /// into a failing mode.
    struct CountingStore {
        items: Mutex<Vec<SentimentItem>>,
        queries: AtomicUsize,
        failing: AtomicBool,
    }

    impl CountingStore {
        fn new(items: Vec<SentimentItem>) -> Self {
            Self {
                items: Mutex::new(items),
                queries: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }

        fn push(&self, item: SentimentItem) {
            self.items.lock().push(item);
        }
    }

    #[async_trait]
    impl SentimentStore for CountingStore {
        async fn query(
            &self,
            _ticker: &str,
            _resolution: Resolution,
            since: i64,
        ) -> Result<Vec<SentimentItem>, StoreError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected outage".into()));
            }
            let mut items: Vec<SentimentItem> = self
                .items
                .lock()
                .iter()
                .filter(|i| i.timestamp > since)
                .cloned()
                .collect();
            items.sort_by_key(|i| i.timestamp);
            Ok(items)
        }
    }

    fn item(ts: i64, score: f64) -> SentimentItem {
        SentimentItem {
            timestamp: ts,
            score,
            source: "news".into(),
        }
    }

    fn sub(ticker: &str, from: Option<i64>) -> Subscription {
        Subscription {
            ticker: ticker.into(),
            resolution: Resolution::FiveMinutes,
            from,
        }
    }

    // Anchor inside the window starting at 600_000 (5m grid).
    const NOW: i64 = 750_000;
    const FRESHNESS: i64 = 2_000;

    fn cycle(
        subscription: Subscription,
        cache: Arc<QueryCache>,
        store: Arc<CountingStore>,
        now_ms: i64,
    ) -> PollCycle {
        PollCycle::new(subscription, cache, store, now_ms, FRESHNESS)
    }

    #[tokio::test]
    async fn cold_start_queries_store_then_populates_cache() {
        let cache = Arc::new(QueryCache::new(16));
        let store = Arc::new(CountingStore::new(vec![item(610_000, 0.4), item(700_000, 0.6)]));

        let mut poll = cycle(sub("AAPL", None), cache.clone(), store.clone(), NOW);
        let outcome = poll.tick(NOW).await.unwrap();

        assert!(!outcome.cache_hit);
        assert_eq!(outcome.changed_count, 2);
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(poll.last_seen(), 700_000);
    }

    #[tokio::test]
    async fn second_connection_same_key_hits_cache() {
        let cache = Arc::new(QueryCache::new(16));
        let store = Arc::new(CountingStore::new(vec![item(610_000, 0.4)]));

        let mut first = cycle(sub("AAPL", None), cache.clone(), store.clone(), NOW);
        first.tick(NOW).await.unwrap();
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);

        let mut second = cycle(sub("AAPL", None), cache.clone(), store.clone(), NOW);
        let outcome = second.tick(NOW + 100).await.unwrap();

        assert!(outcome.cache_hit);
        assert_eq!(outcome.changed_count, 1);
        // Zero additional backing-store queries for this window.
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_hit_within_interval_then_refresh_after() {
        let cache = Arc::new(QueryCache::new(16));
        let store = Arc::new(CountingStore::new(vec![item(610_000, 0.4)]));

        let mut poll = cycle(sub("AAPL", None), cache.clone(), store.clone(), NOW);
        let first = poll.tick(NOW).await.unwrap();
        assert_eq!(first.changed_count, 1);

        // Within the freshness window: served from cache, nothing new.
        let second = poll.tick(NOW + 1_000).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.changed_count, 0);
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);

        // Past the freshness window: re-queried, still nothing new because
        // the item was already delivered.
        let third = poll.tick(NOW + 3_000).await.unwrap();
        assert!(!third.cache_hit);
        assert_eq!(third.changed_count, 0);
        assert_eq!(store.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mid_window_items_delivered_on_refresh() {
        let cache = Arc::new(QueryCache::new(16));
        let store = Arc::new(CountingStore::new(vec![item(700_000, 0.6)]));

        let mut poll = cycle(sub("AAPL", None), cache.clone(), store.clone(), NOW);
        let first = poll.tick(NOW).await.unwrap();
        assert_eq!(first.changed_count, 1);

        // A new item lands mid-window, newer than anything delivered.
        store.push(item(760_000, 0.8));

        // Same window, but the cache entry has aged out: the tick must
        // re-query and deliver the new item instead of serving the frozen
        // snapshot for the rest of the window.
        let second = poll.tick(NOW + 4_000).await.unwrap();
        assert!(!second.cache_hit);
        assert_eq!(second.changed_count, 1);
        assert_eq!(second.items[0].timestamp, 760_000);
        assert_eq!(store.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn out_of_order_item_survives_to_the_aggregator() {
        let cache = Arc::new(QueryCache::new(16));
        let store = Arc::new(CountingStore::new(vec![item(610_000, 0.5)]));

        let mut poll = cycle(sub("AAPL", None), cache.clone(), store.clone(), 650_000);
        let mut agg = BucketAggregator::new(Resolution::FiveMinutes, AggregatePolicy::Mean);

        let outcome = poll.tick(650_000).await.unwrap();
        agg.fold(&outcome.items, 650_000);

        // Empty tick after the window end closes [600_000, 900_000).
        let outcome = poll.tick(910_000).await.unwrap();
        assert_eq!(outcome.changed_count, 0);
        agg.fold(&outcome.items, 910_000);
        assert_eq!(agg.completed_watermark(), 600_000);

        // An item older than everything delivered so far lands in the
        // store after its window closed.
        store.push(item(605_000, 0.7));

        // It must still be delivered (not filtered as already-seen) so the
        // aggregator can attribute and flag it.
        let outcome = poll.tick(953_000).await.unwrap();
        assert_eq!(outcome.changed_count, 1);
        assert_eq!(outcome.items[0].timestamp, 605_000);

        let events = agg.fold(&outcome.items, 953_000);
        assert_eq!(events.len(), 1);
        let b = &events[0].bucket;
        assert_eq!(b.window_start, 900_000);
        assert!(b.has_late_items);
        assert_eq!(b.item_count, 1);
    }

    #[tokio::test]
    async fn narrow_cache_entry_is_not_a_hit_for_a_resumed_connection() {
        let cache = Arc::new(QueryCache::new(16));
        let store = Arc::new(CountingStore::new(vec![item(10_000, 0.1), item(700_000, 0.6)]));

        // A live connection populates the entry covering the current window
        // plus its predecessor (since 300_000).
        let mut live = cycle(sub("AAPL", None), cache.clone(), store.clone(), NOW);
        let outcome = live.tick(NOW).await.unwrap();
        assert_eq!(outcome.changed_count, 1);
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);

        // A resumed connection needs everything since 0. The fresh entry's
        // range is too narrow for it, so the key match must not count as a
        // hit — otherwise the item at 10_000 would be skipped.
        let mut resumed = cycle(sub("AAPL", Some(0)), cache.clone(), store.clone(), NOW);
        let outcome = resumed.tick(NOW + 100).await.unwrap();

        assert!(!outcome.cache_hit);
        assert_eq!(outcome.changed_count, 2);
        assert_eq!(outcome.items[0].timestamp, 10_000);
        assert_eq!(store.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_failure_recovers_on_next_tick() {
        let cache = Arc::new(QueryCache::new(16));
        let store = Arc::new(CountingStore::new(vec![item(610_000, 0.4)]));
        store.failing.store(true, Ordering::SeqCst);

        let mut poll = cycle(sub("AAPL", None), cache.clone(), store.clone(), NOW);

        // Tick N fails; nothing is cached and the delivery state holds.
        assert!(poll.tick(NOW).await.is_err());
        assert_eq!(poll.stats().failures, 1);
        assert_eq!(cache.len(), 0);
        assert_eq!(poll.last_seen(), 600_000);

        // Tick N+1 succeeds and picks the item up normally.
        store.failing.store(false, Ordering::SeqCst);
        let outcome = poll.tick(NOW + 2_000).await.unwrap();
        assert_eq!(outcome.changed_count, 1);
        assert_eq!(poll.stats().polls, 1);
        assert_eq!(poll.stats().failures, 1);
    }

    #[tokio::test]
    async fn resume_point_reaches_back_past_current_window() {
        let cache = Arc::new(QueryCache::new(16));
        // One item two windows back, one current.
        let store = Arc::new(CountingStore::new(vec![item(10_000, 0.1), item(700_000, 0.6)]));

        let mut poll = cycle(sub("AAPL", Some(0)), cache, store, NOW);
        let outcome = poll.tick(NOW).await.unwrap();

        // Both items are newer than the resume point.
        assert_eq!(outcome.changed_count, 2);
        assert_eq!(poll.last_seen(), 700_000);
    }
}
