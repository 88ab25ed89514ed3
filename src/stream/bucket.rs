// =============================================================================
// Bucket Aggregator — folds raw items into fixed-width time buckets
// =============================================================================
//
// One aggregator per connection, at the connection's subscribed resolution.
// Buckets live in a BTreeMap keyed by window start, which gives the
// non-decreasing emission order for free. Completion is monotone: once a
// window's end time has elapsed the bucket is emitted as terminal, removed,
// and its window start raised into the completion watermark — it can never
// reopen. Items that would land at or below the watermark are late: they
// are attributed to the bucket owning the current poll time and flagged,
// never dropped and never folded into a closed aggregate.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{window_start, Resolution, SentimentItem};

/// How multiple item scores combine into one bucket's `aggregate_score`.
///
/// The combination rule is deliberately a policy, not a hard-coded formula;
/// the deployed default is a running mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatePolicy {
    Mean,
    LastValue,
}

impl Default for AggregatePolicy {
    fn default() -> Self {
        Self::Mean
    }
}

impl AggregatePolicy {
    /// Fold one more score into an aggregate that already combines
    /// `current_count` items.
    fn fold(&self, current: f64, current_count: u64, score: f64) -> f64 {
        match self {
            Self::Mean => {
                (current * current_count as f64 + score) / (current_count as f64 + 1.0)
            }
            Self::LastValue => score,
        }
    }
}

/// Sentiment aggregate for one fixed-width time window.
#[derive(Debug, Clone, Serialize)]
pub struct Bucket {
    pub window_start: i64,
    pub window_end: i64,
    pub item_count: u64,
    pub aggregate_score: f64,
    /// Monotone: set once the window end has elapsed, never cleared.
    pub is_complete: bool,
    /// True when at least one late item was attributed to this bucket.
    pub has_late_items: bool,
}

impl Bucket {
    fn new(start: i64, width: i64) -> Self {
        Self {
            window_start: start,
            window_end: start + width,
            item_count: 0,
            aggregate_score: 0.0,
            is_complete: false,
            has_late_items: false,
        }
    }

    fn apply(&mut self, item: &SentimentItem, policy: AggregatePolicy) {
        self.aggregate_score = policy.fold(self.aggregate_score, self.item_count, item.score);
        self.item_count += 1;
    }
}

/// One bucket update ready for the dispatcher. `origin_timestamp` is the
/// newest contributing item's upstream timestamp, which is what end-to-end
/// latency is measured against.
#[derive(Debug, Clone)]
pub struct BucketEvent {
    pub bucket: Bucket,
    pub origin_timestamp: i64,
}

/// Per-connection aggregation state.
pub struct BucketAggregator {
    resolution: Resolution,
    policy: AggregatePolicy,
    /// Open (not yet complete) buckets by window start.
    open: BTreeMap<i64, Bucket>,
    /// Newest upstream timestamp seen per open bucket.
    origin: BTreeMap<i64, i64>,
    /// Highest window start ever completed. Anything at or below is closed
    /// territory.
    completed_watermark: i64,
}

impl BucketAggregator {
    pub fn new(resolution: Resolution, policy: AggregatePolicy) -> Self {
        Self {
            resolution,
            policy,
            open: BTreeMap::new(),
            origin: BTreeMap::new(),
            completed_watermark: i64::MIN,
        }
    }

    /// Fold `items` into the open buckets and return the resulting events
    /// in non-decreasing `window_start` order.
    ///
    /// Call this every tick even when `items` is empty — completion is
    /// driven by `now_ms`, not by item arrival, and an elapsed bucket still
    /// owes its terminal event.
    pub fn fold(&mut self, items: &[SentimentItem], now_ms: i64) -> Vec<BucketEvent> {
        let width = self.resolution.as_millis();
        let mut touched: Vec<i64> = Vec::new();

        for item in items {
            let owning = window_start(item.timestamp, self.resolution);

            let late = owning <= self.completed_watermark;
            let target = if late {
                // Late arrival for a closed window: attribute to the bucket
                // owning the current poll time and flag it.
                let current = window_start(now_ms, self.resolution);
                warn!(
                    item_timestamp = item.timestamp,
                    closed_window = owning,
                    attributed_to = current,
                    "late item after bucket close — attributed to open bucket"
                );
                current
            } else {
                owning
            };

            let bucket = self
                .open
                .entry(target)
                .or_insert_with(|| Bucket::new(target, width));
            if late {
                bucket.has_late_items = true;
            }
            bucket.apply(item, self.policy);

            let origin = self.origin.entry(target).or_insert(item.timestamp);
            *origin = (*origin).max(item.timestamp);

            if !touched.contains(&target) {
                touched.push(target);
            }
        }

        // Close every open bucket whose window has fully elapsed.
        let mut completed: Vec<i64> = Vec::new();
        for (start, bucket) in self.open.iter_mut() {
            if bucket.window_end <= now_ms {
                bucket.is_complete = true;
                completed.push(*start);
            }
        }

        // Emit touched and newly completed buckets, ascending by window
        // start (BTreeMap iteration order).
        let mut events: Vec<BucketEvent> = Vec::new();
        for (start, bucket) in self.open.iter() {
            if touched.contains(start) || bucket.is_complete {
                let origin = self
                    .origin
                    .get(start)
                    .copied()
                    .unwrap_or(bucket.window_start);
                events.push(BucketEvent {
                    bucket: bucket.clone(),
                    origin_timestamp: origin,
                });
            }
        }

        // Completed buckets are now immutable and have had their terminal
        // event; drop them and raise the watermark.
        for start in completed {
            self.open.remove(&start);
            self.origin.remove(&start);
            self.completed_watermark = self.completed_watermark.max(start);
        }

        events
    }

    /// Number of buckets still accumulating.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn completed_watermark(&self) -> i64 {
        self.completed_watermark
    }
}
