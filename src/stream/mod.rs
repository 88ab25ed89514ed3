pub mod bucket;
pub mod dispatch;
pub mod poll;

pub use bucket::{AggregatePolicy, Bucket, BucketAggregator, BucketEvent};
pub use dispatch::{EventDispatcher, EventType, StreamEvent};
pub use poll::{PollCycle, PollOutcome, PollStats};
