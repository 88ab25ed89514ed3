// =============================================================================
// Backing store seam
// =============================================================================
//
// The streaming service only needs one question answered: "what changed for
// this ticker since T?". Everything behind that — schema, durability,
// retention — belongs to the persistence layer, so the seam is a small dyn
// trait and each poll cycle receives an `Arc<dyn SentimentStore>` rather
// than reaching for a global.
// =============================================================================

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Resolution, SentimentItem};

/// Read interface onto the persistence layer holding raw sentiment results.
#[async_trait]
pub trait SentimentStore: Send + Sync {
    /// Return every item for `ticker` with `timestamp > since`, oldest-first.
    ///
    /// `resolution` is a hint the store may use for server-side
    /// downsampling; implementations are free to ignore it.
    async fn query(
        &self,
        ticker: &str,
        resolution: Resolution,
        since: i64,
    ) -> Result<Vec<SentimentItem>, StoreError>;
}
