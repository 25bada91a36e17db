//! Block supplier: the upstream queue that delivers ordered batches.
//!
//! Queueing and retry policy belong to the supplier. The loader only tells it
//! where to start, where to resume after a reorganisation, and which batch has
//! been fully committed.

use async_trait::async_trait;

use crate::error::LoaderError;
use crate::types::Block;

#[async_trait]
pub trait BlockSupplier: Send + Sync {
    /// Begin (or resume) delivery after `indexed_height`; `-1` starts at genesis.
    async fn start(&self, indexed_height: i64) -> Result<(), LoaderError>;

    /// Redirect delivery to continue after `height`, the last common ancestor.
    async fn reorganize(&self, height: u64) -> Result<(), LoaderError>;

    /// Acknowledge that the batch with these hashes was accepted by the
    /// aggregate and hand back the full blocks for projection.
    ///
    /// Must return exactly the requested blocks in request order; anything
    /// else fails the batch with [`LoaderError::InvalidBatch`].
    async fn confirm_processed_batch(&self, hashes: &[String]) -> Result<Vec<Block>, LoaderError>;
}
