//! Chain source provider: read-only access to the authoritative chain.
//!
//! The network client itself lives outside this crate. The loader walks the
//! chain with `get_block_by_height` and reports replacements with
//! `get_block_stats_by_heights`; `get_blocks_by_hashes` is there for block
//! suppliers, which plan a batch from stats and then fetch its full blocks.
//! [`TimeoutProvider`] bounds every call so a hung provider fails the current
//! command closed instead of stalling it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LoaderError;
use crate::types::{Block, BlockStats};

/// Trait for querying the authoritative chain.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// The canonical block at `height`, or `None` if the source has none.
    async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, LoaderError>;

    /// Full blocks for the given hashes, in request order.
    ///
    /// Not called by the loader itself; suppliers use it to build the batches
    /// they hand back from `confirm_processed_batch`.
    async fn get_blocks_by_hashes(&self, hashes: &[String]) -> Result<Vec<Block>, LoaderError>;

    /// Hash and size summaries for the given heights, in request order.
    async fn get_block_stats_by_heights(
        &self,
        heights: &[u64],
    ) -> Result<Vec<BlockStats>, LoaderError>;
}

#[async_trait]
impl<P: ChainProvider + ?Sized> ChainProvider for Arc<P> {
    async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, LoaderError> {
        (**self).get_block_by_height(height).await
    }

    async fn get_blocks_by_hashes(&self, hashes: &[String]) -> Result<Vec<Block>, LoaderError> {
        (**self).get_blocks_by_hashes(hashes).await
    }

    async fn get_block_stats_by_heights(
        &self,
        heights: &[u64],
    ) -> Result<Vec<BlockStats>, LoaderError> {
        (**self).get_block_stats_by_heights(heights).await
    }
}

/// Wraps a provider and fails any call that outlives `timeout`.
pub struct TimeoutProvider<P> {
    inner: P,
    timeout: Duration,
}

impl<P: ChainProvider> TimeoutProvider<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T: Send>(
        &self,
        fut: impl std::future::Future<Output = Result<T, LoaderError>> + Send,
    ) -> Result<T, LoaderError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let ms = self.timeout.as_millis() as u64;
                tracing::warn!(timeout_ms = ms, "Provider call timed out");
                Err(LoaderError::Timeout { ms })
            }
        }
    }
}

#[async_trait]
impl<P: ChainProvider> ChainProvider for TimeoutProvider<P> {
    async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, LoaderError> {
        self.bounded(self.inner.get_block_by_height(height)).await
    }

    async fn get_blocks_by_hashes(&self, hashes: &[String]) -> Result<Vec<Block>, LoaderError> {
        self.bounded(self.inner.get_blocks_by_hashes(hashes)).await
    }

    async fn get_block_stats_by_heights(
        &self,
        heights: &[u64],
    ) -> Result<Vec<BlockStats>, LoaderError> {
        self.bounded(self.inner.get_block_stats_by_heights(heights))
            .await
    }
}
