//! Fluent builder API for loader configuration.
//!
//! # Example
//!
//! ```rust
//! use chainloader_core::builder::LoaderBuilder;
//! use chainloader_core::mapper::ChunkStrategy;
//!
//! let config = LoaderBuilder::new()
//!     .start_block_height(840_000)
//!     .max_window_size(256 * 1024 * 1024)
//!     .workers_count(8)
//!     .chunking(ChunkStrategy::BySize { max_chunk_bytes: 8 * 1024 * 1024 })
//!     .build_config()
//!     .unwrap();
//! assert_eq!(config.workers_count, 8);
//! ```

use crate::config::LoaderConfig;
use crate::error::LoaderError;
use crate::mapper::ChunkStrategy;

/// Fluent builder for `LoaderConfig`.
#[derive(Default)]
pub struct LoaderBuilder {
    config: LoaderConfig,
}

impl LoaderBuilder {
    pub fn new() -> Self {
        Self {
            config: LoaderConfig::default(),
        }
    }

    /// Set the aggregate identity (event store key).
    pub fn aggregate_id(mut self, id: impl Into<String>) -> Self {
        self.config.aggregate_id = id.into();
        self
    }

    /// Set the first height to index.
    pub fn start_block_height(mut self, height: u64) -> Self {
        self.config.start_block_height = height;
        self
    }

    /// Set the chain window byte budget.
    pub fn max_window_size(mut self, bytes: u64) -> Self {
        self.config.max_window_size = bytes;
        self
    }

    pub fn workers_count(mut self, workers: usize) -> Self {
        self.config.workers_count = workers;
        self
    }

    pub fn chunking(mut self, chunking: ChunkStrategy) -> Self {
        self.config.chunking = chunking;
        self
    }

    /// Set the aggregate cache TTL in milliseconds.
    pub fn cache_ttl_ms(mut self, ms: u64) -> Self {
        self.config.cache_ttl_ms = ms;
        self
    }

    /// Set the per-call provider timeout in milliseconds.
    pub fn provider_timeout_ms(mut self, ms: u64) -> Self {
        self.config.provider_timeout_ms = ms;
        self
    }

    /// Snapshot every N events (0 = never).
    pub fn snapshot_interval(mut self, n: u64) -> Self {
        self.config.snapshot_interval = n;
        self
    }

    /// Validate and build the `LoaderConfig`.
    pub fn build_config(self) -> Result<LoaderConfig, LoaderError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
