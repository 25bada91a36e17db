//! Loader configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::NETWORK_AGGREGATE_ID;
use crate::error::LoaderError;
use crate::mapper::ChunkStrategy;

/// Prefix of every environment variable read by [`LoaderConfig::from_env`].
pub const ENV_PREFIX: &str = "CHAINLOADER_";

/// Configuration for a loader instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Identity of the network aggregate in the event store.
    pub aggregate_id: String,
    /// First block to index. The read side never reports less than this - 1.
    pub start_block_height: u64,
    /// Byte budget of the chain window. Must hold at least one supplier batch.
    pub max_window_size: u64,
    /// Mapper worker threads.
    pub workers_count: usize,
    /// How forward batches are chunked across workers.
    pub chunking: ChunkStrategy,
    /// Lifetime of a cached aggregate (milliseconds).
    pub cache_ttl_ms: u64,
    /// Per-call chain provider timeout (milliseconds).
    pub provider_timeout_ms: u64,
    /// Snapshot every N events; 0 disables snapshots.
    pub snapshot_interval: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            aggregate_id: NETWORK_AGGREGATE_ID.into(),
            start_block_height: 0,
            max_window_size: 100 * 1024 * 1024,
            workers_count: 4,
            chunking: ChunkStrategy::ByCount,
            cache_ttl_ms: 60_000,
            provider_timeout_ms: 10_000,
            snapshot_interval: 100,
        }
    }
}

impl LoaderConfig {
    /// Defaults overridden by `CHAINLOADER_*` environment variables.
    ///
    /// Setting `CHAINLOADER_MAX_CHUNK_BYTES` switches chunking to `BySize`.
    pub fn from_env() -> Result<Self, LoaderError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoaderError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(id) = var("AGGREGATE_ID") {
            config.aggregate_id = id;
        }
        if let Some(v) = var("START_BLOCK_HEIGHT") {
            config.start_block_height = parse("START_BLOCK_HEIGHT", &v)?;
        }
        if let Some(v) = var("MAX_WINDOW_SIZE") {
            config.max_window_size = parse("MAX_WINDOW_SIZE", &v)?;
        }
        if let Some(v) = var("WORKERS_COUNT") {
            config.workers_count = parse("WORKERS_COUNT", &v)?;
        }
        if let Some(v) = var("MAX_CHUNK_BYTES") {
            config.chunking = ChunkStrategy::BySize {
                max_chunk_bytes: parse("MAX_CHUNK_BYTES", &v)?,
            };
        }
        if let Some(v) = var("CACHE_TTL_MS") {
            config.cache_ttl_ms = parse("CACHE_TTL_MS", &v)?;
        }
        if let Some(v) = var("PROVIDER_TIMEOUT_MS") {
            config.provider_timeout_ms = parse("PROVIDER_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("SNAPSHOT_INTERVAL") {
            config.snapshot_interval = parse("SNAPSHOT_INTERVAL", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.aggregate_id.is_empty() {
            return Err(LoaderError::Config("aggregate_id must not be empty".into()));
        }
        if self.workers_count == 0 {
            return Err(LoaderError::Config("workers_count must be at least 1".into()));
        }
        if self.max_window_size == 0 {
            return Err(LoaderError::Config("max_window_size must be positive".into()));
        }
        if let ChunkStrategy::BySize { max_chunk_bytes: 0 } = self.chunking {
            return Err(LoaderError::Config("max_chunk_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    /// Lowest height `init` may report as indexed.
    pub fn min_indexed_height(&self) -> i64 {
        self.start_block_height as i64 - 1
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, LoaderError> {
    value
        .trim()
        .parse()
        .map_err(|_| LoaderError::Config(format!("{ENV_PREFIX}{name}: invalid value '{value}'")))
}
