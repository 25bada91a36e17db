//! Network reactor: turns committed events into side effects.
//!
//! | Event                    | Reaction                                                      |
//! |--------------------------|---------------------------------------------------------------|
//! | `Initialized`            | `supplier.start(indexed_height)`                              |
//! | `BlocksAdded`            | confirm batch, map `on_load`, commit ops + height             |
//! | `ReorganisationStarted`  | log replacement stats, issue `ProcessReorganisation`          |
//! | `ReorganisationFinished` | map `on_reorganisation`, commit ops + height, redirect supply |
//!
//! Follow-up commands are returned to the caller rather than executed here, so
//! the driver runs them in order from its own queue.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LoaderError;
use crate::event::NetworkEvent;
use crate::loader::NetworkCommand;
use crate::mapper::MapperPool;
use crate::provider::ChainProvider;
use crate::read_model::ReadModelWriter;
use crate::supplier::BlockSupplier;
use crate::types::{Block, LightBlock};

pub struct NetworkReactor {
    provider: Arc<dyn ChainProvider>,
    supplier: Arc<dyn BlockSupplier>,
    mappers: MapperPool,
    writer: ReadModelWriter,
}

impl NetworkReactor {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        supplier: Arc<dyn BlockSupplier>,
        mappers: MapperPool,
        writer: ReadModelWriter,
    ) -> Self {
        Self {
            provider,
            supplier,
            mappers,
            writer,
        }
    }

    pub fn writer(&self) -> &ReadModelWriter {
        &self.writer
    }

    pub fn mappers(&self) -> &MapperPool {
        &self.mappers
    }

    /// React to one persisted event, returning any follow-up command.
    pub async fn handle(&self, event: &NetworkEvent) -> Result<Option<NetworkCommand>, LoaderError> {
        match event {
            NetworkEvent::Initialized { indexed_height, .. } => {
                self.supplier.start(*indexed_height).await?;
                Ok(None)
            }
            NetworkEvent::BlocksAdded { blocks, .. } => {
                self.project_blocks(blocks).await?;
                Ok(None)
            }
            NetworkEvent::ReorganisationStarted { height, blocks, .. } => {
                self.log_replacements(*height, blocks).await;
                Ok(Some(NetworkCommand::ProcessReorganisation {
                    request_id: Uuid::new_v4().to_string(),
                    height: *height,
                    blocks: blocks.clone(),
                }))
            }
            NetworkEvent::ReorganisationFinished { height, blocks, .. } => {
                self.project_rollback(*height, blocks).await?;
                self.supplier.reorganize(*height).await?;
                Ok(None)
            }
        }
    }

    /// Map `on_reorganisation` over the rolled-back blocks and commit the
    /// result with the read side's height set to the common ancestor.
    ///
    /// Suspensions are updates, so projecting the same rollback twice is safe.
    pub async fn project_rollback(&self, height: u64, blocks: &[LightBlock]) -> Result<(), LoaderError> {
        let started = Instant::now();
        let operations = self.mappers.map_on_reorganisation(blocks.to_vec()).await?;
        self.writer.commit(operations, height as i64).await?;
        info!(
            height,
            rolled_back = blocks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reorganisation projected"
        );
        Ok(())
    }

    async fn project_blocks(&self, blocks: &[LightBlock]) -> Result<(), LoaderError> {
        let Some(last) = blocks.last() else {
            return Ok(());
        };
        let hashes: Vec<String> = blocks.iter().map(|b| b.hash.clone()).collect();
        let full = self.supplier.confirm_processed_batch(&hashes).await?;
        check_confirmation(&hashes, &full)?;

        let size: u64 = full.iter().map(|b| b.size).sum();
        let txs: usize = full.iter().map(|b| b.tx.len()).sum();
        let count = full.len();

        let map_started = Instant::now();
        let operations = self.mappers.map_on_load(full).await?;
        let map_ms = map_started.elapsed().as_millis() as u64;

        let commit_started = Instant::now();
        let ops = operations.len();
        self.writer.commit(operations, last.height as i64).await?;

        info!(
            height = last.height,
            blocks = count,
            size,
            txs,
            ops,
            map_ms,
            commit_ms = commit_started.elapsed().as_millis() as u64,
            "Batch indexed"
        );
        Ok(())
    }

    // Operator-facing only: a failed lookup must not block the rollback.
    async fn log_replacements(&self, height: u64, blocks: &[LightBlock]) {
        if blocks.is_empty() {
            info!(height, "Reorganisation at tip, nothing to roll back");
            return;
        }
        let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
        let stats = match self.provider.get_block_stats_by_heights(&heights).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(height, depth = blocks.len(), error = %e, "Replacement stats unavailable");
                return;
            }
        };
        for (local, canonical) in blocks.iter().zip(&stats) {
            debug!(
                height = local.height,
                replaced = %local.hash,
                canonical = %canonical.blockhash,
                canonical_size = canonical.total_size,
                "Block replaced"
            );
        }
        info!(
            height,
            depth = blocks.len(),
            canonical_size = stats.iter().map(|s| s.total_size).sum::<u64>(),
            "Reorganisation started"
        );
    }
}

/// The supplier must hand back exactly the requested blocks, in order.
fn check_confirmation(requested: &[String], confirmed: &[Block]) -> Result<(), LoaderError> {
    if let Some(i) = requested
        .iter()
        .zip(confirmed)
        .position(|(hash, block)| *hash != block.hash)
    {
        return Err(LoaderError::InvalidBatch(format!(
            "supplier confirmed {} at position {i}, expected {}",
            confirmed[i].hash, requested[i]
        )));
    }
    if requested.len() != confirmed.len() {
        return Err(LoaderError::InvalidBatch(format!(
            "supplier confirmed {} of {} blocks",
            confirmed.len(),
            requested.len()
        )));
    }
    Ok(())
}
