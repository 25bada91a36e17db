//! The network aggregate: event-sourced authority over the tracked chain.
//!
//! # States
//!
//! ```text
//!             add_blocks (valid)            process_reorganisation
//!           ┌──────────────┐             ┌───────────────────────┐
//!           ▼              │             │                       ▼
//!       AWAITING ──────────┴── add_blocks (invalid) ──► REORGANISATION
//!           ▲        walk back to common ancestor              │
//!           └──────────────────────────────────────────────────┘
//! ```
//!
//! Commands validate against the current state and emit events; events are
//! folded into state by [`NetworkState::apply`], the only code path that
//! mutates the chain window. Replay on hydration goes through the same path.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chain::ChainWindow;
use crate::error::LoaderError;
use crate::event::{EventRecord, NetworkEvent};
use crate::provider::ChainProvider;
use crate::types::{Block, LightBlock};

/// Identity of the single network aggregate.
pub const NETWORK_AGGREGATE_ID: &str = "network";

/// Aggregate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    /// Forward ingestion allowed.
    Awaiting,
    /// Recovery in progress; forward ingestion blocked.
    Reorganisation,
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Awaiting => write!(f, "awaiting"),
            Self::Reorganisation => write!(f, "reorganisation"),
        }
    }
}

// ─── State + reducer ──────────────────────────────────────────────────────────

/// The folded state of the aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkState {
    pub status: NetworkStatus,
    pub chain: ChainWindow,
}

impl NetworkState {
    pub fn new(max_window_size: u64) -> Self {
        Self {
            status: NetworkStatus::Awaiting,
            chain: ChainWindow::new(max_window_size),
        }
    }

    /// Fold one event into the state. Total: never fails.
    pub fn apply(&mut self, event: &NetworkEvent) {
        self.status = event.status();
        match event {
            NetworkEvent::Initialized { indexed_height, .. } => {
                // Clamp the write side to what the read side has committed.
                match self.chain.floor_height() {
                    None => {}
                    Some(floor) if *indexed_height < floor as i64 => self.chain.clear(),
                    Some(_) => self.chain.truncate_to_block(*indexed_height as u64),
                }
            }
            NetworkEvent::BlocksAdded { blocks, .. } => {
                self.chain.add_blocks(blocks.iter().cloned());
            }
            NetworkEvent::ReorganisationStarted { .. } => {}
            NetworkEvent::ReorganisationFinished { height, .. } => {
                self.chain.truncate_to_block(*height);
            }
        }
    }
}

/// Pure reducer: `(state, event) -> state`.
pub fn reduce(mut state: NetworkState, event: &NetworkEvent) -> NetworkState {
    state.apply(event);
    state
}

// ─── Snapshot ─────────────────────────────────────────────────────────────────

/// Persisted aggregate state at a given version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub version: u64,
    pub status: NetworkStatus,
    pub chain: Vec<LightBlock>,
}

// ─── Aggregate ────────────────────────────────────────────────────────────────

/// The network aggregate: folded state, version and not-yet-persisted events.
#[derive(Debug, Clone)]
pub struct NetworkAggregate {
    id: String,
    /// Count of applied events, committed or not.
    version: u64,
    state: NetworkState,
    uncommitted: Vec<NetworkEvent>,
}

impl NetworkAggregate {
    /// A brand-new aggregate with no history.
    pub fn new(id: impl Into<String>, max_window_size: u64) -> Self {
        Self {
            id: id.into(),
            version: 0,
            state: NetworkState::new(max_window_size),
            uncommitted: Vec::new(),
        }
    }

    /// Rebuild from an optional snapshot plus the events recorded after it.
    ///
    /// Records must continue the snapshot's version without gaps.
    pub fn hydrate(
        id: impl Into<String>,
        max_window_size: u64,
        snapshot: Option<Snapshot>,
        records: &[EventRecord],
    ) -> Result<Self, LoaderError> {
        let mut aggregate = Self::new(id, max_window_size);
        if let Some(snapshot) = snapshot {
            aggregate.version = snapshot.version;
            aggregate.state = NetworkState {
                status: snapshot.status,
                chain: ChainWindow::from_blocks(max_window_size, snapshot.chain)?,
            };
        }
        for record in records {
            if record.version != aggregate.version + 1 {
                return Err(LoaderError::Storage(format!(
                    "event log for '{}' jumps from version {} to {}",
                    aggregate.id, aggregate.version, record.version
                )));
            }
            aggregate.state.apply(&record.decode()?);
            aggregate.version = record.version;
        }
        Ok(aggregate)
    }

    /// Capture the current state for the snapshot store.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            aggregate_id: self.id.clone(),
            version: self.version,
            status: self.state.status,
            chain: self.state.chain.to_vec(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version of the last persisted event.
    pub fn committed_version(&self) -> u64 {
        self.version - self.uncommitted.len() as u64
    }

    pub fn status(&self) -> NetworkStatus {
        self.state.status
    }

    pub fn chain(&self) -> &ChainWindow {
        &self.state.chain
    }

    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    pub fn uncommitted(&self) -> &[NetworkEvent] {
        &self.uncommitted
    }

    /// Drop the pending events once the store has accepted them.
    pub fn mark_committed(&mut self) {
        self.uncommitted.clear();
    }

    // ─── Commands ─────────────────────────────────────────────────────────────

    /// Reconcile the window with the read side's last committed height.
    ///
    /// Always lands in `Awaiting`; an interrupted reorganisation is re-detected
    /// by the next `add_blocks`.
    pub fn init(&mut self, request_id: &str, indexed_height: i64) {
        let height = match self.state.chain.last_block_height() {
            Some(tip) => indexed_height.min(tip as i64),
            None => indexed_height,
        };
        info!(
            write_height = height,
            read_height = indexed_height,
            "Init network aggregate"
        );
        self.apply(NetworkEvent::Initialized {
            request_id: request_id.to_string(),
            status: NetworkStatus::Awaiting,
            indexed_height: height,
        });
    }

    /// Append a batch, or walk back to a common ancestor if it does not link.
    pub async fn add_blocks(
        &mut self,
        request_id: &str,
        blocks: &[Block],
        provider: &dyn ChainProvider,
    ) -> Result<(), LoaderError> {
        self.ensure_status("add_blocks", NetworkStatus::Awaiting)?;
        if blocks.is_empty() {
            return Ok(());
        }

        let light: Vec<LightBlock> = blocks.iter().map(Block::to_light).collect();
        if !self.state.chain.validate_next_blocks(&light) {
            let Some(tip) = self.state.chain.last_block_height() else {
                // Nothing to walk back through: the batch itself is broken.
                return Err(LoaderError::InvalidBatch(format!(
                    "{} blocks from height {} are not a linked run",
                    light.len(),
                    light[0].height
                )));
            };
            warn!(
                tip,
                first = light[0].height,
                "Batch does not extend the tracked chain, searching for common ancestor"
            );
            return self.start_reorganisation(request_id, tip, provider).await;
        }

        info!(blocks = light.len(), "Add blocks");
        self.apply(NetworkEvent::BlocksAdded {
            request_id: request_id.to_string(),
            status: NetworkStatus::Awaiting,
            blocks: light,
        });
        Ok(())
    }

    /// Walk back from `height` until the local block matches the source's.
    ///
    /// One provider lookup per step, strictly sequential. Running off the
    /// bottom of the window is fatal: either the window is too small for the
    /// reorg depth or the source is inconsistent.
    pub async fn start_reorganisation(
        &mut self,
        request_id: &str,
        height: u64,
        provider: &dyn ChainProvider,
    ) -> Result<(), LoaderError> {
        self.ensure_status("start_reorganisation", NetworkStatus::Awaiting)?;
        let Some(floor) = self.state.chain.floor_height() else {
            return Err(LoaderError::DivergenceUnresolvable { height, floor: height });
        };

        let mut diverged: Vec<LightBlock> = Vec::new();
        let mut current = height;
        loop {
            let local = self
                .state
                .chain
                .find_block_by_height(current)
                .cloned()
                .ok_or(LoaderError::DivergenceUnresolvable { height, floor })?;
            let source = provider.get_block_by_height(current).await?.ok_or_else(|| {
                LoaderError::Provider(format!("source has no block at height {current}"))
            })?;

            if source.hash == local.hash && source.previousblockhash == local.previousblockhash {
                diverged.reverse();
                info!(height = current, blocks = diverged.len(), "Start reorganisation");
                self.apply(NetworkEvent::ReorganisationStarted {
                    request_id: request_id.to_string(),
                    status: NetworkStatus::Reorganisation,
                    height: current,
                    blocks: diverged,
                });
                return Ok(());
            }

            debug!(
                height = current,
                local = %local.hash,
                source = %source.hash,
                "Block diverged from source"
            );
            diverged.push(local);
            if current <= floor {
                tracing::error!(height, floor, "No common ancestor inside the chain window");
                return Err(LoaderError::DivergenceUnresolvable { height, floor });
            }
            current -= 1;
        }
    }

    /// Finish a reorganisation by truncating to the common ancestor.
    ///
    /// A `height` above the current tip is a stale or duplicate signal and is
    /// ignored.
    pub fn process_reorganisation(
        &mut self,
        request_id: &str,
        height: u64,
        blocks: Vec<LightBlock>,
    ) -> Result<(), LoaderError> {
        self.ensure_status("process_reorganisation", NetworkStatus::Reorganisation)?;
        match self.state.chain.last_block_height() {
            Some(tip) if height <= tip => {}
            tip => {
                warn!(
                    reorganisation_height = height,
                    last_height = ?tip,
                    "Reorganisation height is above the tracked tip, ignoring"
                );
                return Ok(());
            }
        }

        info!(height, blocks = blocks.len(), "Finish reorganisation");
        self.apply(NetworkEvent::ReorganisationFinished {
            request_id: request_id.to_string(),
            status: NetworkStatus::Awaiting,
            height,
            blocks,
        });
        Ok(())
    }

    fn ensure_status(
        &self,
        command: &'static str,
        expected: NetworkStatus,
    ) -> Result<(), LoaderError> {
        if self.state.status != expected {
            return Err(LoaderError::StateConflict {
                command,
                expected,
                actual: self.state.status,
            });
        }
        Ok(())
    }

    fn apply(&mut self, event: NetworkEvent) {
        self.state.apply(&event);
        self.version += 1;
        self.uncommitted.push(event);
    }
}
