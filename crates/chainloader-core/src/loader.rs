//! The loader: command driver for the network aggregate.
//!
//! Every command runs the same cycle:
//!
//! 1. load the aggregate (cache or event store)
//! 2. execute the command, producing events
//! 3. append the events under optimistic concurrency
//! 4. hand each event to the reactor, queueing any follow-up command
//!
//! Commands run strictly one after another from a FIFO queue. Any failure
//! invalidates the cached aggregate and aborts the remaining queue, so the next
//! call starts again from durable state.
//!
//! Failures after an event is persisted are picked up again later:
//!
//! - a `ReorganisationStarted` that never finished is resumed by the next
//!   batch, which is dropped since the supplier gets redirected anyway
//! - a `ReorganisationFinished` whose rollback never reached the read side is
//!   projected again by `init`
//! - a `BlocksAdded` that was never projected is truncated away by `init`

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::{NetworkAggregate, NetworkStatus};
use crate::config::LoaderConfig;
use crate::error::LoaderError;
use crate::event::NetworkEvent;
use crate::mapper::{MapperPool, ProtocolMapper};
use crate::provider::{ChainProvider, TimeoutProvider};
use crate::reactor::NetworkReactor;
use crate::read_model::{ReadModelWriter, ReadStore};
use crate::repository::NetworkRepository;
use crate::store::EventStore;
use crate::supplier::BlockSupplier;
use crate::types::{Block, LightBlock};

/// Commands accepted by the network aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkCommand {
    /// Reconcile with the read side and (re)start the supplier.
    Init { request_id: String },
    /// Ingest a supplier batch.
    AddBlocks { request_id: String, blocks: Vec<Block> },
    /// Truncate to the common ancestor found by the divergence walk.
    ProcessReorganisation {
        request_id: String,
        height: u64,
        blocks: Vec<LightBlock>,
    },
}

impl NetworkCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::AddBlocks { .. } => "add_blocks",
            Self::ProcessReorganisation { .. } => "process_reorganisation",
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Init { request_id }
            | Self::AddBlocks { request_id, .. }
            | Self::ProcessReorganisation { request_id, .. } => request_id,
        }
    }
}

pub struct Loader {
    config: LoaderConfig,
    repository: NetworkRepository,
    provider: Arc<dyn ChainProvider>,
    reactor: NetworkReactor,
}

impl Loader {
    /// Wire a loader.
    ///
    /// The provider is wrapped with the configured timeout and the mapper pool
    /// is sized and chunked from `config`, one `mapper_factory(index)` per
    /// worker.
    pub fn new<M, F>(
        config: LoaderConfig,
        events: Arc<dyn EventStore>,
        views: Arc<dyn ReadStore>,
        provider: Arc<dyn ChainProvider>,
        supplier: Arc<dyn BlockSupplier>,
        mapper_factory: F,
    ) -> Result<Self, LoaderError>
    where
        M: ProtocolMapper,
        F: Fn(usize) -> M,
    {
        config.validate()?;
        let mappers = MapperPool::new(config.workers_count, config.chunking, mapper_factory)?;
        let provider: Arc<dyn ChainProvider> =
            Arc::new(TimeoutProvider::new(provider, config.provider_timeout()));
        let repository = NetworkRepository::new(
            events,
            config.cache_ttl(),
            config.max_window_size,
            config.snapshot_interval,
        );
        let reactor = NetworkReactor::new(
            provider.clone(),
            supplier,
            mappers,
            ReadModelWriter::new(views),
        );
        Ok(Self {
            config,
            repository,
            provider,
            reactor,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn mappers(&self) -> &MapperPool {
        self.reactor.mappers()
    }

    /// Reconcile write and read sides, then start the supplier.
    pub async fn init(&self) -> Result<(), LoaderError> {
        self.execute(NetworkCommand::Init {
            request_id: Uuid::new_v4().to_string(),
        })
        .await
    }

    /// Ingest one batch delivered by the supplier.
    pub async fn handle_batch(&self, blocks: Vec<Block>) -> Result<(), LoaderError> {
        self.execute(NetworkCommand::AddBlocks {
            request_id: Uuid::new_v4().to_string(),
            blocks,
        })
        .await
    }

    /// The current aggregate, hydrated if not cached.
    pub async fn aggregate(&self) -> Result<NetworkAggregate, LoaderError> {
        self.repository.load(&self.config.aggregate_id).await
    }

    /// Run `command` and every follow-up it triggers.
    pub async fn execute(&self, command: NetworkCommand) -> Result<(), LoaderError> {
        let mut queue = VecDeque::from([command]);
        while let Some(command) = queue.pop_front() {
            let name = command.name();
            let request_id = command.request_id().to_string();
            if let Err(e) = self.run(command, &mut queue).await {
                self.repository.invalidate(&self.config.aggregate_id);
                error!(command = name, %request_id, error = %e, "Command failed");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        command: NetworkCommand,
        queue: &mut VecDeque<NetworkCommand>,
    ) -> Result<(), LoaderError> {
        let mut aggregate = self.repository.load(&self.config.aggregate_id).await?;

        match command {
            NetworkCommand::Init { request_id } => {
                let read_height = self.reconciled_read_height().await?;
                let indexed = read_height.max(self.config.min_indexed_height());
                if indexed != read_height {
                    info!(read_height, indexed, "Read side below start height, clamping");
                }
                aggregate.init(&request_id, indexed);
            }
            NetworkCommand::AddBlocks { request_id, blocks } => {
                if aggregate.status() == NetworkStatus::Reorganisation {
                    if let Some(resume) = self.pending_reorganisation().await? {
                        warn!(
                            %request_id,
                            dropped = blocks.len(),
                            "Resuming interrupted reorganisation, batch dropped"
                        );
                        queue.push_front(resume);
                        return Ok(());
                    }
                }
                aggregate
                    .add_blocks(&request_id, &blocks, self.provider.as_ref())
                    .await?;
            }
            NetworkCommand::ProcessReorganisation {
                request_id,
                height,
                blocks,
            } => {
                aggregate.process_reorganisation(&request_id, height, blocks)?;
            }
        }

        let events = self.repository.save(&mut aggregate).await?;
        for event in &events {
            if let Some(next) = self.reactor.handle(event).await? {
                queue.push_back(next);
            }
        }
        Ok(())
    }

    /// The read side's height, after re-projecting a rollback that was
    /// persisted on the write side but never committed on the read side.
    async fn reconciled_read_height(&self) -> Result<i64, LoaderError> {
        let read_height = self.reactor.writer().last_block_height().await?;
        match self.last_event().await? {
            Some(NetworkEvent::ReorganisationFinished { height, blocks, .. })
                if read_height > height as i64 =>
            {
                warn!(height, read_height, "Rollback missing on the read side, projecting again");
                self.reactor.project_rollback(height, &blocks).await?;
                Ok(height as i64)
            }
            _ => Ok(read_height),
        }
    }

    /// The `ProcessReorganisation` a persisted `ReorganisationStarted` is
    /// still waiting for.
    async fn pending_reorganisation(&self) -> Result<Option<NetworkCommand>, LoaderError> {
        Ok(match self.last_event().await? {
            Some(NetworkEvent::ReorganisationStarted { height, blocks, .. }) => {
                Some(NetworkCommand::ProcessReorganisation {
                    request_id: Uuid::new_v4().to_string(),
                    height,
                    blocks,
                })
            }
            _ => None,
        })
    }

    async fn last_event(&self) -> Result<Option<NetworkEvent>, LoaderError> {
        self.repository
            .last_event(&self.config.aggregate_id)
            .await?
            .map(|record| record.decode())
            .transpose()
    }
}
