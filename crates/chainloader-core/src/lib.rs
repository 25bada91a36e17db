//! chainloader-core: event-sourced chain tracking with reorg-safe projection.
//!
//! # Architecture
//!
//! ```text
//! BlockSupplier ──batch──► Loader (FIFO command queue)
//!                            ├── NetworkRepository ── AggregateCache
//!                            │        └── EventStore (append-only log + snapshots)
//!                            ├── NetworkAggregate   (ChainWindow, AWAITING / REORGANISATION)
//!                            │        └── ChainProvider (divergence walk, timeout-bounded)
//!                            └── NetworkReactor
//!                                     ├── MapperPool      (N worker threads, ProtocolMapper)
//!                                     └── ReadModelWriter (one transaction per batch → ReadStore)
//! ```
//!
//! The event log and the read store are committed separately. `Loader::init`
//! reconciles them by clamping the window to the read side's last height.

pub mod aggregate;
pub mod builder;
pub mod cache;
pub mod chain;
pub mod config;
pub mod error;
pub mod event;
pub mod loader;
pub mod mapper;
pub mod provider;
pub mod reactor;
pub mod read_model;
pub mod repository;
pub mod store;
pub mod supplier;
pub mod types;

pub use aggregate::{reduce, NetworkAggregate, NetworkState, NetworkStatus, Snapshot, NETWORK_AGGREGATE_ID};
pub use builder::LoaderBuilder;
pub use cache::AggregateCache;
pub use chain::ChainWindow;
pub use config::LoaderConfig;
pub use error::LoaderError;
pub use event::{EventRecord, NetworkEvent};
pub use loader::{Loader, NetworkCommand};
pub use mapper::{ChunkStrategy, MapperPool, ProtocolMapper};
pub use provider::{ChainProvider, TimeoutProvider};
pub use reactor::NetworkReactor;
pub use read_model::{Operation, OperationMethod, ReadModelWriter, ReadStore, SYSTEM_ENTITY};
pub use repository::NetworkRepository;
pub use store::{EventStore, MemoryEventStore};
pub use supplier::BlockSupplier;
pub use types::{Block, BlockStats, LightBlock, Transaction, TxInput, TxOutput};
