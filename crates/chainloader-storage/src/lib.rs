//! chainloader-storage: storage backends for ChainLoader.
//!
//! Backends:
//! - [`memory`]: in-memory read store (dev/testing, no persistence); the
//!   in-memory event store lives in `chainloader_core::store`
//! - [`sqlite`]: SQLite via `sqlx`: event store with snapshots, and a
//!   transactional read store

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryReadStore;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteEventStore, SqliteReadStore};
