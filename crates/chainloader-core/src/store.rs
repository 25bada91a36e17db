//! Event store: the append-only log behind the network aggregate.
//!
//! Events are appended with an expected version so two writers racing on the
//! same aggregate cannot interleave. Snapshots are an optimisation only: the
//! log alone is enough to rebuild any state.

use async_trait::async_trait;

use crate::aggregate::Snapshot;
use crate::error::LoaderError;
use crate::event::EventRecord;

/// Trait for persisting the aggregate's event log and snapshots.
///
/// Implementations include `MemoryEventStore` and `SqliteEventStore`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events with `version > after_version`, ascending.
    async fn load_events(
        &self,
        aggregate_id: &str,
        after_version: u64,
    ) -> Result<Vec<EventRecord>, LoaderError>;

    /// Append `records` if the stored head is still `expected_version`.
    ///
    /// Fails with [`LoaderError::VersionConflict`] otherwise; nothing is
    /// written in that case.
    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        records: &[EventRecord],
    ) -> Result<(), LoaderError>;

    /// The most recent snapshot, if any.
    async fn load_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, LoaderError>;

    /// Store (replace) the snapshot.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LoaderError>;

    /// The newest event in the log.
    async fn last_event(&self, aggregate_id: &str) -> Result<Option<EventRecord>, LoaderError>;
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryLog {
    events: HashMap<String, Vec<EventRecord>>,
    snapshots: HashMap<String, Snapshot>,
}

/// In-memory event store for tests and ephemeral loaders.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryLog>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryLog>, LoaderError> {
        self.inner
            .lock()
            .map_err(|_| LoaderError::Storage("event store lock poisoned".into()))
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn load_events(
        &self,
        aggregate_id: &str,
        after_version: u64,
    ) -> Result<Vec<EventRecord>, LoaderError> {
        let log = self.lock()?;
        Ok(log
            .events
            .get(aggregate_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|r| r.version > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        records: &[EventRecord],
    ) -> Result<(), LoaderError> {
        let mut log = self.lock()?;
        let events = log.events.entry(aggregate_id.to_string()).or_default();
        let actual = events.last().map(|r| r.version).unwrap_or(0);
        if actual != expected_version {
            return Err(LoaderError::VersionConflict {
                aggregate_id: aggregate_id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        events.extend_from_slice(records);
        Ok(())
    }

    async fn load_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, LoaderError> {
        Ok(self.lock()?.snapshots.get(aggregate_id).cloned())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LoaderError> {
        self.lock()?
            .snapshots
            .insert(snapshot.aggregate_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn last_event(&self, aggregate_id: &str) -> Result<Option<EventRecord>, LoaderError> {
        Ok(self
            .lock()?
            .events
            .get(aggregate_id)
            .and_then(|events| events.last().cloned()))
    }
}
