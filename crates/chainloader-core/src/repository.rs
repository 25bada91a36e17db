//! Network repository: loads and saves the aggregate through the event store.
//!
//! `load` is read-through: a live cache entry wins, otherwise the aggregate is
//! rebuilt from the latest snapshot plus the events recorded after it.
//! `save` appends the pending events under optimistic concurrency, refreshes
//! the cache and takes a snapshot whenever the version crosses a multiple of
//! the snapshot interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::aggregate::NetworkAggregate;
use crate::cache::AggregateCache;
use crate::error::LoaderError;
use crate::event::{EventRecord, NetworkEvent};
use crate::store::EventStore;

pub struct NetworkRepository {
    store: Arc<dyn EventStore>,
    cache: AggregateCache,
    max_window_size: u64,
    /// Snapshot every N events; 0 disables snapshots.
    snapshot_interval: u64,
}

impl NetworkRepository {
    pub fn new(
        store: Arc<dyn EventStore>,
        cache_ttl: Duration,
        max_window_size: u64,
        snapshot_interval: u64,
    ) -> Self {
        Self {
            store,
            cache: AggregateCache::new(cache_ttl),
            max_window_size,
            snapshot_interval,
        }
    }

    /// Load the aggregate, from cache when possible.
    pub async fn load(&self, aggregate_id: &str) -> Result<NetworkAggregate, LoaderError> {
        if let Some(aggregate) = self.cache.get(aggregate_id) {
            return Ok(aggregate);
        }

        let started = Instant::now();
        let snapshot = self.store.load_snapshot(aggregate_id).await?;
        let after = snapshot.as_ref().map(|s| s.version).unwrap_or(0);
        let records = self.store.load_events(aggregate_id, after).await?;
        let aggregate =
            NetworkAggregate::hydrate(aggregate_id, self.max_window_size, snapshot, &records)?;

        debug!(
            aggregate_id,
            version = aggregate.version(),
            snapshot_version = after,
            replayed = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregate hydrated"
        );
        self.cache.put(&aggregate);
        Ok(aggregate)
    }

    /// Persist the aggregate's pending events and return them in order.
    pub async fn save(
        &self,
        aggregate: &mut NetworkAggregate,
    ) -> Result<Vec<NetworkEvent>, LoaderError> {
        if aggregate.uncommitted().is_empty() {
            return Ok(Vec::new());
        }

        let expected = aggregate.committed_version();
        let records = aggregate
            .uncommitted()
            .iter()
            .enumerate()
            .map(|(i, event)| EventRecord::new(aggregate.id(), expected + 1 + i as u64, event))
            .collect::<Result<Vec<_>, _>>()?;

        self.store.append(aggregate.id(), expected, &records).await?;
        let events = aggregate.uncommitted().to_vec();
        aggregate.mark_committed();

        debug!(
            aggregate_id = aggregate.id(),
            from = expected + 1,
            to = aggregate.version(),
            "Events appended"
        );

        if self.crosses_snapshot_boundary(expected, aggregate.version()) {
            self.store.save_snapshot(&aggregate.snapshot()).await?;
            info!(
                aggregate_id = aggregate.id(),
                version = aggregate.version(),
                "Snapshot saved"
            );
        }

        self.cache.put(aggregate);
        Ok(events)
    }

    /// Drop the cached copy so the next load replays the durable log.
    pub fn invalidate(&self, aggregate_id: &str) {
        self.cache.invalidate(aggregate_id);
    }

    /// The newest persisted event.
    pub async fn last_event(&self, aggregate_id: &str) -> Result<Option<EventRecord>, LoaderError> {
        self.store.last_event(aggregate_id).await
    }

    fn crosses_snapshot_boundary(&self, from: u64, to: u64) -> bool {
        self.snapshot_interval > 0 && from / self.snapshot_interval != to / self.snapshot_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use crate::types::LightBlock;

    fn light(height: u64) -> LightBlock {
        LightBlock {
            height,
            hash: format!("h{height}"),
            previousblockhash: if height == 0 { String::new() } else { format!("h{}", height - 1) },
            tx: vec![],
            size: 10,
        }
    }

    fn repo(store: Arc<MemoryEventStore>, interval: u64) -> NetworkRepository {
        NetworkRepository::new(store, Duration::from_secs(60), 1_000, interval)
    }

    #[tokio::test]
    async fn save_then_cold_load_matches() {
        let store = Arc::new(MemoryEventStore::new());
        let repository = repo(store.clone(), 0);

        let mut agg = repository.load("network").await.unwrap();
        agg.init("r0", -1);
        let events = repository.save(&mut agg).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(agg.committed_version(), 1);

        repository.invalidate("network");
        let cold = repository.load("network").await.unwrap();
        assert_eq!(cold.version(), 1);
        assert_eq!(cold.state(), agg.state());
        assert_eq!(
            repository.last_event("network").await.unwrap().unwrap().event_type,
            "Initialized"
        );
    }

    #[tokio::test]
    async fn concurrent_writer_gets_version_conflict() {
        let store = Arc::new(MemoryEventStore::new());
        let a = repo(store.clone(), 0);
        let b = repo(store.clone(), 0);

        let mut first = a.load("network").await.unwrap();
        let mut second = b.load("network").await.unwrap();
        first.init("r1", -1);
        second.init("r2", -1);

        a.save(&mut first).await.unwrap();
        let err = b.save(&mut second).await.unwrap_err();
        assert!(matches!(err, LoaderError::VersionConflict { expected: 0, actual: 1, .. }));
    }

    #[tokio::test]
    async fn snapshot_taken_on_interval_and_used_for_hydration() {
        let store = Arc::new(MemoryEventStore::new());
        let repository = repo(store.clone(), 2);

        let mut agg = repository.load("network").await.unwrap();
        agg.init("r0", -1);
        repository.save(&mut agg).await.unwrap();
        assert!(store.load_snapshot("network").await.unwrap().is_none());

        agg.init("r1", -1);
        repository.save(&mut agg).await.unwrap();
        let snapshot = store.load_snapshot("network").await.unwrap().unwrap();
        assert_eq!(snapshot.version, 2);

        // A later event written by another process.
        let added = NetworkEvent::BlocksAdded {
            request_id: "r2".into(),
            status: crate::aggregate::NetworkStatus::Awaiting,
            blocks: vec![light(0)],
        };
        store
            .append("network", 2, &[EventRecord::new("network", 3, &added).unwrap()])
            .await
            .unwrap();

        repository.invalidate("network");
        let cold = repository.load("network").await.unwrap();
        assert_eq!(cold.version(), 3);
        assert_eq!(cold.chain().last_block_height(), Some(0));

        let full = NetworkAggregate::hydrate(
            "network",
            1_000,
            None,
            &store.load_events("network", 0).await.unwrap(),
        )
        .unwrap();
        assert_eq!(full.state(), cold.state());
    }
}
