//! Short-lived in-memory cache of hydrated aggregates.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::aggregate::NetworkAggregate;

struct Entry {
    aggregate: NetworkAggregate,
    stored_at: Instant,
}

/// Read-through cache keyed by aggregate id.
///
/// Entries expire after `ttl`. Callers invalidate explicitly after any failed
/// command so the next load replays the durable log.
pub struct AggregateCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl AggregateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh copy of the cached aggregate, if present and not expired.
    pub fn get(&self, aggregate_id: &str) -> Option<NetworkAggregate> {
        let mut entries = self.entries();
        match entries.get(aggregate_id) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.aggregate.clone()),
            Some(_) => {
                entries.remove(aggregate_id);
                None
            }
            None => None,
        }
    }

    /// Store the post-command state.
    pub fn put(&self, aggregate: &NetworkAggregate) {
        self.entries().insert(
            aggregate.id().to_string(),
            Entry {
                aggregate: aggregate.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    /// Unconditional, even after a panic poisoned the lock.
    pub fn invalidate(&self, aggregate_id: &str) {
        self.entries().remove(aggregate_id);
    }

    // Entries are whole aggregates replaced in one insert, so a poisoned map
    // never holds a half-written value.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
