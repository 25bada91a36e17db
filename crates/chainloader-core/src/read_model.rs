//! Read-model operations and the writer that commits them.
//!
//! Mappers turn blocks into [`Operation`]s; the [`ReadModelWriter`] appends the
//! `SystemView` height update and applies the whole list to a [`ReadStore`] in
//! one transaction.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::LoaderError;

/// Entity holding the single `SystemView` row.
pub const SYSTEM_ENTITY: &str = "system";

/// Primary key of the `SystemView` row.
pub const SYSTEM_ROW_ID: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMethod {
    /// Insert a row keyed by its natural primary key. At most once.
    Insert,
    /// Set `values` on every row matching `conditions`. Idempotent.
    Update,
}

/// One write against the read model.
///
/// `params` is the row for inserts and `{ "conditions": {..}, "values": {..} }`
/// for updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub entity_name: String,
    pub method: OperationMethod,
    pub params: Value,
}

impl Operation {
    pub fn insert(entity: impl Into<String>, row: Value) -> Self {
        Self {
            entity_name: entity.into(),
            method: OperationMethod::Insert,
            params: row,
        }
    }

    pub fn update(entity: impl Into<String>, conditions: Value, values: Value) -> Self {
        Self {
            entity_name: entity.into(),
            method: OperationMethod::Update,
            params: json!({ "conditions": conditions, "values": values }),
        }
    }

    /// Mark matching rows as rolled back.
    pub fn suspend(entity: impl Into<String>, conditions: Value) -> Self {
        Self::update(entity, conditions, json!({ "is_suspended": true }))
    }

    /// `(conditions, values)` of an update; `None` for inserts or malformed params.
    pub fn update_parts(&self) -> Option<(&serde_json::Map<String, Value>, &serde_json::Map<String, Value>)> {
        if self.method != OperationMethod::Update {
            return None;
        }
        Some((
            self.params.get("conditions")?.as_object()?,
            self.params.get("values")?.as_object()?,
        ))
    }
}

/// The `SystemView.last_block_height` update closing every commit.
pub fn system_height_update(height: i64) -> Operation {
    Operation::update(
        SYSTEM_ENTITY,
        json!({ "id": SYSTEM_ROW_ID }),
        json!({ "last_block_height": height }),
    )
}

/// A transactional read-side store.
///
/// Implementations live in `chainloader-storage`.
#[async_trait]
pub trait ReadStore: Send + Sync {
    /// `SystemView.last_block_height`; `-1` when nothing is indexed.
    async fn last_block_height(&self) -> Result<i64, LoaderError>;

    /// Apply all operations atomically, or none of them.
    ///
    /// A duplicate-key insert fails with [`LoaderError::Integrity`].
    async fn apply(&self, operations: &[Operation]) -> Result<(), LoaderError>;
}

/// Commits mapped operations plus the height update as one unit.
pub struct ReadModelWriter {
    store: Arc<dyn ReadStore>,
}

impl ReadModelWriter {
    pub fn new(store: Arc<dyn ReadStore>) -> Self {
        Self { store }
    }

    pub async fn last_block_height(&self) -> Result<i64, LoaderError> {
        self.store.last_block_height().await
    }

    pub async fn commit(
        &self,
        mut operations: Vec<Operation>,
        last_block_height: i64,
    ) -> Result<(), LoaderError> {
        let started = Instant::now();
        operations.push(system_height_update(last_block_height));
        self.store.apply(&operations).await?;
        debug!(
            operations = operations.len(),
            last_block_height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Read model committed"
        );
        Ok(())
    }
}
