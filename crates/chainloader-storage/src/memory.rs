//! In-memory read-model backend.
//!
//! Entities are declared up front with their primary-key columns; rows are
//! keyed by their encoded primary key and keep insertion order. `apply`
//! records an undo entry per change and unwinds them if any operation fails,
//! so a failed batch leaves no trace.
//! Useful for testing and short-lived loaders that don't need persistence.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use chainloader_core::error::LoaderError;
use chainloader_core::read_model::{Operation, OperationMethod, ReadStore, SYSTEM_ENTITY, SYSTEM_ROW_ID};

type Row = Map<String, Value>;

#[derive(Debug, Default)]
struct Table {
    primary_key: Vec<String>,
    rows: HashMap<String, Row>,
    order: Vec<String>,
}

/// How to reverse one applied change.
enum Undo {
    Inserted { entity: String },
    Updated { entity: String, key: String, previous: Row },
}

impl Table {
    fn new(primary_key: &[&str]) -> Self {
        Self {
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Encoded primary key of `row`, or `None` if a key column is missing.
    fn key_of(&self, row: &Row) -> Result<Option<String>, LoaderError> {
        let Some(values) = self
            .primary_key
            .iter()
            .map(|column| row.get(column))
            .collect::<Option<Vec<_>>>()
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::to_string(&values)?))
    }

    fn insert(&mut self, entity: &str, row: Row) -> Result<(), LoaderError> {
        let key = self.key_of(&row)?.ok_or_else(|| {
            LoaderError::Storage(format!(
                "{entity}: row is missing a key column of {:?}",
                self.primary_key
            ))
        })?;
        if self.rows.contains_key(&key) {
            return Err(LoaderError::Integrity {
                entity: entity.to_string(),
                reason: format!("duplicate primary key {key}"),
            });
        }
        self.order.push(key.clone());
        self.rows.insert(key, row);
        Ok(())
    }

    /// Apply `values` to every row matching `conditions`; returns the
    /// previous contents of the rows it changed.
    fn update(
        &mut self,
        entity: &str,
        conditions: &Row,
        values: &Row,
    ) -> Result<Vec<(String, Row)>, LoaderError> {
        if let Some(column) = self.primary_key.iter().find(|c| values.contains_key(*c)) {
            return Err(LoaderError::Storage(format!(
                "{entity}: key column '{column}' cannot be updated"
            )));
        }
        // Conditions that pin the whole key hit at most one row.
        let candidates = match self.key_of(conditions)? {
            Some(key) => vec![key],
            None => self.order.clone(),
        };

        let mut changed = Vec::new();
        for key in candidates {
            let Some(row) = self.rows.get_mut(&key) else {
                continue;
            };
            if conditions.iter().all(|(k, v)| row.get(k) == Some(v)) {
                changed.push((key, row.clone()));
                for (k, v) in values {
                    row.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(changed)
    }

    fn get(&self, key: &Row) -> Option<&Row> {
        let key = self.key_of(key).ok()??;
        self.rows.get(&key)
    }
}

/// In-memory read store.
///
/// All data is lost when the process exits.
pub struct InMemoryReadStore {
    tables: Mutex<HashMap<String, Table>>,
}

impl Default for InMemoryReadStore {
    fn default() -> Self {
        let mut system = Table::new(&["id"]);
        let mut row = Row::new();
        row.insert("id".into(), Value::from(SYSTEM_ROW_ID));
        row.insert("last_block_height".into(), Value::from(-1));
        // the system row always carries its key
        let _ = system.insert(SYSTEM_ENTITY, row);

        let mut tables = HashMap::new();
        tables.insert(SYSTEM_ENTITY.to_string(), system);
        Self {
            tables: Mutex::new(tables),
        }
    }
}

impl InMemoryReadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an entity and its primary-key columns.
    pub fn define_entity(&self, entity: &str, primary_key: &[&str]) -> Result<(), LoaderError> {
        self.lock()?
            .entry(entity.to_string())
            .or_insert_with(|| Table::new(primary_key));
        Ok(())
    }

    /// All rows of `entity`, in insertion order.
    pub fn rows(&self, entity: &str) -> Result<Vec<Value>, LoaderError> {
        Ok(self
            .lock()?
            .get(entity)
            .map(|t| {
                t.order
                    .iter()
                    .filter_map(|key| t.rows.get(key))
                    .cloned()
                    .map(Value::Object)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Table>>, LoaderError> {
        self.tables
            .lock()
            .map_err(|_| LoaderError::Storage("read store lock poisoned".into()))
    }
}

fn apply_one(
    tables: &mut HashMap<String, Table>,
    op: &Operation,
    undo: &mut Vec<Undo>,
) -> Result<(), LoaderError> {
    let entity = op.entity_name.as_str();
    let table = tables
        .get_mut(entity)
        .ok_or_else(|| LoaderError::Storage(format!("unknown entity '{entity}'")))?;

    match op.method {
        OperationMethod::Insert => {
            let row = op.params.as_object().cloned().ok_or_else(|| {
                LoaderError::Storage(format!("{entity}: insert params must be an object"))
            })?;
            table.insert(entity, row)?;
            undo.push(Undo::Inserted {
                entity: entity.to_string(),
            });
        }
        OperationMethod::Update => {
            let (conditions, values) = op.update_parts().ok_or_else(|| {
                LoaderError::Storage(format!("{entity}: update needs conditions and values"))
            })?;
            for (key, previous) in table.update(entity, conditions, values)? {
                undo.push(Undo::Updated {
                    entity: entity.to_string(),
                    key,
                    previous,
                });
            }
        }
    }
    Ok(())
}

/// Reverse `undo` newest first. Each insert undone is the newest row of its
/// table at that point.
fn roll_back(tables: &mut HashMap<String, Table>, undo: Vec<Undo>) {
    for step in undo.into_iter().rev() {
        match step {
            Undo::Inserted { entity } => {
                if let Some(table) = tables.get_mut(&entity) {
                    if let Some(key) = table.order.pop() {
                        table.rows.remove(&key);
                    }
                }
            }
            Undo::Updated {
                entity,
                key,
                previous,
            } => {
                if let Some(table) = tables.get_mut(&entity) {
                    table.rows.insert(key, previous);
                }
            }
        }
    }
}

#[async_trait]
impl ReadStore for InMemoryReadStore {
    async fn last_block_height(&self) -> Result<i64, LoaderError> {
        let tables = self.lock()?;
        let mut id = Row::new();
        id.insert("id".into(), Value::from(SYSTEM_ROW_ID));
        Ok(tables
            .get(SYSTEM_ENTITY)
            .and_then(|t| t.get(&id))
            .and_then(|r| r.get("last_block_height"))
            .and_then(Value::as_i64)
            .unwrap_or(-1))
    }

    async fn apply(&self, operations: &[Operation]) -> Result<(), LoaderError> {
        let mut tables = self.lock()?;
        let mut undo = Vec::new();
        for op in operations {
            if let Err(e) = apply_one(&mut tables, op, &mut undo) {
                roll_back(&mut tables, undo);
                return Err(e);
            }
        }
        debug!(operations = operations.len(), "read model applied");
        Ok(())
    }
}
