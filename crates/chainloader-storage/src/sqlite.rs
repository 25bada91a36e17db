//! SQLite storage backends for ChainLoader.
//!
//! [`SqliteEventStore`] persists the aggregate's event log and snapshots;
//! [`SqliteReadStore`] holds the read model, with the `system` table seeded on
//! open and every batch applied inside one transaction.
//! Both use `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use chainloader_storage::sqlite::{SqliteEventStore, SqliteReadStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let events = SqliteEventStore::open("./events.db").await?;
//! let views = SqliteReadStore::open("./views.db").await?;
//! views
//!     .migrate(&["CREATE TABLE IF NOT EXISTS utxo (txid TEXT, n INTEGER, PRIMARY KEY (txid, n))"])
//!     .await?;
//!
//! // In-memory (tests / ephemeral)
//! let events = SqliteEventStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainloader_core::aggregate::{NetworkStatus, Snapshot};
use chainloader_core::error::LoaderError;
use chainloader_core::event::EventRecord;
use chainloader_core::read_model::{Operation, OperationMethod, ReadStore, SYSTEM_ROW_ID};
use chainloader_core::store::EventStore;

fn storage(e: sqlx::Error) -> LoaderError {
    LoaderError::Storage(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

/// Open (or create) a database. Accepts a plain path or a `sqlite:` URL.
async fn connect(path: &str) -> Result<SqlitePool, LoaderError> {
    let url = if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite:{path}?mode=rwc")
    };
    let pool = SqlitePool::connect(&url).await.map_err(storage)?;
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await
        .map_err(storage)?;
    Ok(pool)
}

/// A single-connection in-memory database; every connection would otherwise
/// see its own empty database.
async fn connect_in_memory() -> Result<SqlitePool, LoaderError> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(storage)
}

// ─── Event store ─────────────────────────────────────────────────────────────

/// SQLite-backed event log and snapshot store.
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub async fn open(path: &str) -> Result<Self, LoaderError> {
        let store = Self {
            pool: connect(path).await?,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, LoaderError> {
        let store = Self {
            pool: connect_in_memory().await?,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), LoaderError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                aggregate_id TEXT    NOT NULL,
                version      INTEGER NOT NULL,
                event_type   TEXT    NOT NULL,
                payload      TEXT    NOT NULL,
                timestamp    TEXT    NOT NULL,
                PRIMARY KEY (aggregate_id, version)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS snapshots (
                aggregate_id TEXT    PRIMARY KEY,
                version      INTEGER NOT NULL,
                status       TEXT    NOT NULL,
                chain        TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    /// The newest `limit` events, oldest first.
    pub async fn tail(&self, aggregate_id: &str, limit: u64) -> Result<Vec<EventRecord>, LoaderError> {
        let rows = sqlx::query(
            "SELECT aggregate_id, version, event_type, payload, timestamp
             FROM events WHERE aggregate_id = ? ORDER BY version DESC LIMIT ?",
        )
        .bind(aggregate_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut records = rows.iter().map(record_from_row).collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    async fn head_version(&self, aggregate_id: &str) -> Result<u64, LoaderError> {
        let row = sqlx::query("SELECT MAX(version) AS head FROM events WHERE aggregate_id = ?")
            .bind(aggregate_id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.get::<Option<i64>, _>("head").unwrap_or(0) as u64)
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EventRecord, LoaderError> {
    let payload: String = row.get("payload");
    let timestamp: String = row.get("timestamp");
    Ok(EventRecord {
        aggregate_id: row.get("aggregate_id"),
        version: row.get::<i64, _>("version") as u64,
        event_type: row.get("event_type"),
        payload: serde_json::from_str(&payload)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| LoaderError::Storage(format!("bad event timestamp: {e}")))?,
    })
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn load_events(
        &self,
        aggregate_id: &str,
        after_version: u64,
    ) -> Result<Vec<EventRecord>, LoaderError> {
        let rows = sqlx::query(
            "SELECT aggregate_id, version, event_type, payload, timestamp
             FROM events WHERE aggregate_id = ? AND version > ? ORDER BY version",
        )
        .bind(aggregate_id)
        .bind(after_version as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        records: &[EventRecord],
    ) -> Result<(), LoaderError> {
        let conflict = |actual| LoaderError::VersionConflict {
            aggregate_id: aggregate_id.to_string(),
            expected: expected_version,
            actual,
        };

        let mut tx = self.pool.begin().await.map_err(storage)?;
        let row = sqlx::query("SELECT MAX(version) AS head FROM events WHERE aggregate_id = ?")
            .bind(aggregate_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
        let actual = row.get::<Option<i64>, _>("head").unwrap_or(0) as u64;
        if actual != expected_version {
            return Err(conflict(actual));
        }

        for record in records {
            let payload = serde_json::to_string(&record.payload)?;
            let result = sqlx::query(
                "INSERT INTO events (aggregate_id, version, event_type, payload, timestamp)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&record.aggregate_id)
            .bind(record.version as i64)
            .bind(&record.event_type)
            .bind(&payload)
            .bind(record.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await;
            if let Err(e) = result {
                if is_unique_violation(&e) {
                    drop(tx);
                    return Err(conflict(self.head_version(aggregate_id).await?));
                }
                return Err(storage(e));
            }
        }

        tx.commit().await.map_err(storage)?;
        debug!(aggregate_id, events = records.len(), "events appended");
        Ok(())
    }

    async fn load_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, LoaderError> {
        let row = sqlx::query(
            "SELECT aggregate_id, version, status, chain FROM snapshots WHERE aggregate_id = ?",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.get("status");
        let chain: String = row.get("chain");
        Ok(Some(Snapshot {
            aggregate_id: row.get("aggregate_id"),
            version: row.get::<i64, _>("version") as u64,
            status: serde_json::from_value::<NetworkStatus>(Value::String(status))?,
            chain: serde_json::from_str(&chain)?,
        }))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LoaderError> {
        let chain = serde_json::to_string(&snapshot.chain)?;
        sqlx::query(
            "INSERT OR REPLACE INTO snapshots (aggregate_id, version, status, chain)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&snapshot.aggregate_id)
        .bind(snapshot.version as i64)
        .bind(snapshot.status.to_string())
        .bind(&chain)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        debug!(
            aggregate_id = %snapshot.aggregate_id,
            version = snapshot.version,
            "snapshot saved"
        );
        Ok(())
    }

    async fn last_event(&self, aggregate_id: &str) -> Result<Option<EventRecord>, LoaderError> {
        Ok(self.tail(aggregate_id, 1).await?.pop())
    }
}

// ─── Read store ──────────────────────────────────────────────────────────────

/// SQLite-backed read model.
///
/// Entity tables are created by the caller through [`migrate`](Self::migrate);
/// inserts rely on the tables' own primary keys to reject duplicates.
pub struct SqliteReadStore {
    pool: SqlitePool,
}

impl SqliteReadStore {
    pub async fn open(path: &str) -> Result<Self, LoaderError> {
        let store = Self {
            pool: connect(path).await?,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, LoaderError> {
        let store = Self {
            pool: connect_in_memory().await?,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), LoaderError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS system (
                id                INTEGER PRIMARY KEY,
                last_block_height INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query("INSERT OR IGNORE INTO system (id, last_block_height) VALUES (?, -1)")
            .bind(SYSTEM_ROW_ID)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    /// Run caller-supplied DDL, in order.
    pub async fn migrate(&self, statements: &[&str]) -> Result<(), LoaderError> {
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }
        debug!(statements = statements.len(), "read model migrated");
        Ok(())
    }

    /// Number of rows in `entity`.
    pub async fn count(&self, entity: &str) -> Result<u64, LoaderError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {}", ident(entity)?);
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Quote an entity or column name, rejecting anything but `[A-Za-z0-9_]`.
fn ident(name: &str) -> Result<String, LoaderError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(LoaderError::Storage(format!("invalid identifier '{name}'")));
    }
    Ok(format!("\"{name}\""))
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// SQL text and bind values for one operation.
fn statement(op: &Operation) -> Result<(String, Vec<&Value>), LoaderError> {
    let table = ident(&op.entity_name)?;
    match op.method {
        OperationMethod::Insert => {
            let row = op.params.as_object().ok_or_else(|| {
                LoaderError::Storage(format!("{}: insert params must be an object", op.entity_name))
            })?;
            let columns = row.keys().map(|k| ident(k)).collect::<Result<Vec<_>, _>>()?;
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders})",
                columns.join(", ")
            );
            Ok((sql, row.values().collect()))
        }
        OperationMethod::Update => {
            let (conditions, values) = op.update_parts().ok_or_else(|| {
                LoaderError::Storage(format!("{}: update needs conditions and values", op.entity_name))
            })?;
            let set = values
                .keys()
                .map(|k| Ok(format!("{} = ?", ident(k)?)))
                .collect::<Result<Vec<_>, LoaderError>>()?;
            let filter = conditions
                .keys()
                .map(|k| Ok(format!("{} = ?", ident(k)?)))
                .collect::<Result<Vec<_>, LoaderError>>()?;
            let mut sql = format!("UPDATE {table} SET {}", set.join(", "));
            if !filter.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&filter.join(" AND "));
            }
            Ok((sql, values.values().chain(conditions.values()).collect()))
        }
    }
}

#[async_trait]
impl ReadStore for SqliteReadStore {
    async fn last_block_height(&self) -> Result<i64, LoaderError> {
        let row = sqlx::query("SELECT last_block_height FROM system WHERE id = ?")
            .bind(SYSTEM_ROW_ID)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.map(|r| r.get::<i64, _>("last_block_height")).unwrap_or(-1))
    }

    async fn apply(&self, operations: &[Operation]) -> Result<(), LoaderError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for op in operations {
            let (sql, values) = statement(op)?;
            let mut query = sqlx::query(&sql);
            for value in values {
                query = bind_value(query, value);
            }
            if let Err(e) = query.execute(&mut *tx).await {
                if is_unique_violation(&e) {
                    return Err(LoaderError::Integrity {
                        entity: op.entity_name.clone(),
                        reason: e.to_string(),
                    });
                }
                return Err(storage(e));
            }
        }
        tx.commit().await.map_err(storage)?;
        debug!(operations = operations.len(), "read model applied");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainloader_core::event::NetworkEvent;
    use chainloader_core::read_model::system_height_update;
    use chainloader_core::types::LightBlock;
    use serde_json::json;

    fn record(version: u64) -> EventRecord {
        let event = NetworkEvent::BlocksAdded {
            request_id: format!("r{version}"),
            status: NetworkStatus::Awaiting,
            blocks: vec![LightBlock {
                height: version,
                hash: format!("h{version}"),
                previousblockhash: String::new(),
                tx: vec!["t".into()],
                size: 10,
            }],
        };
        EventRecord::new("network", version, &event).unwrap()
    }

    // ── EventStore ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn events_roundtrip_in_version_order() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        store.append("network", 0, &[record(1), record(2)]).await.unwrap();
        store.append("network", 2, &[record(3)]).await.unwrap();

        let loaded = store.load_events("network", 1).await.unwrap();
        assert_eq!(loaded.iter().map(|r| r.version).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(loaded[0].decode().unwrap(), record(2).decode().unwrap());
        assert_eq!(loaded[0].event_type, "BlocksAdded");

        let last = store.last_event("network").await.unwrap().unwrap();
        assert_eq!(last.version, 3);
        assert_eq!(store.tail("network", 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_append_is_a_version_conflict() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        store.append("network", 0, &[record(1)]).await.unwrap();

        let err = store.append("network", 0, &[record(1)]).await.unwrap_err();
        assert!(matches!(
            err,
            LoaderError::VersionConflict { expected: 0, actual: 1, .. }
        ));
        assert_eq!(store.load_events("network", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_upsert() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        assert!(store.load_snapshot("network").await.unwrap().is_none());

        let mut snapshot = Snapshot {
            aggregate_id: "network".into(),
            version: 4,
            status: NetworkStatus::Reorganisation,
            chain: vec![],
        };
        store.save_snapshot(&snapshot).await.unwrap();
        snapshot.version = 8;
        snapshot.status = NetworkStatus::Awaiting;
        store.save_snapshot(&snapshot).await.unwrap();

        assert_eq!(store.load_snapshot("network").await.unwrap().unwrap(), snapshot);
    }

    // ── ReadStore ─────────────────────────────────────────────────────────────

    async fn views() -> SqliteReadStore {
        let store = SqliteReadStore::in_memory().await.unwrap();
        store
            .migrate(&["CREATE TABLE utxo (
                txid         TEXT    NOT NULL,
                n            INTEGER NOT NULL,
                value        INTEGER,
                is_suspended BOOLEAN NOT NULL DEFAULT 0,
                PRIMARY KEY (txid, n)
            )"])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn system_row_seeded() {
        let store = views().await;
        assert_eq!(store.last_block_height().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn apply_commits_rows_and_height() {
        let store = views().await;
        store
            .apply(&[
                Operation::insert("utxo", json!({ "txid": "a", "n": 0, "value": 50 })),
                Operation::insert("utxo", json!({ "txid": "a", "n": 1, "value": 25 })),
                Operation::suspend("utxo", json!({ "txid": "a", "n": 1 })),
                system_height_update(42),
            ])
            .await
            .unwrap();

        assert_eq!(store.count("utxo").await.unwrap(), 2);
        assert_eq!(store.last_block_height().await.unwrap(), 42);

        let suspended: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM utxo WHERE is_suspended = 1")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .get("cnt");
        assert_eq!(suspended, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_integrity_and_rolls_back() {
        let store = views().await;
        store
            .apply(&[Operation::insert("utxo", json!({ "txid": "a", "n": 0 }))])
            .await
            .unwrap();

        let err = store
            .apply(&[
                Operation::insert("utxo", json!({ "txid": "b", "n": 0 })),
                Operation::insert("utxo", json!({ "txid": "a", "n": 0 })),
                system_height_update(7),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, LoaderError::Integrity { ref entity, .. } if entity == "utxo"));
        assert_eq!(store.count("utxo").await.unwrap(), 1);
        assert_eq!(store.last_block_height().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn hostile_identifiers_rejected() {
        let store = views().await;
        let err = store
            .apply(&[Operation::insert("utxo; DROP TABLE system", json!({ "x": 1 }))])
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::Storage(_)));
    }
}
