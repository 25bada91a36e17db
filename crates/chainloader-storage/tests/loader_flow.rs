//! End-to-end loader flows against the in-memory backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use chainloader_core::mapper::ProtocolMapper;
use chainloader_core::read_model::{Operation, ReadStore};
use chainloader_core::store::{EventStore, MemoryEventStore};
use chainloader_core::types::{Block, BlockStats, LightBlock, Transaction};
use chainloader_core::{
    BlockSupplier, ChainProvider, EventRecord, Loader, LoaderBuilder, LoaderError, NetworkEvent,
    NetworkStatus,
};
use chainloader_storage::InMemoryReadStore;

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn block(height: u64, hash: &str, prev: &str) -> Block {
    Block {
        height,
        hash: hash.into(),
        previousblockhash: prev.into(),
        size: 200,
        tx: vec![Transaction {
            txid: format!("{hash}-coinbase"),
            vin: vec![],
            vout: vec![],
        }],
    }
}

fn canonical(range: std::ops::RangeInclusive<u64>) -> Vec<Block> {
    range
        .map(|h| {
            let prev = if h == 0 { String::new() } else { format!("h{}", h - 1) };
            block(h, &format!("h{h}"), &prev)
        })
        .collect()
}

/// Authoritative chain the provider serves.
#[derive(Default)]
struct Node {
    blocks: Mutex<HashMap<u64, Block>>,
}

impl Node {
    fn serve(&self, blocks: &[Block]) {
        let mut chain = self.blocks.lock().unwrap();
        for b in blocks {
            chain.insert(b.height, b.clone());
        }
    }
}

#[async_trait]
impl ChainProvider for Node {
    async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, LoaderError> {
        Ok(self.blocks.lock().unwrap().get(&height).cloned())
    }

    async fn get_blocks_by_hashes(&self, hashes: &[String]) -> Result<Vec<Block>, LoaderError> {
        let chain = self.blocks.lock().unwrap();
        Ok(hashes
            .iter()
            .filter_map(|h| chain.values().find(|b| &b.hash == h).cloned())
            .collect())
    }

    async fn get_block_stats_by_heights(
        &self,
        heights: &[u64],
    ) -> Result<Vec<BlockStats>, LoaderError> {
        let chain = self.blocks.lock().unwrap();
        Ok(heights
            .iter()
            .filter_map(|h| chain.get(h))
            .map(|b| BlockStats {
                height: b.height,
                blockhash: b.hash.clone(),
                total_size: b.size,
            })
            .collect())
    }
}

/// Supplier that fetches confirmed batches from the node and records control calls.
struct Queue {
    node: Arc<Node>,
    calls: Mutex<Vec<String>>,
}

impl Queue {
    fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlockSupplier for Queue {
    async fn start(&self, indexed_height: i64) -> Result<(), LoaderError> {
        self.calls.lock().unwrap().push(format!("start:{indexed_height}"));
        Ok(())
    }

    async fn reorganize(&self, height: u64) -> Result<(), LoaderError> {
        self.calls.lock().unwrap().push(format!("reorganize:{height}"));
        Ok(())
    }

    async fn confirm_processed_batch(&self, hashes: &[String]) -> Result<Vec<Block>, LoaderError> {
        self.node.get_blocks_by_hashes(hashes).await
    }
}

/// One `tx` row per transaction; rollback suspends the block's rows.
#[derive(Clone, Default)]
struct TxMapper {
    fail_at: Option<u64>,
    fail_rollback: bool,
}

impl TxMapper {
    fn failing_at(height: u64) -> Self {
        Self {
            fail_at: Some(height),
            ..Default::default()
        }
    }

    fn failing_rollback() -> Self {
        Self {
            fail_rollback: true,
            ..Default::default()
        }
    }
}

impl ProtocolMapper for TxMapper {
    fn on_load(&mut self, block: &Block) -> Result<Vec<Operation>, LoaderError> {
        if self.fail_at == Some(block.height) {
            return Err(LoaderError::mapper(format!("cannot decode block {}", block.height)));
        }
        Ok(block
            .tx
            .iter()
            .map(|tx| {
                Operation::insert(
                    "tx",
                    json!({ "txid": tx.txid, "block_height": block.height, "block_hash": block.hash }),
                )
            })
            .collect())
    }

    fn on_reorganisation(&mut self, block: &LightBlock) -> Result<Vec<Operation>, LoaderError> {
        if self.fail_rollback {
            return Err(LoaderError::mapper(format!("cannot undo block {}", block.height)));
        }
        Ok(vec![Operation::suspend(
            "tx",
            json!({ "block_hash": block.hash }),
        )])
    }
}

struct Env {
    events: Arc<MemoryEventStore>,
    views: Arc<InMemoryReadStore>,
    node: Arc<Node>,
    queue: Arc<Queue>,
}

impl Env {
    fn new() -> Self {
        let views = Arc::new(InMemoryReadStore::new());
        views.define_entity("tx", &["txid"]).unwrap();
        let node = Arc::new(Node::default());
        Self {
            events: Arc::new(MemoryEventStore::new()),
            views,
            queue: Arc::new(Queue::new(node.clone())),
            node,
        }
    }

    /// A loader over the shared stores; a fresh one simulates a restart.
    fn loader(&self, mapper: TxMapper) -> Loader {
        let config = LoaderBuilder::new()
            .workers_count(3)
            .max_window_size(200 * 20)
            .snapshot_interval(4)
            .build_config()
            .unwrap();
        Loader::new(
            config,
            self.events.clone(),
            self.views.clone(),
            self.node.clone(),
            self.queue.clone(),
            move |_| mapper.clone(),
        )
        .unwrap()
    }

    /// The node serves the batch, then the supplier delivers it.
    async fn deliver(&self, loader: &Loader, blocks: Vec<Block>) -> Result<(), LoaderError> {
        self.node.serve(&blocks);
        loader.handle_batch(blocks).await
    }

    async fn read_height(&self) -> i64 {
        self.views.last_block_height().await.unwrap()
    }

    async fn event_types(&self) -> Vec<String> {
        self.events
            .load_events("network", 0)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.event_type)
            .collect()
    }

    fn suspended_hashes(&self) -> Vec<String> {
        self.views
            .rows("tx")
            .unwrap()
            .iter()
            .filter(|r| r.get("is_suspended") == Some(&json!(true)))
            .map(|r| r["block_hash"].as_str().unwrap().to_string())
            .collect()
    }

    /// Store a `ReorganisationStarted` at `height` without letting a driver
    /// finish it, as if the process died right after the append.
    async fn persist_started_reorganisation(&self, loader: &Loader, height: u64) {
        let mut agg = loader.aggregate().await.unwrap();
        agg.start_reorganisation("interrupted", height, self.node.as_ref())
            .await
            .unwrap();
        let records: Vec<_> = agg
            .uncommitted()
            .iter()
            .enumerate()
            .map(|(i, e)| EventRecord::new("network", agg.committed_version() + 1 + i as u64, e).unwrap())
            .collect();
        self.events
            .append("network", agg.committed_version(), &records)
            .await
            .unwrap();
    }
}

// ─── Flows ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn forward_ingestion_projects_every_block() {
    let env = Env::new();
    let loader = env.loader(TxMapper::default());
    env.node.serve(&canonical(0..=29));

    loader.init().await.unwrap();
    for range in [0..=9, 10..=19, 20..=29] {
        env.deliver(&loader, canonical(range)).await.unwrap();
    }

    assert_eq!(env.read_height().await, 29);
    let rows = env.views.rows("tx").unwrap();
    assert_eq!(rows.len(), 30);
    let heights: Vec<u64> = rows.iter().map(|r| r["block_height"].as_u64().unwrap()).collect();
    assert_eq!(heights, (0..=29).collect::<Vec<_>>());

    // window bounded to 20 blocks of 200 bytes
    let agg = loader.aggregate().await.unwrap();
    assert_eq!(agg.chain().len(), 20);
    assert_eq!(agg.chain().floor_height(), Some(10));
    assert_eq!(agg.chain().last_block_height(), Some(29));
    assert_eq!(env.queue.calls(), vec!["start:-1"]);
}

#[tokio::test]
async fn reorg_rolls_back_and_redirects_supplier() {
    let env = Env::new();
    let loader = env.loader(TxMapper::default());
    env.node.serve(&canonical(0..=9));
    loader.init().await.unwrap();
    env.deliver(&loader, canonical(0..=9)).await.unwrap();

    // The node switches to a fork from height 7.
    let fork = vec![block(7, "f7", "h6"), block(8, "f8", "f7"), block(9, "f9", "f8")];
    env.node.serve(&fork);
    env.deliver(&loader, vec![block(10, "f10", "f9")]).await.unwrap();

    let agg = loader.aggregate().await.unwrap();
    assert_eq!(agg.status(), NetworkStatus::Awaiting);
    assert_eq!(agg.chain().last_block_height(), Some(6));
    assert_eq!(env.read_height().await, 6);
    assert_eq!(env.queue.calls().last().unwrap(), "reorganize:6");

    let types = env.event_types().await;
    assert_eq!(
        &types[types.len() - 2..],
        ["ReorganisationStarted", "ReorganisationFinished"]
    );
    let started = env
        .events
        .load_events("network", 0)
        .await
        .unwrap()
        .into_iter()
        .find_map(|r| match r.decode().unwrap() {
            NetworkEvent::ReorganisationStarted { height, blocks, .. } => Some((height, blocks)),
            _ => None,
        })
        .unwrap();
    assert_eq!(started.0, 6);
    assert_eq!(
        started.1.iter().map(|b| b.hash.as_str()).collect::<Vec<_>>(),
        ["h7", "h8", "h9"]
    );

    assert_eq!(env.suspended_hashes(), ["h7", "h8", "h9"]);

    // Supplier resumes on the fork.
    env.deliver(&loader, fork.clone()).await.unwrap();
    env.deliver(&loader, vec![block(10, "f10", "f9")]).await.unwrap();
    assert_eq!(env.read_height().await, 10);
    assert_eq!(
        loader.aggregate().await.unwrap().chain().tip().unwrap().hash,
        "f10"
    );
}

#[tokio::test]
async fn mapper_failure_is_reconciled_on_restart() {
    let env = Env::new();
    env.node.serve(&canonical(0..=5));

    let loader = env.loader(TxMapper::failing_at(4));
    loader.init().await.unwrap();
    env.deliver(&loader, canonical(0..=2)).await.unwrap();

    let err = env.deliver(&loader, canonical(3..=5)).await.unwrap_err();
    assert!(matches!(err, LoaderError::Mapper { .. }));

    // Write side accepted the batch, read side did not.
    assert_eq!(env.read_height().await, 2);
    assert_eq!(env.views.rows("tx").unwrap().len(), 3);
    assert_eq!(
        loader.aggregate().await.unwrap().chain().last_block_height(),
        Some(5)
    );
    drop(loader);

    // Restart with a fixed mapper: init clamps the window back to the read side.
    let loader = env.loader(TxMapper::default());
    loader.init().await.unwrap();
    assert_eq!(
        loader.aggregate().await.unwrap().chain().last_block_height(),
        Some(2)
    );
    assert_eq!(env.queue.calls().last().unwrap(), "start:2");

    env.deliver(&loader, canonical(3..=5)).await.unwrap();
    assert_eq!(env.read_height().await, 5);
    assert_eq!(env.views.rows("tx").unwrap().len(), 6);
}

#[tokio::test]
async fn duplicate_projection_is_an_integrity_error() {
    let env = Env::new();
    let loader = env.loader(TxMapper::default());
    env.node.serve(&canonical(0..=3));
    loader.init().await.unwrap();
    env.deliver(&loader, canonical(0..=1)).await.unwrap();

    // Block 2 repeats a transaction id already projected at height 1.
    let mut dup = canonical(2..=2).remove(0);
    dup.tx.push(Transaction {
        txid: "h1-coinbase".into(),
        vin: vec![],
        vout: vec![],
    });

    let err = env.deliver(&loader, vec![dup]).await.unwrap_err();
    assert!(err.is_integrity());
    assert!(!err.is_transient());
    assert_eq!(env.read_height().await, 1);
    assert_eq!(env.views.rows("tx").unwrap().len(), 2);
}

#[tokio::test]
async fn interrupted_reorganisation_resumes_on_next_batch() {
    let env = Env::new();
    let loader = env.loader(TxMapper::default());
    env.node.serve(&canonical(0..=3));
    loader.init().await.unwrap();
    env.deliver(&loader, canonical(0..=3)).await.unwrap();
    env.persist_started_reorganisation(&loader, 3).await;

    // After a restart the first batch only finishes the pending reorganisation.
    let loader = env.loader(TxMapper::default());
    assert_eq!(loader.aggregate().await.unwrap().status(), NetworkStatus::Reorganisation);
    env.deliver(&loader, canonical(4..=4)).await.unwrap();

    let agg = loader.aggregate().await.unwrap();
    assert_eq!(agg.status(), NetworkStatus::Awaiting);
    assert_eq!(agg.chain().last_block_height(), Some(3));
    assert_eq!(env.read_height().await, 3);
    assert_eq!(env.queue.calls().last().unwrap(), "reorganize:3");

    // The redirected supplier delivers it again.
    env.deliver(&loader, canonical(4..=4)).await.unwrap();
    assert_eq!(env.read_height().await, 4);
}

#[tokio::test]
async fn init_clears_interrupted_reorganisation() {
    let env = Env::new();
    let loader = env.loader(TxMapper::default());
    env.node.serve(&canonical(0..=3));
    loader.init().await.unwrap();
    env.deliver(&loader, canonical(0..=3)).await.unwrap();
    env.persist_started_reorganisation(&loader, 3).await;

    let loader = env.loader(TxMapper::default());
    loader.init().await.unwrap();
    assert_eq!(loader.aggregate().await.unwrap().status(), NetworkStatus::Awaiting);
    assert_eq!(env.queue.calls().last().unwrap(), "start:3");

    env.deliver(&loader, canonical(4..=4)).await.unwrap();
    assert_eq!(env.read_height().await, 4);
}

#[tokio::test]
async fn failed_rollback_projection_is_replayed_by_init() {
    let env = Env::new();
    env.node.serve(&canonical(0..=9));
    let loader = env.loader(TxMapper::failing_rollback());
    loader.init().await.unwrap();
    env.deliver(&loader, canonical(0..=9)).await.unwrap();

    let fork = vec![block(7, "f7", "h6"), block(8, "f8", "f7"), block(9, "f9", "f8")];
    env.node.serve(&fork);
    let err = env
        .deliver(&loader, vec![block(10, "f10", "f9")])
        .await
        .unwrap_err();
    assert!(matches!(err, LoaderError::Mapper { .. }));

    // Write side finished the rollback, read side never saw it.
    assert_eq!(
        loader.aggregate().await.unwrap().chain().last_block_height(),
        Some(6)
    );
    assert_eq!(env.read_height().await, 9);
    assert!(env.suspended_hashes().is_empty());
    assert!(!env.queue.calls().iter().any(|c| c.starts_with("reorganize")));
    drop(loader);

    let loader = env.loader(TxMapper::default());
    loader.init().await.unwrap();
    assert_eq!(env.read_height().await, 6);
    assert_eq!(env.suspended_hashes(), ["h7", "h8", "h9"]);
    assert_eq!(env.queue.calls().last().unwrap(), "start:6");

    env.deliver(&loader, fork).await.unwrap();
    env.deliver(&loader, vec![block(10, "f10", "f9")]).await.unwrap();
    assert_eq!(env.read_height().await, 10);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_backed_loader_survives_restart() {
    use chainloader_storage::{SqliteEventStore, SqliteReadStore};

    let events = Arc::new(SqliteEventStore::in_memory().await.unwrap());
    let views = Arc::new(SqliteReadStore::in_memory().await.unwrap());
    views
        .migrate(&["CREATE TABLE tx (
            txid         TEXT PRIMARY KEY,
            block_height INTEGER NOT NULL,
            block_hash   TEXT NOT NULL,
            is_suspended BOOLEAN NOT NULL DEFAULT 0
        )"])
        .await
        .unwrap();
    let node = Arc::new(Node::default());
    let queue = Arc::new(Queue::new(node.clone()));
    node.serve(&canonical(0..=9));

    let build = || {
        let config = LoaderBuilder::new()
            .workers_count(2)
            .snapshot_interval(2)
            .build_config()
            .unwrap();
        Loader::new(
            config,
            events.clone(),
            views.clone(),
            node.clone(),
            queue.clone(),
            |_| TxMapper::default(),
        )
        .unwrap()
    };

    let loader = build();
    loader.init().await.unwrap();
    loader.handle_batch(canonical(0..=4)).await.unwrap();
    let before = loader.aggregate().await.unwrap();
    drop(loader);

    let loader = build();
    let after = loader.aggregate().await.unwrap();
    assert_eq!(after.state(), before.state());
    assert!(events.load_snapshot("network").await.unwrap().is_some());

    loader.handle_batch(canonical(5..=9)).await.unwrap();
    assert_eq!(views.last_block_height().await.unwrap(), 9);
    assert_eq!(views.count("tx").await.unwrap(), 10);
}
