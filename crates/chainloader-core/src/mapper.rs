//! Protocol mapper pool: runs user mapping code on isolated worker threads.
//!
//! Each worker owns one mapper instance, created at startup, and receives
//! tasks over its own channel. A forward batch is cut into contiguous chunks
//! that are spread across workers; results are concatenated in submission
//! order, so the output is the same as mapping the batch on a single worker.
//! A reorg batch is mapped as one task.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::LoaderError;
use crate::read_model::Operation;
use crate::types::{Block, LightBlock};

/// User-supplied block → operations mapping.
///
/// Calls must depend only on their argument; anything a mapper memoizes stays
/// private to its worker.
pub trait ProtocolMapper: Send + 'static {
    /// Operations for a newly confirmed block.
    fn on_load(&mut self, block: &Block) -> Result<Vec<Operation>, LoaderError>;

    /// Operations undoing a rolled-back block.
    fn on_reorganisation(&mut self, block: &LightBlock) -> Result<Vec<Operation>, LoaderError>;
}

/// How a forward batch is cut into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// One chunk per worker, equal block counts.
    #[default]
    ByCount,
    /// Chunks bounded by cumulative block size.
    BySize { max_chunk_bytes: u64 },
}

impl std::fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByCount => write!(f, "by count"),
            Self::BySize { max_chunk_bytes } => write!(f, "by size, {max_chunk_bytes} bytes max"),
        }
    }
}

/// Split `items` into at most `parts` contiguous runs of near-equal length.
///
/// The first `len % parts` runs take one extra item.
pub fn split_by_count<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    let parts = parts.max(1).min(items.len());
    if parts == 0 {
        return Vec::new();
    }
    let base = items.len() / parts;
    let extra = items.len() % parts;

    let mut chunks = Vec::with_capacity(parts);
    let mut iter = items.into_iter();
    for i in 0..parts {
        let take = base + usize::from(i < extra);
        chunks.push(iter.by_ref().take(take).collect());
    }
    chunks
}

/// Split `blocks` into contiguous runs of at most `max_bytes` cumulative size.
///
/// A block larger than the limit gets a chunk of its own.
pub fn split_by_size(blocks: Vec<Block>, max_bytes: u64) -> Vec<Vec<Block>> {
    let mut chunks = Vec::new();
    let mut current: Vec<Block> = Vec::new();
    let mut current_size = 0u64;
    for block in blocks {
        if !current.is_empty() && current_size + block.size > max_bytes {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += block.size;
        current.push(block);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

type Reply = oneshot::Sender<Result<Vec<Operation>, LoaderError>>;

enum Task {
    Load { blocks: Vec<Block>, reply: Reply },
    Reorganisation { blocks: Vec<LightBlock>, reply: Reply },
}

/// Fixed pool of mapper workers.
pub struct MapperPool {
    senders: Vec<mpsc::UnboundedSender<Task>>,
    handles: Vec<JoinHandle<()>>,
    chunking: ChunkStrategy,
    next: AtomicUsize,
}

impl MapperPool {
    /// Spawn `workers` threads, each with a mapper built by `factory(index)`.
    pub fn new<M, F>(workers: usize, chunking: ChunkStrategy, factory: F) -> Result<Self, LoaderError>
    where
        M: ProtocolMapper,
        F: Fn(usize) -> M,
    {
        if workers == 0 {
            return Err(LoaderError::Config("mapper pool needs at least one worker".into()));
        }

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            let mapper = factory(index);
            let handle = std::thread::Builder::new()
                .name(format!("chainloader-mapper-{index}"))
                .spawn(move || run_worker(index, mapper, rx))
                .map_err(|e| LoaderError::Other(format!("failed to spawn mapper worker: {e}")))?;
            senders.push(tx);
            handles.push(handle);
        }
        debug!(workers, ?chunking, "Mapper pool started");

        Ok(Self {
            senders,
            handles,
            chunking,
            next: AtomicUsize::new(0),
        })
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    pub fn chunking(&self) -> ChunkStrategy {
        self.chunking
    }

    /// Map a confirmed forward batch. Any chunk failure fails the batch.
    pub async fn map_on_load(&self, blocks: Vec<Block>) -> Result<Vec<Operation>, LoaderError> {
        let chunks = match self.chunking {
            ChunkStrategy::ByCount => split_by_count(blocks, self.workers()),
            ChunkStrategy::BySize { max_chunk_bytes } => split_by_size(blocks, max_chunk_bytes),
        };

        let mut pending = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            let worker = i % self.workers();
            let (reply, rx) = oneshot::channel();
            self.submit(worker, Task::Load { blocks: chunk, reply })?;
            pending.push(receive(worker, rx));
        }

        let results = try_join_all(pending).await?;
        Ok(results.into_iter().flatten().collect())
    }

    /// Map the rolled-back blocks as a single task.
    pub async fn map_on_reorganisation(
        &self,
        blocks: Vec<LightBlock>,
    ) -> Result<Vec<Operation>, LoaderError> {
        if blocks.is_empty() {
            return Ok(Vec::new());
        }
        let worker = self.next.fetch_add(1, Ordering::Relaxed) % self.workers();
        let (reply, rx) = oneshot::channel();
        self.submit(worker, Task::Reorganisation { blocks, reply })?;
        receive(worker, rx).await
    }

    fn submit(&self, worker: usize, task: Task) -> Result<(), LoaderError> {
        self.senders[worker].send(task).map_err(|_| LoaderError::Mapper {
            worker,
            reason: "worker stopped".into(),
        })
    }
}

impl Drop for MapperPool {
    fn drop(&mut self) {
        // Closing the channels ends each worker loop.
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Mapper worker exited abnormally");
            }
        }
    }
}

async fn receive(
    worker: usize,
    rx: oneshot::Receiver<Result<Vec<Operation>, LoaderError>>,
) -> Result<Vec<Operation>, LoaderError> {
    rx.await.map_err(|_| LoaderError::Mapper {
        worker,
        reason: "worker dropped the task".into(),
    })?
}

fn run_worker<M: ProtocolMapper>(
    index: usize,
    mut mapper: M,
    mut tasks: mpsc::UnboundedReceiver<Task>,
) {
    while let Some(task) = tasks.blocking_recv() {
        match task {
            Task::Load { blocks, reply } => {
                let result = guarded(index, || {
                    let mut ops = Vec::new();
                    for block in &blocks {
                        ops.extend(mapper.on_load(block)?);
                    }
                    Ok(ops)
                });
                let _ = reply.send(result);
            }
            Task::Reorganisation { blocks, reply } => {
                let result = guarded(index, || {
                    let mut ops = Vec::new();
                    for block in &blocks {
                        ops.extend(mapper.on_reorganisation(block)?);
                    }
                    Ok(ops)
                });
                let _ = reply.send(result);
            }
        }
    }
    debug!(worker = index, "Mapper worker stopped");
}

/// Run `f`, turning a panic into a mapper error and tagging mapper errors with
/// the worker index.
fn guarded<F>(index: usize, f: F) -> Result<Vec<Operation>, LoaderError>
where
    F: FnOnce() -> Result<Vec<Operation>, LoaderError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Err(LoaderError::Mapper { reason, .. })) => Err(LoaderError::Mapper {
            worker: index,
            reason,
        }),
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "mapper panicked".into());
            warn!(worker = index, %reason, "Mapper panicked");
            Err(LoaderError::Mapper {
                worker: index,
                reason: format!("panic: {reason}"),
            })
        }
    }
}
