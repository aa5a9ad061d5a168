//! Persist executor: a relay plus a fixed pool of workers
//!
//! The relay drains the upstream batch channel into a bounded internal
//! queue whose capacity equals the worker count. Each worker takes one
//! batch at a time, acquires the batch's key from the [`FileStore`], runs
//! every operation in order against that single acquisition, and releases.
//! The operations themselves run on Tokio's blocking pool, so a slow disk
//! holds a blocking thread rather than a runtime worker.
//! Exclusivity lives in the store, so adding workers only adds cross-key
//! parallelism; operations on one key stay serialized.
//!
//! Closing the upstream channel is the only shutdown signal. Every batch
//! sent before closure still reaches a worker.

use crate::fs::{FileSystem, unblock};
use crate::operation::Operation;
use crate::store::{FileStore, Key};
use crate::{Result, StoreConfig, StoreError};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Ordered, non-empty group of operations that share one target key.
#[derive(Debug)]
pub struct Batch<K> {
    key: K,
    ops: Vec<Operation<K>>,
}

impl<K: Key> Batch<K> {
    /// Group `ops` into a batch.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidBatch` if `ops` is empty or the operations
    /// target more than one key
    pub fn new(ops: Vec<Operation<K>>) -> Result<Self> {
        let key = ops
            .first()
            .map(|op| op.target().clone())
            .ok_or_else(|| StoreError::InvalidBatch("batch has no operations".to_string()))?;

        if let Some(stray) = ops.iter().find(|op| *op.target() != key) {
            return Err(StoreError::InvalidBatch(format!(
                "batch for key {key} contains an operation for key {}",
                stray.target()
            )));
        }

        Ok(Self { key, ops })
    }

    /// Batch holding a single operation.
    pub fn single(op: impl Into<Operation<K>>) -> Self {
        let op = op.into();
        Self {
            key: op.target().clone(),
            ops: vec![op],
        }
    }

    /// Key shared by every operation.
    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Always false; batches are never empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Counters describing executor activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Batches executed
    pub batches: u64,
    /// Operations executed
    pub operations: u64,
    /// Batches whose file could not be acquired
    pub acquire_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    operations: AtomicU64,
    acquire_failures: AtomicU64,
}

/// Shared receiving end of the internal queue
type BatchQueue<K> = Arc<Mutex<mpsc::Receiver<Batch<K>>>>;

/// Relay task plus a fixed pool of persist workers.
#[derive(Debug)]
pub struct PersistExecutor {
    relay: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl PersistExecutor {
    /// Spawn the relay and `config.num_workers` workers draining `input`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` if the configuration is invalid; no task
    /// is started in that case
    pub fn start<K: Key, FS: FileSystem>(
        store: Arc<FileStore<K, FS>>,
        config: &StoreConfig,
        input: mpsc::Receiver<Batch<K>>,
    ) -> Result<Self> {
        config.validate()?;

        let (queue_tx, queue_rx) = mpsc::channel(config.num_workers);
        let queue: BatchQueue<K> = Arc::new(Mutex::new(queue_rx));
        let counters = Arc::new(Counters::default());

        let relay = tokio::spawn(relay(input, queue_tx));
        let workers = (0..config.num_workers)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&store),
                    Arc::clone(&queue),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        info!("Started persist executor with {} workers", config.num_workers);

        Ok(Self {
            relay,
            workers,
            counters,
        })
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            operations: self.counters.operations.load(Ordering::Relaxed),
            acquire_failures: self.counters.acquire_failures.load(Ordering::Relaxed),
        }
    }

    /// Wait until the upstream channel has closed and every queued batch has
    /// run.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Concurrency` if the relay or a worker panicked
    pub async fn join(self) -> Result<()> {
        self.relay
            .await
            .map_err(|e| StoreError::Concurrency(format!("persist relay failed: {e}")))?;

        for (id, result) in join_all(self.workers).await.into_iter().enumerate() {
            result.map_err(|e| {
                StoreError::Concurrency(format!("persist worker {id} failed: {e}"))
            })?;
        }

        info!("Persist executor shut down");
        Ok(())
    }
}

async fn relay<K: Key>(mut input: mpsc::Receiver<Batch<K>>, queue: mpsc::Sender<Batch<K>>) {
    while let Some(batch) = input.recv().await {
        if let Err(mpsc::error::SendError(batch)) = queue.send(batch).await {
            warn!(key = %batch.key, "All persist workers are gone, dropping batch");
            break;
        }
    }
    // Dropping `queue` closes the internal channel and lets workers drain
    debug!("Batch input closed, relay exiting");
}

async fn run_worker<K: Key, FS: FileSystem>(
    id: usize,
    store: Arc<FileStore<K, FS>>,
    queue: BatchQueue<K>,
    counters: Arc<Counters>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(batch) = next else {
            break;
        };
        execute(&store, batch, &counters).await;
    }
    debug!(worker = id, "Persist worker exiting");
}

async fn execute<K: Key, FS: FileSystem>(
    store: &FileStore<K, FS>,
    batch: Batch<K>,
    counters: &Counters,
) {
    counters.batches.fetch_add(1, Ordering::Relaxed);
    counters
        .operations
        .fetch_add(batch.ops.len() as u64, Ordering::Relaxed);

    let Batch { key, ops } = batch;
    match store.acquire(key.clone()).await {
        Ok(guard) => {
            // The held guard travels to the blocking pool and back
            let ran = unblock(move || {
                let mut guard = guard;
                for op in ops {
                    op.exec(Ok(guard.file_mut()));
                }
                guard
            })
            .await;

            match ran {
                Ok(guard) => store.release(guard),
                Err(e) => error!(key = %key, "Persist batch panicked: {e}"),
            }
        }
        Err(e) => {
            counters.acquire_failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, "Failed to acquire shard file: {e}");
            for op in ops {
                op.exec::<FS::File>(Err(&e));
            }
        }
    }
}
