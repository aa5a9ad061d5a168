//! Idle and forced sync of open shard files
//!
//! On every tick the daemon walks a snapshot of the open entries and flushes
//! the ones that are both unlocked and older than `max_age`. Busy files are
//! skipped and reconsidered on the next tick. When stopped it takes every
//! entry's lock, waiting if necessary, and flushes each file once more so
//! nothing written before shutdown is left unsynced.
//!
//! Flushes run on Tokio's blocking pool while the entry stays locked.
//!
//! Periodic flush failures never stall the loop: they are logged and, if a
//! reporter channel is attached, offered to it without waiting.

use crate::fs::{FileSystem, FsFile, unblock};
use crate::store::{FileGuard, FileStore, Key};
use crate::{FlushFailure, Result, StoreConfig, StoreError};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Background flusher for a [`FileStore`].
pub struct SyncDaemon<K: Key, FS: FileSystem> {
    store: Arc<FileStore<K, FS>>,
    interval: Duration,
    max_age: Duration,
    reporter: Option<mpsc::Sender<FlushFailure>>,
}

impl<K: Key, FS: FileSystem> SyncDaemon<K, FS> {
    /// Create a daemon using `config.sync_interval` and `config.sync_max_age`.
    pub fn new(store: Arc<FileStore<K, FS>>, config: &StoreConfig) -> Self {
        Self {
            store,
            interval: config.sync_interval,
            max_age: config.sync_max_age,
            reporter: None,
        }
    }

    /// Offer periodic flush failures to `reporter`.
    ///
    /// Failures are dropped when the channel is full or closed.
    #[must_use]
    pub fn with_reporter(mut self, reporter: mpsc::Sender<FlushFailure>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Start the periodic loop on the current Tokio runtime.
    ///
    /// Dropping the returned handle without calling [`SyncHandle::stop`]
    /// still runs the final flush, but its outcome is lost.
    pub fn spawn(self) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        SyncHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// One periodic scan: flush every unlocked file older than `max_age`.
    ///
    /// Returns the failures of this scan.
    pub async fn sync_idle(&self) -> Vec<FlushFailure> {
        let mut failures = Vec::new();

        for (key, entry) in self.store.open_files() {
            let Some(guard) = entry.try_lock() else {
                continue;
            };
            if guard.age() <= self.max_age {
                continue;
            }
            match flush(guard).await {
                Ok(()) => debug!(key = %key, "Flushed idle shard file"),
                Err(source) => failures.push(FlushFailure {
                    key: key.to_string(),
                    source,
                }),
            }
        }

        failures
    }

    /// Flush every open file, waiting for busy ones.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Flush` carrying every failed flush; the pass
    /// continues past individual failures
    pub async fn sync_all(&self) -> Result<()> {
        let mut failures = Vec::new();
        let mut flushed = 0usize;

        for (key, entry) in self.store.open_files() {
            // Entries closed since the snapshot have nothing left to flush
            let Some(guard) = entry.lock().await else {
                continue;
            };
            match flush(guard).await {
                Ok(()) => flushed += 1,
                Err(source) => failures.push(FlushFailure {
                    key: key.to_string(),
                    source,
                }),
            }
        }

        info!(
            "Shutdown flush complete: {} synced, {} failed",
            flushed,
            failures.len()
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Flush(failures))
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        debug!(
            "Sync daemon running every {:?} (max age {:?})",
            self.interval, self.max_age
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let failures = self.sync_idle().await;
                    self.report(failures);
                }
            }
        }

        self.sync_all().await
    }

    fn report(&self, failures: Vec<FlushFailure>) {
        for failure in failures {
            warn!("Periodic flush failed: {failure}");
            if let Some(reporter) = &self.reporter
                && reporter.try_send(failure).is_err()
            {
                debug!("Flush failure not delivered, reporter is full or gone");
            }
        }
    }
}

/// Sync `guard`'s file on the blocking pool, unlocking it afterwards.
async fn flush<K: Key, F: FsFile>(mut guard: FileGuard<K, F>) -> io::Result<()> {
    unblock(move || guard.sync()).await?
}

/// Handle to a running [`SyncDaemon`].
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl SyncHandle {
    /// Stop the periodic loop and run the final forced flush.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Flush` if any file failed its final flush, or
    /// `StoreError::Concurrency` if the daemon task panicked
    pub async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            // The daemon only goes away early by panicking, which join reports
            let _ = shutdown.send(());
        }

        self.task
            .await
            .map_err(|e| StoreError::Concurrency(format!("sync daemon failed: {e}")))?
    }
}
