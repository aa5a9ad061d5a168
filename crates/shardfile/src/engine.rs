//! Supervisor owning the store, the sync daemon and the executor

use crate::executor::{Batch, ExecutorStats, PersistExecutor};
use crate::facade::{Reader, Writer};
use crate::fs::FileSystem;
use crate::operation::{ReadResponse, WriteResponse};
use crate::store::{FileStore, Key};
use crate::sync::{SyncDaemon, SyncHandle};
use crate::{FlushFailure, Result, StoreConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A running persistence core.
///
/// Shutdown is ordered: the executor drains every batch already submitted,
/// then the sync daemon runs its final flush over whatever is still open.
#[derive(Debug)]
pub struct Engine<K: Key, FS: FileSystem> {
    config: StoreConfig,
    store: Arc<FileStore<K, FS>>,
    input: mpsc::Sender<Batch<K>>,
    executor: PersistExecutor,
    sync: SyncHandle,
}

impl<K: Key, FS: FileSystem> Engine<K, FS> {
    /// Open the store under `config.root` and start the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` if the configuration is invalid or the
    /// root directory cannot be created
    pub fn open(fs: FS, config: StoreConfig) -> Result<Self> {
        Self::start(fs, config, None)
    }

    /// Like [`Engine::open`], offering periodic flush failures to `reporter`.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::open`]
    pub fn open_with_reporter(
        fs: FS,
        config: StoreConfig,
        reporter: mpsc::Sender<FlushFailure>,
    ) -> Result<Self> {
        Self::start(fs, config, Some(reporter))
    }

    fn start(
        fs: FS,
        config: StoreConfig,
        reporter: Option<mpsc::Sender<FlushFailure>>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(FileStore::open(fs, &config)?);
        let (input, input_rx) = mpsc::channel(config.input_capacity);
        let executor = PersistExecutor::start(Arc::clone(&store), &config, input_rx)?;

        let mut daemon = SyncDaemon::new(Arc::clone(&store), &config);
        if let Some(reporter) = reporter {
            daemon = daemon.with_reporter(reporter);
        }
        let sync = daemon.spawn();

        info!("Opened shard file engine at {:?}", config.root);

        Ok(Self {
            config,
            store,
            input,
            executor,
            sync,
        })
    }

    /// New reader with its own response channel.
    pub fn reader(&self) -> (Reader<K>, mpsc::UnboundedReceiver<ReadResponse<K>>) {
        Reader::new(self.input.clone())
    }

    /// New writer with its own response channel.
    pub fn writer(&self) -> (Writer<K>, mpsc::UnboundedReceiver<WriteResponse<K>>) {
        Writer::new(self.input.clone())
    }

    /// Raw batch input, for callers building their own operations.
    pub fn input(&self) -> mpsc::Sender<Batch<K>> {
        self.input.clone()
    }

    /// The underlying file store.
    pub const fn store(&self) -> &Arc<FileStore<K, FS>> {
        &self.store
    }

    /// Configuration the engine was opened with.
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Executor activity so far.
    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Drain the executor, then run the final flush.
    ///
    /// Waits for every reader, writer and raw input sender handed out by
    /// this engine to be dropped.
    ///
    /// # Errors
    ///
    /// Returns the executor's join error if it failed, otherwise the
    /// flush result of the sync daemon
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            store,
            input,
            executor,
            sync,
            ..
        } = self;

        drop(input);
        let drained = executor.join().await;
        if let Err(e) = &drained {
            warn!("Persist executor did not shut down cleanly: {e}");
        }

        let flushed = sync.stop().await;

        info!("Engine shut down with {} shard files open", store.len());

        drained.and(flushed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::StoreError;
    use crate::fs::MemFs;
    use crate::operation::{ReadRequest, WriteRequest};
    use bytes::Bytes;
    use std::path::Path;
    use std::time::Duration;

    fn config() -> StoreConfig {
        StoreConfig::new("/db")
            .with_num_workers(4)
            .with_sync(Duration::from_millis(10), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_invalid_config_starts_nothing() {
        let fs = MemFs::new();
        let err = Engine::<u32, _>::open(fs.clone(), config().with_num_workers(0))
            .expect_err("zero workers must be rejected");
        assert!(matches!(err, StoreError::Config(_)));
        assert_eq!(fs.dir_perms(Path::new("/db")), None);
    }

    #[tokio::test]
    async fn test_write_read_shutdown() {
        let fs = MemFs::new();
        let engine = Engine::<u32, _>::open(fs.clone(), config()).expect("engine should open");

        let (writer, mut written) = engine.writer();
        writer
            .write(WriteRequest::new(1, "hello"))
            .await
            .expect("write should submit");
        let offset = written.recv().await.expect("response should arrive").result;
        assert_eq!(offset.expect("write should succeed"), 0);

        let (reader, mut read) = engine.reader();
        reader
            .read(ReadRequest::new(1, 0, 5))
            .await
            .expect("read should submit");
        let data = read.recv().await.expect("response should arrive").result;
        assert_eq!(data.expect("read should succeed"), Bytes::from("hello"));

        assert_eq!(engine.stats().batches, 2);
        assert!(engine.store().contains(&1));

        drop((writer, reader));
        engine.shutdown().await.expect("shutdown should succeed");
        assert_eq!(fs.sync_count(Path::new("/db/1.kfs")), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_writes() {
        let fs = MemFs::new();
        let engine = Engine::<u32, _>::open(fs.clone(), config()).expect("engine should open");
        let (writer, mut written) = engine.writer();

        for key in 0..8u32 {
            for _ in 0..4 {
                writer
                    .write(WriteRequest::new(key, "abcd"))
                    .await
                    .expect("write should submit");
            }
        }
        drop(writer);
        engine.shutdown().await.expect("shutdown should succeed");

        let mut responses = 0;
        while let Ok(response) = written.try_recv() {
            response.result.expect("write should succeed");
            responses += 1;
        }
        assert_eq!(responses, 32);
        for key in 0..8u32 {
            let path = format!("/db/{key}.kfs");
            assert_eq!(fs.contents(Path::new(&path)).as_ref().map(Vec::len), Some(16));
            assert_eq!(fs.sync_count(Path::new(&path)), 1);
        }
    }

    #[tokio::test]
    async fn test_shutdown_reports_flush_failure() {
        let fs = MemFs::new();
        fs.fail_sync("/db/3.kfs");
        let engine = Engine::<u32, _>::open(fs.clone(), config()).expect("engine should open");

        let (writer, mut written) = engine.writer();
        writer
            .write(WriteRequest::new(3, "x"))
            .await
            .expect("write should submit");
        written.recv().await.expect("response should arrive");
        drop(writer);

        let err = engine.shutdown().await.expect_err("flush failure must surface");
        assert!(matches!(err, StoreError::Flush(ref f) if f.len() == 1 && f[0].key == "3"));
    }

    #[tokio::test]
    async fn test_reporter_receives_periodic_failures() {
        let fs = MemFs::new();
        fs.fail_sync("/db/5.kfs");
        let (reporter, mut failures) = mpsc::channel(4);
        let engine = Engine::<u32, _>::open_with_reporter(
            fs.clone(),
            config().with_sync(Duration::from_millis(10), Duration::ZERO),
            reporter,
        )
        .expect("engine should open");

        let (writer, mut written) = engine.writer();
        writer
            .write(WriteRequest::new(5, "y"))
            .await
            .expect("write should submit");
        written.recv().await.expect("response should arrive");

        let failure = failures.recv().await.expect("failure should be reported");
        assert_eq!(failure.key, "5");

        drop(writer);
        assert!(engine.shutdown().await.is_err());
    }
}
