//! File-level persistence core for a time-series storage engine.
//!
//! Many logical data streams are multiplexed onto a bounded set of shard
//! files, one file per key. The crate is built from three cooperating
//! pieces:
//!
//! - **[`FileStore`]**: keyed file store with per-key exclusive access and
//!   lazy open-or-create of the backing file
//! - **[`SyncDaemon`]**: background task that flushes idle, stale files and
//!   force-flushes everything on shutdown
//! - **[`PersistExecutor`]**: relay plus a fixed worker pool that executes
//!   operation batches, serialized per key and parallel across keys
//!
//! [`Reader`] and [`Writer`] turn single requests into one-operation
//! batches, and [`Engine`] wires all of it together.
//!
//! # Storage Layout
//!
//! One file per key at `<root>/<key><suffix>` (default suffix `.kfs`).
//! The root directory is created on open.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardfile::{Engine, MemFs, ReadRequest, StoreConfig, WriteRequest};
//!
//! # async fn example() -> shardfile::Result<()> {
//! let engine = Engine::<u32, _>::open(MemFs::new(), StoreConfig::new("/db"))?;
//!
//! let (writer, mut written) = engine.writer();
//! writer.write(WriteRequest::new(1, "hello")).await?;
//! let offset = written.recv().await.map(|r| r.result);
//!
//! let (reader, mut read) = engine.reader();
//! reader.read(ReadRequest::new(1, 0, 5)).await?;
//! let data = read.recv().await.map(|r| r.result);
//!
//! drop((writer, reader));
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// Pluggable raw filesystem
pub mod fs;

// Keyed file store
pub mod store;

// Idle and forced sync
pub mod sync;

// Units of work
pub mod operation;

// Worker pool
pub mod executor;

// Reader/Writer adapters
pub mod facade;

// Supervisor
pub mod engine;

// Configuration
pub mod config;

pub use config::StoreConfig;
pub use engine::Engine;
pub use executor::{Batch, ExecutorStats, PersistExecutor};
pub use facade::{Reader, Writer};
pub use fs::{FileStat, FileSystem, FsFile, MemFs, OsFs};
pub use operation::{
    Operation, ReadOperation, ReadRequest, ReadResponse, WriteOperation, WriteRequest,
    WriteResponse,
};
pub use store::{FileEntry, FileGuard, FileStore, Key};
pub use sync::{SyncDaemon, SyncHandle};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in the persistence core.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing file for a key could not be opened or created.
    #[error("Failed to acquire shard file {key}: {reason}")]
    Acquire {
        /// Key whose file could not be opened.
        key: String,
        /// Underlying failure.
        reason: String,
    },

    /// Key does not render to a plain file name.
    #[error("Invalid shard key: {0}")]
    InvalidKey(String),

    /// Batch violates the single-key, non-empty contract.
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Channel endpoint is gone because the executor shut down.
    #[error("Closed: {0}")]
    Closed(String),

    /// Fewer bytes were available than requested.
    #[error("Short read on shard file {key}: wanted {expected} bytes at offset {offset}, got {actual}")]
    ShortRead {
        /// Key that was read.
        key: String,
        /// Requested offset.
        offset: u64,
        /// Requested length.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// One or more files failed to flush during the forced shutdown pass.
    #[error("Failed to flush {} shard file(s) during shutdown", .0.len())]
    Flush(Vec<FlushFailure>),

    /// Background task failed.
    #[error("Concurrent operation failed: {0}")]
    Concurrency(String),
}

impl StoreError {
    /// Copy of this error suitable for handing to every operation of a batch
    /// whose acquisition failed.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Acquire { key, reason } => Self::Acquire {
                key: key.clone(),
                reason: reason.clone(),
            },
            Self::InvalidKey(key) => Self::InvalidKey(key.clone()),
            other => Self::Concurrency(other.to_string()),
        }
    }

    /// True for shutdown signals, which are not I/O failures.
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// A single failed flush of one shard file.
#[derive(Debug, Error)]
#[error("sync of shard file {key} failed: {source}")]
pub struct FlushFailure {
    /// Key of the file that failed to flush.
    pub key: String,
    /// Underlying I/O error.
    #[source]
    pub source: std::io::Error,
}

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default file name suffix for shard files.
pub const DEFAULT_SUFFIX: &str = ".kfs";

/// Default permission bits for the storage root directory.
pub const DEFAULT_DIR_PERMS: u32 = 0o777;

/// Default size of the persist worker pool.
pub const DEFAULT_NUM_WORKERS: usize = 10;
