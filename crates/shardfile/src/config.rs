//! Configuration for the persistence core

use crate::{DEFAULT_DIR_PERMS, DEFAULT_NUM_WORKERS, DEFAULT_SUFFIX, Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the file store, sync daemon and persist executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding one file per key
    pub root: PathBuf,

    /// File name suffix appended to each key
    pub suffix: String,

    /// Permission bits for the root directory
    pub dir_perms: u32,

    /// Number of persist workers
    pub num_workers: usize,

    /// How often the sync daemon scans open files
    pub sync_interval: Duration,

    /// Minimum time since the last sync before an idle file is flushed
    pub sync_max_age: Duration,

    /// Capacity of the upstream batch channel created by [`crate::Engine`]
    pub input_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            suffix: DEFAULT_SUFFIX.to_string(),
            dir_perms: DEFAULT_DIR_PERMS,
            num_workers: DEFAULT_NUM_WORKERS,
            sync_interval: Duration::from_secs(1),
            sync_max_age: Duration::from_secs(1),
            input_capacity: 64,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with the specified root directory
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Set the file name suffix
    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Set the root directory permission bits
    #[must_use]
    pub const fn with_dir_perms(mut self, perms: u32) -> Self {
        self.dir_perms = perms;
        self
    }

    /// Set the worker pool size
    #[must_use]
    pub const fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set the sync scan interval and the idle age that triggers a flush
    #[must_use]
    pub const fn with_sync(mut self, interval: Duration, max_age: Duration) -> Self {
        self.sync_interval = interval;
        self.sync_max_age = max_age;
        self
    }

    /// Set the upstream batch channel capacity
    #[must_use]
    pub const fn with_input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity;
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(StoreError::Config(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.sync_interval.is_zero() {
            return Err(StoreError::Config(
                "sync_interval must be greater than 0".to_string(),
            ));
        }

        if self.input_capacity == 0 {
            return Err(StoreError::Config(
                "input_capacity must be greater than 0".to_string(),
            ));
        }

        if self.suffix.contains(std::path::MAIN_SEPARATOR) {
            return Err(StoreError::Config(format!(
                "suffix must not contain a path separator: {}",
                self.suffix
            )));
        }

        Ok(())
    }
}
