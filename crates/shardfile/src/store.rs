//! Keyed file store
//!
//! Maps each key to one open shard file and hands out exclusive access to
//! it. The key map sits behind a coarse lock that is only held for map
//! lookups and mutations, never across I/O or while waiting on an entry.
//! Each entry carries its own async lock; holding a [`FileGuard`] is holding
//! that lock.

use crate::fs::{FileSystem, FsFile, unblock};
use crate::{Result, StoreConfig, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as EntryLock, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Identifier of one shard file.
///
/// The file name is the key's `Display` output followed by the store suffix.
/// That output must be a plain file name component: keys rendering to an
/// empty string, `.`, `..`, or anything containing a path separator are
/// rejected with [`StoreError::InvalidKey`].
pub trait Key: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static {}

struct EntryState<F> {
    file: F,
    last_sync: Instant,
    closed: bool,
}

/// One open shard file and its exclusivity lock.
pub struct FileEntry<K, F> {
    key: K,
    state: Arc<EntryLock<EntryState<F>>>,
}

impl<K: Key, F: FsFile> FileEntry<K, F> {
    fn new(key: K, file: F) -> Self {
        Self {
            key,
            state: Arc::new(EntryLock::new(EntryState {
                file,
                last_sync: Instant::now(),
                closed: false,
            })),
        }
    }

    /// Key this entry belongs to.
    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Wait for exclusive access.
    ///
    /// Returns `None` if the entry was closed or removed while waiting.
    pub async fn lock(self: &Arc<Self>) -> Option<FileGuard<K, F>> {
        let state = Arc::clone(&self.state).lock_owned().await;
        self.live_guard(state)
    }

    /// Take exclusive access only if nobody holds it right now.
    pub fn try_lock(self: &Arc<Self>) -> Option<FileGuard<K, F>> {
        let state = Arc::clone(&self.state).try_lock_owned().ok()?;
        self.live_guard(state)
    }

    fn live_guard(
        self: &Arc<Self>,
        state: OwnedMutexGuard<EntryState<F>>,
    ) -> Option<FileGuard<K, F>> {
        if state.closed {
            return None;
        }
        Some(FileGuard {
            entry: Arc::clone(self),
            state,
        })
    }
}

impl<K: Debug, F> Debug for FileEntry<K, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEntry").field("key", &self.key).finish()
    }
}

/// Exclusive access to one shard file.
///
/// Dropping the guard unlocks the entry; [`FileStore::release`] does the same
/// after checking the guard against the store.
pub struct FileGuard<K, F> {
    entry: Arc<FileEntry<K, F>>,
    state: OwnedMutexGuard<EntryState<F>>,
}

impl<K: Key, F: FsFile> FileGuard<K, F> {
    /// Key of the held file.
    pub fn key(&self) -> &K {
        &self.entry.key
    }

    /// Time since the file was opened or last synced.
    pub fn age(&self) -> Duration {
        self.state.last_sync.elapsed()
    }

    /// Flush the file to stable storage and reset its age.
    ///
    /// # Errors
    ///
    /// Returns the underlying sync error; the age is left untouched.
    pub fn sync(&mut self) -> io::Result<()> {
        self.state.file.sync()?;
        self.state.last_sync = Instant::now();
        Ok(())
    }

    /// The open handle.
    pub fn file(&self) -> &F {
        &self.state.file
    }

    /// The open handle, mutably.
    pub fn file_mut(&mut self) -> &mut F {
        &mut self.state.file
    }
}

impl<K, F> Deref for FileGuard<K, F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.state.file
    }
}

impl<K, F> DerefMut for FileGuard<K, F> {
    fn deref_mut(&mut self) -> &mut F {
        &mut self.state.file
    }
}

impl<K: Debug, F> Debug for FileGuard<K, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileGuard")
            .field("key", &self.entry.key)
            .finish_non_exhaustive()
    }
}

type SharedEntry<K, FS> = Arc<FileEntry<K, <FS as FileSystem>::File>>;

/// Guard type handed out by a [`FileStore`] over filesystem `FS`.
pub type StoreGuard<K, FS> = FileGuard<K, <FS as FileSystem>::File>;

/// Keyed file store with per-key mutual exclusion.
pub struct FileStore<K: Key, FS: FileSystem> {
    fs: FS,
    root: PathBuf,
    suffix: String,
    entries: Mutex<HashMap<K, SharedEntry<K, FS>>>,
}

impl<K: Key, FS: FileSystem> FileStore<K, FS> {
    /// Open a store rooted at `config.root`, creating the directory with
    /// `config.dir_perms` if needed.
    ///
    /// # Errors
    ///
    /// Returns error if the root directory cannot be created
    pub fn open(fs: FS, config: &StoreConfig) -> Result<Self> {
        fs.mkdir_all(&config.root, config.dir_perms).map_err(|e| {
            StoreError::Config(format!(
                "Failed to create store directory {}: {e}",
                config.root.display()
            ))
        })?;

        info!(
            "Opened shard file store at {} (suffix {})",
            config.root.display(),
            config.suffix
        );

        Ok(Self {
            fs,
            root: config.root.clone(),
            suffix: config.suffix.clone(),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Get exclusive access to the file for `key`, opening or creating it on
    /// first use.
    ///
    /// Blocks only on this key's lock; other keys are never serialized behind
    /// a busy one.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Acquire` if the backing file cannot be opened or
    /// created. Nothing is inserted in that case, so there is nothing to
    /// release.
    pub async fn acquire(&self, key: K) -> Result<StoreGuard<K, FS>> {
        loop {
            let existing = self.entries.lock().get(&key).cloned();

            let entry = match existing {
                Some(entry) => entry,
                None => {
                    let file = self.open_or_create(&key).await?;
                    let fresh = Arc::new(FileEntry::new(key.clone(), file));
                    let Some(guard) = fresh.try_lock() else {
                        continue;
                    };

                    let raced = {
                        let mut entries = self.entries.lock();
                        match entries.get(&key) {
                            Some(other) => Some(Arc::clone(other)),
                            None => {
                                entries.insert(key.clone(), Arc::clone(&fresh));
                                None
                            }
                        }
                    };

                    match raced {
                        // Another task opened the same key first; use its entry
                        Some(other) => other,
                        None => {
                            debug!(key = %key, "Created shard file entry");
                            return Ok(guard);
                        }
                    }
                }
            };

            if let Some(guard) = entry.lock().await {
                return Ok(guard);
            }
            // Entry was closed while we waited; look the key up again
        }
    }

    /// Get exclusive access to an already open key without waiting.
    ///
    /// Returns `None` if the key is unknown or currently held.
    pub fn try_acquire(&self, key: &K) -> Option<StoreGuard<K, FS>> {
        let entry = self.entries.lock().get(key).cloned()?;
        entry.try_lock()
    }

    /// Give up exclusive access obtained from [`Self::acquire`].
    ///
    /// # Panics
    ///
    /// Panics if the guard's key is not a live entry of this store. That can
    /// only happen when a guard is released into the wrong store, which is
    /// always a caller bug.
    #[allow(clippy::panic)]
    pub fn release(&self, guard: StoreGuard<K, FS>) {
        let known = self
            .entries
            .lock()
            .get(guard.key())
            .is_some_and(|entry| Arc::ptr_eq(entry, &guard.entry));

        if !known {
            panic!("release of unknown shard key {}", guard.key());
        }
        drop(guard);
    }

    /// Delete the file for `key` once no one else is using it.
    ///
    /// The backing file is gone before the key leaves the map, so a
    /// concurrent `acquire` either waits for the removal or starts a fresh
    /// file afterwards.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be acquired or deleted
    pub async fn remove(&self, key: K) -> Result<()> {
        let mut guard = self.acquire(key.clone()).await?;
        let entry = Arc::clone(&guard.entry);
        guard.state.closed = true;

        let fs = self.fs.clone();
        let path = self.path_for(&key);
        let outcome = unblock(move || {
            if let Err(e) = guard.state.file.close() {
                warn!(key = %guard.key(), "Failed to close shard file before removal: {e}");
            }
            let removed = fs.remove(&path);
            (guard, removed)
        })
        .await;

        // Waiters wake only once the guard drops, after the entry is forgotten
        self.forget(&entry);
        let (guard, removed) = outcome?;
        drop(guard);

        removed?;
        debug!(key = %key, "Removed shard file");
        Ok(())
    }

    /// Close the file for `key` and drop its entry.
    ///
    /// Closing an unknown key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the close error of the underlying handle
    pub async fn close(&self, key: &K) -> Result<()> {
        let Some(entry) = self.entries.lock().get(key).cloned() else {
            return Ok(());
        };
        let Some(mut guard) = entry.lock().await else {
            return Ok(());
        };
        guard.state.closed = true;

        let outcome = unblock(move || {
            let closed = guard.state.file.close();
            (guard, closed)
        })
        .await;

        self.forget(&entry);
        let (guard, closed) = outcome?;
        drop(guard);

        debug!(key = %key, "Closed shard file");
        closed.map_err(StoreError::from)
    }

    /// Close and remove every known file, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first close or remove error encountered
    pub async fn remove_all(&self) -> Result<()> {
        let keys: Vec<K> = self.entries.lock().keys().cloned().collect();
        for key in keys {
            self.close(&key).await?;
            self.remove(key).await?;
        }
        Ok(())
    }

    /// Snapshot of the open entries, safe to iterate while the store changes.
    pub fn open_files(&self) -> HashMap<K, SharedEntry<K, FS>> {
        self.entries.lock().clone()
    }

    /// Path of the file backing `key`.
    ///
    /// Does not check the key; see [`Key`] for what `acquire` accepts.
    pub fn path_for(&self, key: &K) -> PathBuf {
        self.root.join(format!("{key}{}", self.suffix))
    }

    /// Size in bytes of the file backing `key`.
    ///
    /// # Errors
    ///
    /// Returns error if the file does not exist or cannot be stat'ed
    pub fn disk_len(&self, key: &K) -> Result<u64> {
        check_key(key)?;
        Ok(self.fs.stat(&self.path_for(key))?.len)
    }

    /// Whether `key` has an open entry.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of open entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no entries are open.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name suffix.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The underlying filesystem.
    pub const fn filesystem(&self) -> &FS {
        &self.fs
    }

    async fn open_or_create(&self, key: &K) -> Result<FS::File> {
        check_key(key)?;

        let fs = self.fs.clone();
        let path = self.path_for(key);
        let opened = unblock(move || match fs.open(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs.create(&path),
            other => other,
        })
        .await
        .and_then(|opened| opened);

        opened.map_err(|e| StoreError::Acquire {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Drop `entry` from the map if it is still the live entry for its key.
    fn forget(&self, entry: &SharedEntry<K, FS>) {
        let mut entries = self.entries.lock();
        if entries
            .get(&entry.key)
            .is_some_and(|live| Arc::ptr_eq(live, entry))
        {
            entries.remove(&entry.key);
        }
    }
}

fn check_key<K: Key>(key: &K) -> Result<()> {
    let name = key.to_string();
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);

    if plain {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(format!("{name:?} is not a plain file name")))
    }
}

impl<K: Key, FS: FileSystem> Debug for FileStore<K, FS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("root", &self.root)
            .field("suffix", &self.suffix)
            .field("open", &self.len())
            .finish_non_exhaustive()
    }
}
