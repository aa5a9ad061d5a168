//! Pluggable raw filesystem
//!
//! The store never touches `std::fs` directly. Everything goes through a
//! [`FileSystem`] implementation so the same code runs against the real
//! disk ([`OsFs`]) or an in-process namespace ([`MemFs`]).

mod memory;
mod os;

pub use memory::{MemFile, MemFs};
pub use os::{OsFile, OsFs};

use std::io::{self, Read, Seek, Write};
use std::path::Path;

/// Handle to an open file.
pub trait FsFile: Read + Write + Seek + Send + 'static {
    /// Read into `buf` starting at `offset` without relying on the cursor.
    ///
    /// May return fewer bytes than requested; `Ok(0)` means end of file.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Flush data and metadata to stable storage.
    fn sync(&mut self) -> io::Result<()>;

    /// Flush buffered state ahead of the handle being dropped.
    fn close(&mut self) -> io::Result<()>;
}

/// Metadata returned by [`FileSystem::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File length in bytes
    pub len: u64,
}

/// Raw filesystem capability consumed by [`crate::FileStore`].
///
/// Calls block. The store clones the filesystem into Tokio's blocking pool
/// for opens, closes and removals, so clones must share one namespace.
pub trait FileSystem: Clone + Send + Sync + 'static {
    /// Handle type produced by `open` and `create`.
    type File: FsFile;

    /// Open an existing file for reading and writing.
    ///
    /// Fails with [`io::ErrorKind::NotFound`] if the file does not exist.
    fn open(&self, path: &Path) -> io::Result<Self::File>;

    /// Create the file if it is missing and open it for reading and writing.
    ///
    /// An existing file is opened as-is and never truncated.
    fn create(&self, path: &Path) -> io::Result<Self::File>;

    /// Delete a file.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Stat a file.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Create a directory and all of its parents with the given permission bits.
    fn mkdir_all(&self, path: &Path, perms: u32) -> io::Result<()>;
}

/// Run blocking file work on Tokio's blocking pool.
///
/// A panic inside `work` comes back as an [`io::Error`].
pub(crate) async fn unblock<T, W>(work: W) -> io::Result<T>
where
    W: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(io::Error::other)
}
