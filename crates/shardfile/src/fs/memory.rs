//! In-memory filesystem
//!
//! All handles created from clones of one [`MemFs`] share a namespace.
//! Sync calls are counted per path, and syncs or opens can be made to fail
//! for a specific path so flush and acquisition failures are reproducible.

use super::{FileStat, FileSystem, FsFile};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type SharedData = Arc<RwLock<Vec<u8>>>;

#[derive(Debug, Default)]
struct Namespace {
    files: HashMap<PathBuf, SharedData>,
    dirs: HashMap<PathBuf, u32>,
    syncs: HashMap<PathBuf, usize>,
    failing_syncs: HashSet<PathBuf>,
    failing_opens: HashSet<PathBuf>,
}

/// In-memory filesystem.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    inner: Arc<Mutex<Namespace>>,
}

impl MemFs {
    /// Creates an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `sync` calls made on handles for `path`.
    pub fn sync_count(&self, path: &Path) -> usize {
        self.inner.lock().syncs.get(path).copied().unwrap_or(0)
    }

    /// Make every subsequent `sync` for `path` fail.
    pub fn fail_sync(&self, path: impl Into<PathBuf>) {
        self.inner.lock().failing_syncs.insert(path.into());
    }

    /// Make every subsequent `open`/`create` for `path` fail.
    pub fn fail_open(&self, path: impl Into<PathBuf>) {
        self.inner.lock().failing_opens.insert(path.into());
    }

    /// Snapshot of a file's contents.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        let data = self.inner.lock().files.get(path).cloned()?;
        let bytes = data.read().clone();
        Some(bytes)
    }

    /// Whether a file exists at `path`.
    pub fn exists(&self, path: &Path) -> bool {
        self.inner.lock().files.contains_key(path)
    }

    /// Permission bits a directory was created with.
    pub fn dir_perms(&self, path: &Path) -> Option<u32> {
        self.inner.lock().dirs.get(path).copied()
    }

    fn handle(&self, path: &Path, data: SharedData) -> MemFile {
        MemFile {
            path: path.to_path_buf(),
            data,
            pos: 0,
            namespace: Arc::clone(&self.inner),
        }
    }
}

fn open_refused(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("open refused for {}", path.display()),
    )
}

impl FileSystem for MemFs {
    type File = MemFile;

    fn open(&self, path: &Path) -> io::Result<MemFile> {
        let data = {
            let ns = self.inner.lock();
            if ns.failing_opens.contains(path) {
                return Err(open_refused(path));
            }
            ns.files.get(path).cloned().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                )
            })?
        };
        Ok(self.handle(path, data))
    }

    fn create(&self, path: &Path) -> io::Result<MemFile> {
        let data = {
            let mut ns = self.inner.lock();
            if ns.failing_opens.contains(path) {
                return Err(open_refused(path));
            }
            Arc::clone(ns.files.entry(path.to_path_buf()).or_default())
        };
        Ok(self.handle(path, data))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                )
            })
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let data = self.inner.lock().files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )
        })?;
        let len = data.read().len() as u64;
        Ok(FileStat { len })
    }

    fn mkdir_all(&self, path: &Path, perms: u32) -> io::Result<()> {
        let mut ns = self.inner.lock();
        for dir in path.ancestors().filter(|p| !p.as_os_str().is_empty()) {
            ns.dirs.entry(dir.to_path_buf()).or_insert(perms);
        }
        Ok(())
    }
}

/// Handle onto an in-memory file.
#[derive(Debug)]
pub struct MemFile {
    path: PathBuf,
    data: SharedData,
    pos: u64,
    namespace: Arc<Mutex<Namespace>>,
}

impl FsFile for MemFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn sync(&mut self) -> io::Result<()> {
        let mut ns = self.namespace.lock();
        if ns.failing_syncs.contains(&self.path) {
            return Err(io::Error::other(format!(
                "sync failed for {}",
                self.path.display()
            )));
        }
        *ns.syncs.entry(self.path.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.write();
        let start = usize::try_from(self.pos)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.read().len() as u64;
        let next = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let next = next.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        self.pos = next;
        Ok(next)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_then_create() {
        let fs = MemFs::new();
        let path = Path::new("/db/1.kfs");

        let err = fs.open(path).expect_err("missing file should not open");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let mut file = fs.create(path).expect("create should succeed");
        file.write_all(b"abc").expect("write should succeed");
        assert_eq!(fs.contents(path).as_deref(), Some(&b"abc"[..]));

        // A second create shares the same data
        let mut again = fs.create(path).expect("create should succeed");
        assert_eq!(again.seek(SeekFrom::End(0)).expect("seek"), 3);
    }

    #[test]
    fn test_sync_counting_and_failure() {
        let fs = MemFs::new();
        let path = Path::new("/db/2.kfs");
        let mut file = fs.create(path).expect("create should succeed");

        file.sync().expect("sync should succeed");
        file.sync().expect("sync should succeed");
        assert_eq!(fs.sync_count(path), 2);

        fs.fail_sync(path);
        assert!(file.sync().is_err());
        assert_eq!(fs.sync_count(path), 2);
    }

    #[test]
    fn test_read_at_past_end() {
        let fs = MemFs::new();
        let path = Path::new("/db/3.kfs");
        let mut file = fs.create(path).expect("create should succeed");
        file.write_all(b"xy").expect("write should succeed");

        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(&mut buf, 1).expect("read"), 1);
        assert_eq!(buf[0], b'y');
        assert_eq!(file.read_at(&mut buf, 10).expect("read"), 0);
    }

    #[test]
    fn test_mkdir_all_records_ancestors() {
        let fs = MemFs::new();
        fs.mkdir_all(Path::new("/a/b/c"), 0o750).expect("mkdir");
        assert_eq!(fs.dir_perms(Path::new("/a/b/c")), Some(0o750));
        assert_eq!(fs.dir_perms(Path::new("/a")), Some(0o750));
    }

    #[test]
    fn test_remove_and_stat() {
        let fs = MemFs::new();
        let path = Path::new("/db/4.kfs");
        let mut file = fs.create(path).expect("create should succeed");
        file.write_all(b"1234").expect("write should succeed");

        assert_eq!(fs.stat(path).expect("stat").len, 4);
        fs.remove(path).expect("remove should succeed");
        assert!(!fs.exists(path));
        assert!(fs.remove(path).is_err());
    }
}
