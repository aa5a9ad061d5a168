//! `std::fs` backed filesystem

use super::{FileStat, FileSystem, FsFile};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Filesystem backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl OsFs {
    /// Creates the OS filesystem handle.
    pub const fn new() -> Self {
        Self
    }
}

/// Open OS file.
#[derive(Debug)]
pub struct OsFile {
    file: File,
}

impl FileSystem for OsFs {
    type File = OsFile;

    fn open(&self, path: &Path) -> io::Result<OsFile> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(OsFile { file })
    }

    fn create(&self, path: &Path) -> io::Result<OsFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(OsFile { file })
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = fs::metadata(path)?;
        Ok(FileStat {
            len: metadata.len(),
        })
    }

    #[cfg(unix)]
    fn mkdir_all(&self, path: &Path, perms: u32) -> io::Result<()> {
        use std::os::unix::fs::DirBuilderExt;

        fs::DirBuilder::new()
            .recursive(true)
            .mode(perms)
            .create(path)
    }

    #[cfg(not(unix))]
    fn mkdir_all(&self, path: &Path, _perms: u32) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}

impl FsFile for OsFile {
    #[cfg(unix)]
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;

        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;

        self.file.seek_read(buf, offset)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let cursor = self.file.stream_position()?;
        self.file.seek(SeekFrom::Start(offset))?;
        let n = self.file.read(buf);
        self.file.seek(SeekFrom::Start(cursor))?;
        n
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for OsFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for OsFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_missing_is_not_found() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let err = OsFs
            .open(&temp_dir.path().join("missing.kfs"))
            .expect_err("open of a missing file should fail");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_create_does_not_truncate() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("1.kfs");

        let mut file = OsFs.create(&path).expect("Failed to create file");
        file.write_all(b"hello").expect("Failed to write");
        file.sync().expect("Failed to sync");
        drop(file);

        let mut again = OsFs.create(&path).expect("Failed to reopen file");
        let mut buf = [0u8; 5];
        let n = again.read_at(&mut buf, 0).expect("Failed to read");
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(OsFs.stat(&path).expect("Failed to stat").len, 5);
    }

    #[cfg(unix)]
    #[test]
    fn test_mkdir_all_applies_perms() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("a").join("b");
        OsFs.mkdir_all(&dir, 0o700).expect("Failed to create dirs");

        let mode = fs::metadata(&dir)
            .expect("Failed to stat dir")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
