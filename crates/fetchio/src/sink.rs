use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::error::{FetchError, Result};

/// Write-at-offset sink over one destination file.
///
/// Opening pre-allocates the declared size and truncates the file to that
/// length, so ranged chunk workers can write their disjoint intervals in any
/// order. Exactly one sink exists per destination; all chunk workers for a
/// file share it. Positional writes take `&self`: the planner guarantees
/// writers never overlap, and the OS orders disjoint `pwrite`s freely.
#[derive(Debug)]
pub struct FileSink {
    file: File,
    path: PathBuf,
    declared_size: u64,
    dirty: AtomicBool,
}

impl FileSink {
    /// Open (or create) `path` for positional writing.
    ///
    /// Parent directories are created. When `declared_size > 0` the file is
    /// sized to exactly that many bytes; existing content within the new
    /// length is preserved so a later resume can keep prior bytes.
    pub fn open(path: impl Into<PathBuf>, declared_size: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| FetchError::file_write(&path, format!("create dirs: {e}")))?;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| FetchError::file_write(&path, format!("open: {e}")))?;

        if declared_size > 0 {
            file.set_len(declared_size)
                .map_err(|e| FetchError::file_write(&path, format!("pre-allocate: {e}")))?;
        }

        debug!(path = %path.display(), size = declared_size, "opened destination sink");

        Ok(Self {
            file,
            path,
            declared_size,
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    /// Place `buf` at byte `offset`. Retries short writes until the whole
    /// buffer is on its way to the page cache.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut written = 0usize;
        while written < buf.len() {
            let n = positional_write(&self.file, &buf[written..], offset + written as u64)
                .map_err(|e| FetchError::file_write(&self.path, e))?;
            if n == 0 {
                return Err(FetchError::file_write(&self.path, "zero-length write"));
            }
            written += n;
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Block until every accepted `write_at` is on stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| FetchError::file_write(&self.path, format!("sync: {e}")))?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Release the handle. Syncs first unless the owning operation was
    /// cancelled before any byte landed.
    pub fn close(self, cancelled: bool) -> Result<()> {
        if cancelled && !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        self.sync()
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // Close-implies-sync safety net for paths that bypass `close`.
        if self.dirty.load(Ordering::Acquire) {
            if let Err(e) = self.file.sync_data() {
                warn!(path = %self.path.display(), error = %e, "sync on drop failed");
            }
        }
    }
}

#[cfg(unix)]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn open_preallocates_and_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/model.bin");
        let sink = FileSink::open(&path, 4096).unwrap();
        drop(sink);
        assert_eq!(fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn write_at_places_bytes_at_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let sink = FileSink::open(&path, 16).unwrap();
        sink.write_at(b"zzzz", 8).unwrap();
        sink.write_at(b"aaaa", 0).unwrap();
        sink.close(false).unwrap();

        let content = fs::read(&path).unwrap();
        assert_eq!(&content[0..4], b"aaaa");
        assert_eq!(&content[8..12], b"zzzz");
        assert_eq!(content.len(), 16);
    }

    #[test]
    fn existing_prefix_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.bin");
        {
            let sink = FileSink::open(&path, 8).unwrap();
            sink.write_at(b"keepme", 0).unwrap();
            sink.close(false).unwrap();
        }
        // Re-open as a resume would: declared size unchanged, old bytes intact.
        let sink = FileSink::open(&path, 8).unwrap();
        drop(sink);
        let content = fs::read(&path).unwrap();
        assert_eq!(&content[0..6], b"keepme");
        assert_eq!(content.len(), 8);
    }

    #[test]
    fn zero_declared_size_opens_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.bin");
        let sink = FileSink::open(&path, 0).unwrap();
        sink.close(false).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn concurrent_disjoint_writes_match_sequential() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chunks.bin");
        const CHUNK: usize = 64 * 1024;
        const CHUNKS: usize = 8;

        let sink = Arc::new(FileSink::open(&path, (CHUNK * CHUNKS) as u64).unwrap());
        let handles: Vec<_> = (0..CHUNKS)
            .map(|i| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    let payload = vec![i as u8; CHUNK];
                    sink.write_at(&payload, (i * CHUNK) as u64).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        sink.sync().unwrap();

        let content = fs::read(&path).unwrap();
        for (i, chunk) in content.chunks(CHUNK).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8), "chunk {i} corrupted");
        }
    }
}
