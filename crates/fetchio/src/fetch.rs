//! Range-capable, checksum-verified transfer of one task.
//!
//! The transfer context bundles the destination sink, the optional rolling
//! hasher, and the progress delta callback into one value the transport's
//! body handler drives. Whole-file tasks starting at byte 0 with a known
//! hash are verified before they count as complete; chunks and resumed
//! transfers complete on transport success alone.

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{FetchError, Result};
use crate::planner::DownloadTask;
use crate::sink::FileSink;
use crate::target::{HeaderSet, RequestTarget};
use crate::transport::ProtocolClient;

/// Everything one in-flight transfer mutates, updated in lockstep by the
/// body handler. Small transport frames coalesce in a write buffer so the
/// sink sees buffer-sized positional writes.
struct TransferContext<'a> {
    sink: &'a FileSink,
    task: &'a DownloadTask,
    hasher: Option<Sha256>,
    buffer: Vec<u8>,
    buffer_cap: usize,
    /// Bytes already flushed to the sink this attempt.
    flushed: u64,
    on_delta: &'a (dyn Fn(u64) + Send + Sync),
    cancel: &'a CancellationToken,
}

impl<'a> TransferContext<'a> {
    fn new(
        sink: &'a FileSink,
        task: &'a DownloadTask,
        buffer_cap: usize,
        on_delta: &'a (dyn Fn(u64) + Send + Sync),
        cancel: &'a CancellationToken,
    ) -> Self {
        // Verification only works when the digest covers the file from its
        // first byte: whole-file task, nothing to resume.
        let hasher = (!task.expected_hash.is_empty()
            && task.range.is_none()
            && task.resume_offset == 0)
            .then(Sha256::new);
        Self {
            sink,
            task,
            hasher,
            buffer: Vec::with_capacity(buffer_cap.min(4 * 1024 * 1024)),
            buffer_cap: buffer_cap.max(1),
            flushed: 0,
            on_delta,
            cancel,
        }
    }

    fn accept(&mut self, chunk: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() >= self.buffer_cap {
            self.flush()?;
        }
        (self.on_delta)(chunk.len() as u64);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let offset = self.task.destination_offset + self.task.resume_offset + self.flushed;
        self.sink.write_at(&self.buffer, offset)?;
        self.flushed += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    fn finalize(mut self) -> Result<u64> {
        self.flush()?;
        if let Some(hasher) = self.hasher.take() {
            let actual = hex::encode(hasher.finalize());
            if actual != self.task.expected_hash {
                // The wrong bytes stay on disk; the caller decides whether
                // to delete and refetch.
                return Err(FetchError::ChecksumMismatch {
                    path: self.task.destination_path.clone(),
                    expected: self.task.expected_hash.clone(),
                    actual,
                });
            }
            debug!(path = %self.task.entry_path, "checksum verified");
        }
        Ok(self.flushed)
    }
}

/// Run one task to completion. Returns the number of bytes transferred.
///
/// On a connection-level failure of the preferred protocol the selector has
/// already demoted the host; one fresh attempt re-dispatches on the
/// fallback stack with a reset context (partial bytes are simply
/// overwritten in place). All other errors surface to the pool.
pub async fn execute_task(
    client: &ProtocolClient,
    task: &DownloadTask,
    sink: &FileSink,
    buffer_size: usize,
    on_delta: &(dyn Fn(u64) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<u64> {
    if cancel.is_cancelled() {
        return Err(FetchError::Cancelled);
    }

    let target = RequestTarget::parse(&task.source_url)?;
    let mut extra_headers = HeaderSet::new();
    if let Some((start, end)) = task.range {
        extra_headers.set("Range", format!("bytes={start}-{end}"));
    }

    let mut fell_back = false;
    loop {
        let mut context = TransferContext::new(sink, task, buffer_size, on_delta, cancel);
        let mut handler = |chunk: &[u8]| context.accept(chunk);

        let result = client
            .download_once(&target, &extra_headers, task.resume_offset, &mut handler)
            .await;
        drop(handler);

        match result {
            Ok(envelope) => {
                if !envelope.is_success() {
                    return Err(FetchError::http_status(
                        envelope.status,
                        task.source_url.clone(),
                        "download",
                    ));
                }
                if task.is_chunk() && envelope.status != 206 {
                    return Err(FetchError::protocol(format!(
                        "expected 206 for chunk request, got {} from {}",
                        envelope.status, task.source_url
                    )));
                }
                return context.finalize();
            }
            Err(e)
                if e.triggers_fallback()
                    && !fell_back
                    && client.profile().override_protocol().is_none() =>
            {
                // Bytes already handed to the context remain on disk; the
                // retry rewrites the same region from its start.
                warn!(
                    path = %task.entry_path,
                    error = %e,
                    "preferred protocol failed, retrying on fallback stack"
                );
                fell_back = true;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(expected_hash: &str, range: Option<(u64, u64)>, resume: u64) -> DownloadTask {
        DownloadTask {
            source_url: "https://host/f".to_owned(),
            destination_path: "f".into(),
            destination_offset: range.map_or(0, |(s, _)| s),
            range,
            expected_hash: expected_hash.to_owned(),
            resume_offset: resume,
            declared_bytes: 11,
            entry_path: "f".to_owned(),
            file_size: 11,
        }
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    const BUF: usize = 8 * 1024;

    #[test]
    fn context_hashes_only_whole_file_from_zero() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::open(dir.path().join("f"), 11).unwrap();
        let noop = |_: u64| {};
        let cancel = CancellationToken::new();

        let t = task(&sha256_hex(b"hello world"), None, 0);
        assert!(TransferContext::new(&sink, &t, BUF, &noop, &cancel).hasher.is_some());

        let t = task(&sha256_hex(b"hello world"), Some((0, 10)), 0);
        assert!(TransferContext::new(&sink, &t, BUF, &noop, &cancel).hasher.is_none());

        let t = task(&sha256_hex(b"hello world"), None, 5);
        assert!(TransferContext::new(&sink, &t, BUF, &noop, &cancel).hasher.is_none());

        let t = task("", None, 0);
        assert!(TransferContext::new(&sink, &t, BUF, &noop, &cancel).hasher.is_none());
    }

    #[test]
    fn matching_checksum_passes_and_mismatch_preserves_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let sink = FileSink::open(&path, 11).unwrap();
        let noop = |_: u64| {};
        let cancel = CancellationToken::new();

        let good = task(&sha256_hex(b"hello world"), None, 0);
        let mut ctx = TransferContext::new(&sink, &good, BUF, &noop, &cancel);
        ctx.accept(b"hello ").unwrap();
        ctx.accept(b"world").unwrap();
        assert_eq!(ctx.finalize().unwrap(), 11);

        // One flipped byte: mismatch reported, wrong bytes left on disk.
        let bad = task(&sha256_hex(b"hello world"), None, 0);
        let mut ctx = TransferContext::new(&sink, &bad, BUF, &noop, &cancel);
        ctx.accept(b"hello_world").unwrap();
        let err = ctx.finalize().unwrap_err();
        assert!(matches!(err, FetchError::ChecksumMismatch { .. }));
        sink.sync().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello_world");
    }

    #[test]
    fn accept_writes_at_compound_offset_and_reports_deltas() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        let sink = FileSink::open(&path, 32).unwrap();
        let delta_total = AtomicU64::new(0);
        let on_delta = |n: u64| {
            delta_total.fetch_add(n, Ordering::Relaxed);
        };
        let cancel = CancellationToken::new();

        // A 4-byte buffer forces a flush mid-transfer; the tail flushes at
        // finalize.
        let mut chunk_task = task("", Some((16, 23)), 0);
        chunk_task.declared_bytes = 8;
        let mut ctx = TransferContext::new(&sink, &chunk_task, 4, &on_delta, &cancel);
        ctx.accept(b"abcd").unwrap();
        ctx.accept(b"ef").unwrap();
        ctx.accept(b"gh").unwrap();
        assert_eq!(ctx.finalize().unwrap(), 8);
        assert_eq!(delta_total.load(Ordering::Relaxed), 8);

        sink.sync().unwrap();
        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content[16..24], b"abcdefgh");
    }

    #[test]
    fn cancelled_context_rejects_bytes() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::open(dir.path().join("f"), 4).unwrap();
        let noop = |_: u64| {};
        let cancel = CancellationToken::new();
        cancel.cancel();

        let t = task("", None, 0);
        let mut ctx = TransferContext::new(&sink, &t, BUF, &noop, &cancel);
        assert!(matches!(
            ctx.accept(b"data"),
            Err(FetchError::Cancelled)
        ));
    }
}
