//! Turns a tree listing into a queue of download tasks.
//!
//! Files already on disk at the right size are skipped. Large files are
//! split into fixed-size ranged chunks writing into disjoint intervals of
//! one pre-allocated destination; everything else becomes a single
//! whole-file task that resumes from the existing length. Tasks go out
//! largest-first so the longest transfers start while the queue is deep;
//! LPT keeps the tail of the run busy without work stealing.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::listing::Listing;

/// Unit of work scheduled onto the worker pool.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub source_url: String,
    pub destination_path: PathBuf,
    /// Where the first received byte lands in the destination file.
    pub destination_offset: u64,
    /// Closed byte interval requested via `Range`; `None` for whole files.
    /// For a chunk, `destination_offset == range.0`.
    pub range: Option<(u64, u64)>,
    /// Whole-file SHA-256 hex; empty for chunks and unhashed files.
    pub expected_hash: String,
    /// Bytes already present at `destination_offset`. Always 0 for chunks:
    /// failed chunks are rescheduled, not resumed.
    pub resume_offset: u64,
    /// Bytes this task is expected to transfer.
    pub declared_bytes: u64,
    /// Listing-relative path, for progress display.
    pub entry_path: String,
    /// Declared size of the whole destination file.
    pub file_size: u64,
}

impl DownloadTask {
    pub fn is_chunk(&self) -> bool {
        self.range.is_some()
    }
}

/// The planned work for one repository download.
#[derive(Debug, Default)]
pub struct DownloadPlan {
    pub tasks: VecDeque<DownloadTask>,
    /// Bytes satisfied before any network traffic: complete files plus the
    /// resumable prefixes of partial ones.
    pub already_done: u64,
    /// Bytes the network still owes us.
    pub bytes_to_download: u64,
    /// Sum of all entry sizes.
    pub total_bytes: u64,
    pub files_skipped: usize,
}

impl DownloadPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Build the task queue for `listing` against `destination`.
///
/// `file_url` maps a listing path to its resolve URL. Fails early when the
/// destination filesystem cannot hold the remaining bytes.
pub fn plan(
    config: &FetchConfig,
    listing: &Listing,
    destination: &Path,
    file_url: impl Fn(&str) -> String,
) -> Result<DownloadPlan> {
    let mut plan = DownloadPlan::default();
    let mut tasks: Vec<DownloadTask> = Vec::new();

    for entry in &listing.entries {
        plan.total_bytes += entry.size;
        let local_path = destination.join(&entry.path);
        let existing_size = std::fs::metadata(&local_path).ok().map(|m| m.len());

        if existing_size == Some(entry.size) {
            plan.already_done += entry.size;
            plan.files_skipped += 1;
            debug!(path = %entry.path, size = entry.size, "already complete, skipping");
            continue;
        }

        let url = file_url(&entry.path);

        if entry.size > config.chunk_threshold {
            let chunks = entry.size.div_ceil(config.chunk_size);
            for i in 0..chunks {
                let start = i * config.chunk_size;
                let end = ((i + 1) * config.chunk_size).min(entry.size) - 1;
                tasks.push(DownloadTask {
                    source_url: url.clone(),
                    destination_path: local_path.clone(),
                    destination_offset: start,
                    range: Some((start, end)),
                    expected_hash: String::new(),
                    resume_offset: 0,
                    declared_bytes: end - start + 1,
                    entry_path: entry.path.clone(),
                    file_size: entry.size,
                });
            }
            plan.bytes_to_download += entry.size;
        } else {
            // A shorter-than-declared file resumes from its current length;
            // anything else (including an overlong file, which pre-allocation
            // truncates) restarts from zero.
            let resume_offset = match existing_size {
                Some(len) if len < entry.size => len,
                _ => 0,
            };
            plan.already_done += resume_offset;
            plan.bytes_to_download += entry.size - resume_offset;
            tasks.push(DownloadTask {
                source_url: url,
                destination_path: local_path,
                destination_offset: 0,
                range: None,
                expected_hash: if resume_offset == 0 {
                    entry.content_hash.clone()
                } else {
                    // A resumed transfer cannot be verified against the
                    // whole-file digest in one pass.
                    String::new()
                },
                resume_offset,
                declared_bytes: entry.size - resume_offset,
                entry_path: entry.path.clone(),
                file_size: entry.size,
            });
        }
    }

    check_free_space(destination, plan.bytes_to_download)?;

    tasks.sort_by(|a, b| b.declared_bytes.cmp(&a.declared_bytes));
    plan.tasks = tasks.into();

    info!(
        tasks = plan.tasks.len(),
        skipped = plan.files_skipped,
        to_download = plan.bytes_to_download,
        already_done = plan.already_done,
        "download plan ready"
    );
    Ok(plan)
}

fn check_free_space(destination: &Path, needed: u64) -> Result<()> {
    if needed == 0 {
        return Ok(());
    }
    // The destination may not exist yet; probe the closest existing ancestor.
    let mut probe = destination.to_path_buf();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => probe = parent.to_path_buf(),
            _ => return Ok(()),
        }
    }
    match fs2::available_space(&probe) {
        Ok(available) if available < needed => {
            Err(FetchError::InsufficientSpace { needed, available })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::listing::RepoEntry;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn listing(entries: Vec<RepoEntry>) -> Listing {
        Listing {
            repository_id: "org/model".to_owned(),
            entries,
        }
    }

    fn entry(path: &str, size: u64) -> RepoEntry {
        RepoEntry {
            path: path.to_owned(),
            size,
            content_hash: String::new(),
        }
    }

    fn make_plan(listing: &Listing, dest: &Path) -> DownloadPlan {
        plan(&FetchConfig::default(), listing, dest, |p| {
            format!("https://host/repo/resolve/main/{p}")
        })
        .unwrap()
    }

    #[test]
    fn splits_large_files_and_sorts_largest_first() {
        let dir = TempDir::new().unwrap();
        let listing = listing(vec![
            entry("tiny.txt", 10),
            entry("model.bin", 400 * MIB),
            entry("tokenizer.json", 2 * MIB),
        ]);
        let plan = make_plan(&listing, dir.path());

        // 400 MiB → four 100 MiB chunks, then 2 MiB, then 10 bytes.
        assert_eq!(plan.tasks.len(), 6);
        let sizes: Vec<u64> = plan.tasks.iter().map(|t| t.declared_bytes).collect();
        assert_eq!(
            sizes,
            vec![100 * MIB, 100 * MIB, 100 * MIB, 100 * MIB, 2 * MIB, 10]
        );

        for task in plan.tasks.iter().take(4) {
            let (start, end) = task.range.unwrap();
            assert_eq!(task.destination_offset, start);
            assert_eq!(end - start + 1, 100 * MIB);
            assert_eq!(task.resume_offset, 0);
            assert!(task.expected_hash.is_empty());
            // Chunks must tile the file without gaps.
            assert_eq!(start % (100 * MIB), 0);
        }
        assert_eq!(plan.bytes_to_download, 402 * MIB + 10);
    }

    #[test]
    fn threshold_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let at = listing(vec![entry("at.bin", 250 * MIB)]);
        let plan_at = make_plan(&at, dir.path());
        assert_eq!(plan_at.tasks.len(), 1);
        assert!(plan_at.tasks[0].range.is_none());

        let over = listing(vec![entry("over.bin", 250 * MIB + 1)]);
        let plan_over = make_plan(&over, dir.path());
        assert_eq!(plan_over.tasks.len(), 3);
        assert!(plan_over.tasks.iter().all(|t| t.range.is_some()));
        let last = plan_over.tasks.iter().min_by_key(|t| t.declared_bytes).unwrap();
        assert_eq!(last.declared_bytes, 50 * MIB + 1);
        assert_eq!(last.range.unwrap().1, 250 * MIB);
    }

    #[test]
    fn complete_files_are_skipped_and_counted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("done.bin"), vec![0u8; 128]).unwrap();
        let listing = listing(vec![entry("done.bin", 128), entry("todo.bin", 64)]);
        let plan = make_plan(&listing, dir.path());

        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].entry_path, "todo.bin");
        assert_eq!(plan.already_done, 128);
        assert_eq!(plan.bytes_to_download, 64);
        assert_eq!(plan.files_skipped, 1);
    }

    #[test]
    fn rerun_over_complete_mirror_is_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![1u8; 10]).unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.bin"), vec![2u8; 20]).unwrap();
        let listing = listing(vec![entry("a.bin", 10), entry("sub/b.bin", 20)]);
        let plan = make_plan(&listing, dir.path());

        assert!(plan.is_empty());
        assert_eq!(plan.already_done, 30);
        assert_eq!(plan.bytes_to_download, 0);
    }

    #[test]
    fn partial_file_resumes_without_hash() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("part.bin"), vec![0u8; 40]).unwrap();
        let mut l = listing(vec![entry("part.bin", 100)]);
        l.entries[0].content_hash = "ab".repeat(32);
        let plan = make_plan(&l, dir.path());

        let task = &plan.tasks[0];
        assert_eq!(task.resume_offset, 40);
        assert_eq!(task.declared_bytes, 60);
        assert_eq!(task.destination_offset, 0);
        // Resumed transfers cannot be hash-verified in one pass.
        assert!(task.expected_hash.is_empty());
        assert_eq!(plan.already_done, 40);
        assert_eq!(plan.bytes_to_download, 60);
    }

    #[test]
    fn fresh_file_keeps_expected_hash() {
        let dir = TempDir::new().unwrap();
        let mut l = listing(vec![entry("fresh.bin", 100)]);
        l.entries[0].content_hash = "cd".repeat(32);
        let plan = make_plan(&l, dir.path());
        assert_eq!(plan.tasks[0].expected_hash, "cd".repeat(32));
        assert_eq!(plan.tasks[0].resume_offset, 0);
    }

    #[test]
    fn zero_byte_file_gets_a_whole_file_task() {
        let dir = TempDir::new().unwrap();
        let plan = make_plan(&listing(vec![entry("empty", 0)]), dir.path());
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].resume_offset, 0);
        assert_eq!(plan.tasks[0].declared_bytes, 0);
        assert!(plan.tasks[0].range.is_none());
    }

    #[test]
    fn overlong_local_file_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("grew.bin"), vec![0u8; 200]).unwrap();
        let plan = make_plan(&listing(vec![entry("grew.bin", 100)]), dir.path());
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].resume_offset, 0);
        assert_eq!(plan.tasks[0].declared_bytes, 100);
    }
}
