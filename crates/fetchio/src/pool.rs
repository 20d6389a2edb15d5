//! Worker pool: executes a download plan and aggregates progress.
//!
//! Workers compete for a mutex-guarded FIFO of tasks sorted largest-first
//! by the planner. Each worker owns an independent protocol-selecting
//! client; only the host-capability profile is shared, so no wire state
//! crosses workers. The first task-level error cancels the run: remaining
//! queued tasks are drained, in-flight transfers finish or hit their own
//! deadlines, and the first error is what the caller sees.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::fetch::execute_task;
use crate::planner::{DownloadPlan, DownloadTask};
use crate::progress::{ProgressSink, ProgressThrottle, ProgressUpdate};
use crate::sink::FileSink;
use crate::transport::{ClientProfile, ProtocolClient};

/// Final accounting for one run.
#[derive(Debug, Default, Clone)]
pub struct DownloadSummary {
    /// Bytes actually transferred over the network in this run.
    pub bytes_downloaded: u64,
    pub files_completed: usize,
    pub files_skipped: usize,
}

/// Queue state and the in-flight list live under one lock, per the
/// aggregator contract.
struct QueueState {
    tasks: VecDeque<DownloadTask>,
    in_flight: Vec<String>,
}

struct SinkEntry {
    sink: Arc<FileSink>,
    /// Tasks still owed to this file; the sink syncs and closes at zero.
    remaining: usize,
}

/// Shared state for one pool run.
struct PoolShared {
    queue: Mutex<QueueState>,
    sinks: Mutex<HashMap<PathBuf, SinkEntry>>,
    /// Running total including bytes satisfied before the run started.
    downloaded: AtomicU64,
    network_bytes: AtomicU64,
    total_bytes: u64,
    throttle: ProgressThrottle,
    cancel: CancellationToken,
    first_error: Mutex<Option<FetchError>>,
}

impl PoolShared {
    fn record_error(&self, err: FetchError, entry_path: &str, sink: &dyn ProgressSink) {
        error!(path = entry_path, error = %err, "task failed");
        sink.on_error(entry_path, &err.to_string());
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(err);
            self.cancel.cancel();
        }
    }

    fn emit_progress(&self, sink: &dyn ProgressSink) {
        let downloaded = self.downloaded.load(Ordering::Acquire);
        if let Some(speed) = self.throttle.try_emit(downloaded) {
            let active_files = self.queue.lock().in_flight.clone();
            sink.on_progress(&ProgressUpdate {
                downloaded_bytes: downloaded,
                total_bytes: self.total_bytes,
                speed_mibps: speed,
                active_files,
            });
        }
    }
}

/// Executes plans against a shared protocol profile.
pub struct WorkerPool {
    config: FetchConfig,
    profile: Arc<ClientProfile>,
}

impl WorkerPool {
    pub fn new(config: FetchConfig, profile: Arc<ClientProfile>) -> Self {
        Self { config, profile }
    }

    /// Run `plan` to completion or first failure.
    ///
    /// Destination files are pre-allocated to their declared sizes before
    /// any task is released to a worker.
    pub async fn run(
        &self,
        plan: DownloadPlan,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<DownloadSummary> {
        let files_skipped = plan.files_skipped;
        if plan.is_empty() {
            progress.on_progress(&ProgressUpdate {
                downloaded_bytes: plan.already_done,
                total_bytes: plan.total_bytes,
                speed_mibps: 0.0,
                active_files: Vec::new(),
            });
            return Ok(DownloadSummary {
                bytes_downloaded: 0,
                files_completed: 0,
                files_skipped,
            });
        }

        let sinks = open_sinks(&plan)?;
        let task_count = plan.tasks.len();
        let workers = self.config.workers.max(1).min(task_count);

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(QueueState {
                tasks: plan.tasks,
                in_flight: Vec::new(),
            }),
            sinks: Mutex::new(sinks),
            downloaded: AtomicU64::new(plan.already_done),
            network_bytes: AtomicU64::new(0),
            total_bytes: plan.total_bytes,
            throttle: ProgressThrottle::new(self.config.progress_interval),
            cancel,
            first_error: Mutex::new(None),
        });

        info!(workers, tasks = task_count, "starting download workers");

        let files_completed = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let config = self.config.clone();
            let profile = Arc::clone(&self.profile);
            let shared = Arc::clone(&shared);
            let progress = Arc::clone(&progress);
            let files_completed = Arc::clone(&files_completed);
            handles.push(tokio::spawn(async move {
                worker_loop(
                    worker_id,
                    config,
                    profile,
                    shared,
                    progress,
                    files_completed,
                )
                .await;
            }));
        }
        for handle in handles {
            // Workers never panic by construction; a join error still must
            // not wedge the run.
            if let Err(e) = handle.await {
                error!(error = %e, "worker task join failed");
            }
        }

        // Close whatever sinks remain (failure leaves partial files behind
        // for a later resume; the data written so far is made durable).
        let leftover: Vec<SinkEntry> = shared.sinks.lock().drain().map(|(_, e)| e).collect();
        for entry in leftover {
            if let Ok(sink) = Arc::try_unwrap(entry.sink) {
                let _ = sink.close(shared.cancel.is_cancelled());
            }
        }

        let downloaded = shared.downloaded.load(Ordering::Acquire);
        progress.on_progress(&ProgressUpdate {
            downloaded_bytes: downloaded,
            total_bytes: shared.total_bytes,
            speed_mibps: shared.throttle.final_speed(downloaded),
            active_files: Vec::new(),
        });

        if let Some(err) = shared.first_error.lock().take() {
            return Err(err);
        }
        Ok(DownloadSummary {
            bytes_downloaded: shared.network_bytes.load(Ordering::Acquire),
            files_completed: files_completed.load(Ordering::Acquire) as usize,
            files_skipped,
        })
    }
}

fn open_sinks(plan: &DownloadPlan) -> Result<HashMap<PathBuf, SinkEntry>> {
    let mut sinks: HashMap<PathBuf, SinkEntry> = HashMap::new();
    for task in &plan.tasks {
        match sinks.get_mut(&task.destination_path) {
            Some(entry) => entry.remaining += 1,
            None => {
                let sink = FileSink::open(&task.destination_path, task.file_size)?;
                sinks.insert(
                    task.destination_path.clone(),
                    SinkEntry {
                        sink: Arc::new(sink),
                        remaining: 1,
                    },
                );
            }
        }
    }
    Ok(sinks)
}

async fn worker_loop(
    worker_id: usize,
    config: FetchConfig,
    profile: Arc<ClientProfile>,
    shared: Arc<PoolShared>,
    progress: Arc<dyn ProgressSink>,
    files_completed: Arc<AtomicU64>,
) {
    let client = match ProtocolClient::new(&config, profile) {
        Ok(client) => client,
        Err(e) => {
            shared.record_error(e, "<client setup>", progress.as_ref());
            return;
        }
    };

    loop {
        if shared.cancel.is_cancelled() {
            debug!(worker_id, "cancellation observed, draining");
            break;
        }

        let task = {
            let mut queue = shared.queue.lock();
            match queue.tasks.pop_front() {
                Some(task) => {
                    queue.in_flight.push(task.entry_path.clone());
                    task
                }
                None => break,
            }
        };

        let sink = {
            let sinks = shared.sinks.lock();
            match sinks.get(&task.destination_path) {
                Some(entry) => Arc::clone(&entry.sink),
                None => {
                    // Closed by an earlier failing sibling chunk; nothing
                    // sensible left to do with this task.
                    remove_in_flight(&shared, &task.entry_path);
                    continue;
                }
            }
        };

        let on_delta = |delta: u64| {
            shared.downloaded.fetch_add(delta, Ordering::AcqRel);
            shared.network_bytes.fetch_add(delta, Ordering::AcqRel);
            shared.emit_progress(progress.as_ref());
        };

        let result = execute_task(
            &client,
            &task,
            &sink,
            config.buffer_size,
            &on_delta,
            &shared.cancel,
        )
        .await;
        drop(sink);
        remove_in_flight(&shared, &task.entry_path);

        match result {
            Ok(bytes) => {
                debug!(worker_id, path = %task.entry_path, bytes, "task complete");
                if finish_file_task(&shared, &task, progress.as_ref()) {
                    files_completed.fetch_add(1, Ordering::AcqRel);
                    progress.on_file_complete(&task.entry_path, task.file_size);
                }
            }
            Err(e) => {
                shared.record_error(e, &task.entry_path, progress.as_ref());
            }
        }
    }
}

fn remove_in_flight(shared: &PoolShared, entry_path: &str) {
    let mut queue = shared.queue.lock();
    if let Some(pos) = queue.in_flight.iter().position(|p| p == entry_path) {
        queue.in_flight.swap_remove(pos);
    }
}

/// Decrement the destination's outstanding-task count; on the last one,
/// sync and close the sink. Returns whether the file is now complete.
fn finish_file_task(shared: &PoolShared, task: &DownloadTask, progress: &dyn ProgressSink) -> bool {
    let entry = {
        let mut sinks = shared.sinks.lock();
        let done = match sinks.get_mut(&task.destination_path) {
            Some(entry) => {
                entry.remaining -= 1;
                entry.remaining == 0
            }
            None => false,
        };
        if done {
            sinks.remove(&task.destination_path)
        } else {
            None
        }
    };
    match entry {
        Some(entry) => {
            match Arc::try_unwrap(entry.sink) {
                Ok(sink) => {
                    if let Err(e) = sink.close(false) {
                        shared.record_error(e, &task.entry_path, progress);
                        return false;
                    }
                }
                Err(sink) => {
                    // Another worker still holds the Arc briefly; fall back
                    // to an explicit sync, drop handles the close.
                    if let Err(e) = sink.sync() {
                        shared.record_error(e, &task.entry_path, progress);
                        return false;
                    }
                }
            }
            true
        }
        None => false,
    }
}

/// Convenience driver: plan already built, default profile.
pub async fn run_plan(
    config: &FetchConfig,
    plan: DownloadPlan,
    progress: Arc<dyn ProgressSink>,
) -> Result<DownloadSummary> {
    let profile = Arc::new(ClientProfile::new(config.protocol_override));
    let pool = WorkerPool::new(config.clone(), profile);
    pool.run(plan, progress, CancellationToken::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use tempfile::TempDir;

    fn chunk_task(dir: &TempDir, name: &str, start: u64, end: u64, file_size: u64) -> DownloadTask {
        DownloadTask {
            source_url: format!("https://host/{name}"),
            destination_path: dir.path().join(name),
            destination_offset: start,
            range: Some((start, end)),
            expected_hash: String::new(),
            resume_offset: 0,
            declared_bytes: end - start + 1,
            entry_path: name.to_owned(),
            file_size,
        }
    }

    #[test]
    fn open_sinks_shares_one_sink_per_destination() {
        let dir = TempDir::new().unwrap();
        let plan = DownloadPlan {
            tasks: vec![
                chunk_task(&dir, "big.bin", 0, 9, 30),
                chunk_task(&dir, "big.bin", 10, 19, 30),
                chunk_task(&dir, "big.bin", 20, 29, 30),
                chunk_task(&dir, "other.bin", 0, 9, 10),
            ]
            .into(),
            ..Default::default()
        };

        let sinks = open_sinks(&plan).unwrap();
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[&dir.path().join("big.bin")].remaining, 3);
        assert_eq!(sinks[&dir.path().join("other.bin")].remaining, 1);
        // Pre-allocation happened at open time.
        assert_eq!(
            std::fs::metadata(dir.path().join("big.bin")).unwrap().len(),
            30
        );
    }

    #[tokio::test]
    async fn empty_plan_short_circuits() {
        let config = FetchConfig::default();
        let plan = DownloadPlan {
            already_done: 77,
            total_bytes: 77,
            files_skipped: 3,
            ..Default::default()
        };
        let summary = run_plan(&config, plan, Arc::new(NoProgress)).await.unwrap();
        assert_eq!(summary.bytes_downloaded, 0);
        assert_eq!(summary.files_completed, 0);
        assert_eq!(summary.files_skipped, 3);
    }

    #[test]
    fn finish_file_task_closes_only_after_last_chunk() {
        let dir = TempDir::new().unwrap();
        let t1 = chunk_task(&dir, "f.bin", 0, 9, 20);
        let t2 = chunk_task(&dir, "f.bin", 10, 19, 20);
        let plan = DownloadPlan {
            tasks: vec![t1.clone(), t2.clone()].into(),
            ..Default::default()
        };
        let shared = PoolShared {
            queue: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                in_flight: Vec::new(),
            }),
            sinks: Mutex::new(open_sinks(&plan).unwrap()),
            downloaded: AtomicU64::new(0),
            network_bytes: AtomicU64::new(0),
            total_bytes: 20,
            throttle: ProgressThrottle::new(std::time::Duration::from_millis(250)),
            cancel: CancellationToken::new(),
            first_error: Mutex::new(None),
        };

        assert!(!finish_file_task(&shared, &t1, &NoProgress));
        assert_eq!(shared.sinks.lock().len(), 1);
        assert!(finish_file_task(&shared, &t2, &NoProgress));
        assert!(shared.sinks.lock().is_empty());
    }
}
