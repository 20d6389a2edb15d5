use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Snapshot handed to the progress sink.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    /// Total bytes confirmed on disk so far, including bytes that were
    /// already present before the run. Monotonic non-decreasing.
    pub downloaded_bytes: u64,
    /// Total bytes for the whole operation; zero when unknown.
    pub total_bytes: u64,
    /// Instantaneous speed over the last emit interval, in MiB/s.
    pub speed_mibps: f64,
    /// Relative paths currently in flight.
    pub active_files: Vec<String>,
}

impl ProgressUpdate {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes > 0 {
            100.0 * self.downloaded_bytes as f64 / self.total_bytes as f64
        } else {
            0.0
        }
    }
}

/// Receiver for download progress events.
///
/// All methods have no-op defaults; implement only what the front-end needs.
/// `on_progress` invocations are serialized by the throttle and never exceed
/// the configured rate, except for one final call at completion.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, _update: &ProgressUpdate) {}

    fn on_file_complete(&self, _path: &str, _bytes: u64) {}

    fn on_error(&self, _path: &str, _error: &str) {}
}

/// A progress sink that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Lossy rate limiter for progress emission.
///
/// Workers race a compare-and-swap on a millisecond counter; the winner
/// emits, losers drop their update. Late updates are dropped rather than
/// queued; the next delta carries the running totals anyway.
#[derive(Debug)]
pub struct ProgressThrottle {
    started: Instant,
    interval_ms: u64,
    last_emit_ms: AtomicU64,
    last_emit_bytes: AtomicU64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            interval_ms: interval.as_millis() as u64,
            last_emit_ms: AtomicU64::new(0),
            last_emit_bytes: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Try to win the right to emit. On a win, returns the speed in MiB/s
    /// measured since the previous emission.
    pub fn try_emit(&self, downloaded_bytes: u64) -> Option<f64> {
        let now = self.now_ms();
        let last = self.last_emit_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.interval_ms {
            return None;
        }
        if self
            .last_emit_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let prev_bytes = self.last_emit_bytes.swap(downloaded_bytes, Ordering::AcqRel);
        let elapsed_ms = now.saturating_sub(last).max(1);
        let delta = downloaded_bytes.saturating_sub(prev_bytes);
        Some((delta as f64 / (1024.0 * 1024.0)) / (elapsed_ms as f64 / 1000.0))
    }

    /// Speed for the unconditional final emission.
    pub fn final_speed(&self, downloaded_bytes: u64) -> f64 {
        let now = self.now_ms();
        let last = self.last_emit_ms.load(Ordering::Acquire);
        let prev_bytes = self.last_emit_bytes.load(Ordering::Acquire);
        let elapsed_ms = now.saturating_sub(last).max(1);
        let delta = downloaded_bytes.saturating_sub(prev_bytes);
        (delta as f64 / (1024.0 * 1024.0)) / (elapsed_ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_emits_every_time() {
        let eager = ProgressThrottle::new(Duration::ZERO);
        assert!(eager.try_emit(100).is_some());
        assert!(eager.try_emit(200).is_some());
    }

    #[test]
    fn long_interval_suppresses_early_updates() {
        let throttle = ProgressThrottle::new(Duration::from_secs(3600));
        assert!(throttle.try_emit(100).is_none());
        assert!(throttle.try_emit(200).is_none());
    }

    #[test]
    fn speed_is_delta_over_interval() {
        let throttle = ProgressThrottle::new(Duration::ZERO);
        throttle.try_emit(0);
        std::thread::sleep(Duration::from_millis(20));
        let speed = throttle.try_emit(10 * 1024 * 1024).unwrap();
        // 10 MiB over >=20ms: bounded above by 10 MiB / 20 ms = 500 MiB/s.
        assert!(speed > 0.0);
        assert!(speed <= 500.0 + f64::EPSILON);
    }

    #[test]
    fn concurrent_attempts_elect_single_winner() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicU32;

        // Age the throttle past one interval, then race: exactly one CAS
        // winner, and the reset window is far too long for a second win.
        let throttle = Arc::new(ProgressThrottle::new(Duration::from_millis(200)));
        std::thread::sleep(Duration::from_millis(210));

        let wins = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    if throttle.try_emit(1024).is_some() {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn percentage_handles_unknown_total() {
        let update = ProgressUpdate {
            downloaded_bytes: 50,
            total_bytes: 0,
            ..Default::default()
        };
        assert_eq!(update.percentage(), 0.0);

        let update = ProgressUpdate {
            downloaded_bytes: 50,
            total_bytes: 200,
            ..Default::default()
        };
        assert_eq!(update.percentage(), 25.0);
    }
}
