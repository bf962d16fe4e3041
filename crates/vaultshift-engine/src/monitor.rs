//! Progress monitoring: rolling throughput and ETA over the ledger

use crate::ledger::{Ledger, LedgerCounts};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Point-in-time progress of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Completed tasks
    pub completed: u64,
    /// Permanently failed tasks
    pub failed: u64,
    /// Tasks with an attempt in flight
    pub in_progress: u64,
    /// Tasks waiting to be claimed, retries included
    pub pending: u64,
    /// Skipped tasks
    pub skipped: u64,
    /// All tasks
    pub total: u64,
    /// Items finished per second over the trailing window
    pub rate: f64,
    /// Estimated time to finish, `None` while the rate is zero
    pub eta: Option<Duration>,
    /// Time since the tracker was created
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Finished share of the non-skipped work, in percent
    pub fn percent_done(&self) -> f64 {
        let work = self.total - self.skipped;
        if work > 0 {
            ((self.completed + self.failed) as f64 / work as f64) * 100.0
        } else {
            100.0
        }
    }

    /// Tasks that reached a terminal state
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }
}

/// Read-only observer computing throughput from periodic samples
#[derive(Debug)]
pub struct ProgressTracker {
    window: Duration,
    started: Instant,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl ProgressTracker {
    /// Create a tracker averaging over `window`
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Sample the ledger and compute a snapshot
    ///
    /// Only the counter copy touches the ledger lock.
    pub async fn snapshot(&self, ledger: &Ledger) -> ProgressSnapshot {
        let counts = ledger.counts().await;
        self.record(&counts, Instant::now())
    }

    /// Add a sample taken at `at` and compute a snapshot from it
    pub fn record(&self, counts: &LedgerCounts, at: Instant) -> ProgressSnapshot {
        let done = counts.completed + counts.failed;
        let rate = {
            let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            samples.push_back((at, done));
            while samples.len() > 2
                && samples
                    .front()
                    .is_some_and(|(t, _)| at.saturating_duration_since(*t) > self.window)
            {
                samples.pop_front();
            }
            match samples.front() {
                Some(&(first_at, first_done)) => {
                    let span = at.saturating_duration_since(first_at);
                    if span >= Duration::from_secs(1) {
                        done.saturating_sub(first_done) as f64 / span.as_secs_f64()
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            }
        };

        let remaining = counts.remaining();
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if rate > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate))
        } else {
            None
        };

        ProgressSnapshot {
            completed: counts.completed,
            failed: counts.failed,
            in_progress: counts.in_progress(),
            pending: counts.pending + counts.retrying,
            skipped: counts.skipped,
            total: counts.total(),
            rate,
            eta,
            elapsed: at.saturating_duration_since(self.started),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pending: u64, completed: u64) -> LedgerCounts {
        LedgerCounts {
            pending,
            completed,
            ..LedgerCounts::default()
        }
    }

    #[test]
    fn test_rate_and_eta() {
        let tracker = ProgressTracker::new(Duration::from_secs(300));
        let t0 = Instant::now();

        let first = tracker.record(&counts(100, 0), t0);
        assert_eq!(first.rate, 0.0);
        assert_eq!(first.eta, None);

        let second = tracker.record(&counts(80, 20), t0 + Duration::from_secs(10));
        assert!((second.rate - 2.0).abs() < 1e-9);
        assert_eq!(second.eta, Some(Duration::from_secs(40)));
        assert_eq!(second.total, 100);
    }

    #[test]
    fn test_window_discards_old_samples() {
        let tracker = ProgressTracker::new(Duration::from_secs(10));
        let t0 = Instant::now();

        tracker.record(&counts(100, 0), t0);
        tracker.record(&counts(50, 50), t0 + Duration::from_secs(5));
        tracker.record(&counts(50, 50), t0 + Duration::from_secs(20));
        let stalled = tracker.record(&counts(50, 50), t0 + Duration::from_secs(25));

        assert_eq!(stalled.rate, 0.0);
        assert_eq!(stalled.eta, None);
    }

    #[test]
    fn test_finished_run_has_zero_eta() {
        let tracker = ProgressTracker::new(Duration::from_secs(300));
        let snapshot = tracker.record(&counts(0, 10), Instant::now());
        assert_eq!(snapshot.eta, Some(Duration::ZERO));
        assert_eq!(snapshot.percent_done(), 100.0);
    }

    #[tokio::test]
    async fn test_snapshot_reads_ledger() {
        use crate::task::MigrationTask;
        use vaultshift_types::ItemId;

        let ledger = Ledger::new((0..4).map(|i| MigrationTask::new(ItemId::new(format!("rp-{i}")))))
            .unwrap();
        let tracker = ProgressTracker::new(Duration::from_secs(60));
        let snapshot = tracker.snapshot(&ledger).await;

        assert_eq!(snapshot.pending, 4);
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.in_progress, 0);
    }
}
