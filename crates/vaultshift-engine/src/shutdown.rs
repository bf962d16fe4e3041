//! Runtime budget, signals and the final outcome of a run

use crate::ledger::LedgerCounts;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why a run stopped before draining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Interrupt or termination signal
    Signal,
    /// Runtime budget minus safety margin elapsed
    Deadline,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal => f.write_str("interrupt signal"),
            Self::Deadline => f.write_str("runtime budget"),
        }
    }
}

/// Owns the run's cancellation token and records the first stop reason
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
    started: Instant,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a coordinator; the runtime clock starts now
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            started: Instant::now(),
        }
    }

    /// Token observed by every long-running task of the run
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the run; later calls keep the first reason
    pub fn stop(&self, reason: StopReason) {
        if self.reason.set(reason).is_ok() {
            warn!(%reason, elapsed_secs = self.elapsed().as_secs(), "Stopping run");
        }
        self.token.cancel();
    }

    /// Reason of the stop, if one happened
    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Time since the coordinator was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Margin kept between the deadline and the end of the budget
    ///
    /// Never shorter than one poll interval, so the final status query and
    /// checkpoint fit inside the budget.
    pub fn safety_margin(poll_interval: Duration, min_margin: Duration) -> Duration {
        poll_interval.max(min_margin)
    }

    /// Listen for signals and enforce `budget`
    ///
    /// The deadline fires at `budget - margin` after creation; a budget not
    /// larger than the margin stops the run immediately.
    pub fn watch(&self, budget: Option<Duration>, margin: Duration) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.spawn_signal_listener()];

        if let Some(budget) = budget {
            let deadline = budget.saturating_sub(margin);
            let remaining = deadline.saturating_sub(self.elapsed());
            info!(
                budget_secs = budget.as_secs(),
                margin_secs = margin.as_secs(),
                "Runtime budget armed"
            );
            let coordinator = self.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(remaining) => coordinator.stop(StopReason::Deadline),
                    () = coordinator.token.cancelled() => {}
                }
            }));
        }

        handles
    }

    fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = wait_for_signal() => coordinator.stop(StopReason::Signal),
                () = coordinator.token.cancelled() => {}
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Final classification of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum RunOutcome {
    /// Every task completed or was skipped
    Completed,
    /// Every task is terminal but some failed
    CompletedWithFailures,
    /// Stopped early with resumable work left
    Interrupted(StopReason),
}

impl RunOutcome {
    /// Classify a run from its final counts
    ///
    /// Work left over without a stop request means the pool gave up on it,
    /// which is reported as a failure rather than a success.
    pub fn classify(counts: &LedgerCounts, stop: Option<StopReason>) -> Self {
        match stop {
            Some(reason) if counts.remaining() > 0 => Self::Interrupted(reason),
            _ if counts.failed > 0 || counts.remaining() > 0 => Self::CompletedWithFailures,
            _ => Self::Completed,
        }
    }

    /// Process exit code
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::CompletedWithFailures => 1,
            Self::Interrupted(_) => 2,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::CompletedWithFailures => f.write_str("completed with failures"),
            Self::Interrupted(reason) => write!(f, "interrupted by {reason}"),
        }
    }
}
