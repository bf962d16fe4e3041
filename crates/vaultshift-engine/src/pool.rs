//! Worker pool that drains the ledger
//!
//! Each worker loops over claim, submit and poll until the ledger is drained
//! or the run is cancelled. After cancellation a worker finishes the step it
//! is in, performs at most one more status query for an in-flight job and
//! hands the task back to the ledger so the persisted state can resume it.

use crate::checkpoint::CheckpointTrigger;
use crate::credentials::CredentialCoordinator;
use crate::ledger::{Applied, Claim, ClaimedTask, Ledger};
use crate::retry::call_with_retry;
use crate::task::{TaskError, TaskState, Transition};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vaultshift_config::Config;
use vaultshift_types::{
    BackupClient, CopyJobId, CopyJobRequest, CopyJobStatus, Error, ItemId, Result, RetryConfig,
    WorkerCount,
};

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of concurrent workers
    pub workers: WorkerCount,
    /// Time between status queries of one job
    pub poll_interval: Duration,
    /// Retry policy for throttling and other transient errors of one call
    pub transient_retry: RetryConfig,
    /// Copy attempts per task
    pub task_retry: RetryConfig,
    /// Request a checkpoint every this many transitions
    pub save_every_transitions: u64,
}

impl PoolSettings {
    /// Create pool settings from main config
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            workers: config.pool.worker_count()?,
            poll_interval: config.pool.poll_interval(),
            transient_retry: config.retry.transient()?,
            task_retry: config.retry.task()?,
            save_every_transitions: config.pool.save_every_transitions.max(1),
        })
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: WorkerCount::default(),
            poll_interval: Duration::from_secs(30),
            transient_retry: RetryConfig::default(),
            task_retry: RetryConfig::default(),
            save_every_transitions: 25,
        }
    }
}

/// Where copies go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTarget {
    /// Vault the items are copied from
    pub source_vault: String,
    /// Vault reference the items are copied to
    pub destination_vault: String,
    /// Role the service assumes for the copy
    pub iam_role: Option<String>,
}

/// What the pool did during one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    /// Copy jobs accepted by the service
    pub submitted: u64,
    /// Tasks completed
    pub completed: u64,
    /// Tasks failed without a retry
    pub failed: u64,
    /// Failed attempts scheduled for a retry
    pub retried: u64,
    /// Status queries made
    pub polls: u64,
    /// Workers aborted after the grace period
    pub aborted: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    polls: AtomicU64,
}

impl PoolCounters {
    fn report(&self, aborted: u64) -> PoolReport {
        PoolReport {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            aborted,
        }
    }
}

/// Idempotency token of one copy attempt
///
/// Stable for a given run, item and attempt, so a request repeated after a
/// lost response or a restart cannot start a second job.
pub fn idempotency_token(run_id: Uuid, item_id: &ItemId, attempt: u32) -> String {
    let name = format!("{}#{}", item_id, attempt);
    Uuid::new_v5(&run_id, name.as_bytes()).to_string()
}

struct PoolShared {
    ledger: Arc<Ledger>,
    client: Arc<dyn BackupClient>,
    credentials: Arc<CredentialCoordinator>,
    settings: PoolSettings,
    target: CopyTarget,
    run_id: Uuid,
    checkpoint: CheckpointTrigger,
    last_checkpoint_bucket: AtomicU64,
    counters: PoolCounters,
    cancel: CancellationToken,
}

/// Fixed-size pool of copy workers
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create a pool over `ledger`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        client: Arc<dyn BackupClient>,
        credentials: Arc<CredentialCoordinator>,
        settings: PoolSettings,
        target: CopyTarget,
        run_id: Uuid,
        checkpoint: CheckpointTrigger,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                ledger,
                client,
                credentials,
                settings,
                target,
                run_id,
                checkpoint,
                last_checkpoint_bucket: AtomicU64::new(0),
                counters: PoolCounters::default(),
                cancel,
            }),
        }
    }

    /// Run the workers until the ledger drains or the run is cancelled
    ///
    /// After cancellation the workers get `grace` to reach a safe point;
    /// stragglers are aborted and counted in the report.
    pub async fn run(&self, grace: Duration) -> PoolReport {
        let workers = self.shared.settings.workers.get();
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let shared = Arc::clone(&self.shared);
            set.spawn(async move { shared.work(worker_id).await });
        }
        info!(workers, "Worker pool started");

        let stopped = tokio::select! {
            () = join_all(&mut set) => false,
            () = self.shared.cancel.cancelled() => true,
        };

        let mut aborted = 0;
        if stopped && !set.is_empty() {
            debug!(
                remaining = set.len(),
                grace_secs = grace.as_secs(),
                "Waiting for workers to stop"
            );
            if tokio::time::timeout(grace, join_all(&mut set)).await.is_err() {
                aborted = set.len() as u64;
                warn!(aborted, "Workers did not stop within the grace period");
                set.abort_all();
                while set.join_next().await.is_some() {}
            }
        }

        let report = self.shared.counters.report(aborted);
        info!(
            submitted = report.submitted,
            completed = report.completed,
            failed = report.failed,
            retried = report.retried,
            "Worker pool finished"
        );
        report
    }
}

async fn join_all(set: &mut JoinSet<()>) {
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "Worker panicked");
            }
        }
    }
}

impl PoolShared {
    async fn work(&self, worker_id: usize) {
        debug!(worker_id, "Worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let changed = self.ledger.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.ledger.claim_next(Utc::now()).await {
                Ok(Claim::Task(task)) => self.process(task).await,
                Ok(Claim::Wait(due)) => {
                    let delay = due.map_or(self.settings.poll_interval, |d| {
                        d.min(self.settings.poll_interval)
                    });
                    tokio::select! {
                        () = &mut changed => {}
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
                Ok(Claim::Drained) => break,
                Err(e) => {
                    error!(worker_id, error = %e, "Claim failed");
                    break;
                }
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn process(&self, task: ClaimedTask) {
        let job_id = match task.job_id.clone() {
            Some(job_id) => {
                debug!(item = %task.item_id, job = %job_id, "Continuing in-flight copy job");
                job_id
            }
            None => match self.submit(&task).await {
                Some(job_id) => job_id,
                None => return,
            },
        };
        self.poll(&task, job_id).await;
    }

    async fn submit(&self, task: &ClaimedTask) -> Option<CopyJobId> {
        let request = CopyJobRequest {
            item_id: task.item_id.clone(),
            source_vault: self.target.source_vault.clone(),
            destination_vault: self.target.destination_vault.clone(),
            iam_role: self.target.iam_role.clone(),
            idempotency_token: idempotency_token(self.run_id, &task.item_id, task.attempt),
        };
        let client = &*self.client;
        let request = &request;

        let started = call_with_retry(
            &self.credentials,
            &self.settings.transient_retry,
            &self.cancel,
            "start_copy_job",
            move || client.start_copy_job(request),
        )
        .await;

        match started {
            Ok(job_id) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                self.transition(&task.item_id, Transition::JobStarted(job_id.clone()))
                    .await
                    .ok()?;
                info!(
                    item = %task.item_id,
                    job = %job_id,
                    attempt = task.attempt,
                    "Copy job started"
                );
                Some(job_id)
            }
            Err(Error::Cancelled) => {
                // No job exists, the task can go back to the queue
                let _ = self.transition(&task.item_id, Transition::Released).await;
                None
            }
            Err(err) => {
                let retryable = err.is_recoverable();
                self.fail(task, "start_copy_job", &err, retryable).await;
                None
            }
        }
    }

    async fn poll(&self, task: &ClaimedTask, job_id: CopyJobId) {
        let mut state = task.state;
        let mut outages = 0;
        let client = &*self.client;
        let job = &job_id;

        loop {
            let stopping = self.cancel.is_cancelled();
            let status = self
                .credentials
                .guard("copy_job_status", move || client.copy_job_status(job))
                .await;
            self.counters.polls.fetch_add(1, Ordering::Relaxed);

            match status {
                Ok(CopyJobStatus::InProgress) => {
                    outages = 0;
                    if state == TaskState::Submitted {
                        if self
                            .transition(&task.item_id, Transition::Polling)
                            .await
                            .is_err()
                        {
                            return;
                        }
                        state = TaskState::Polling;
                    }
                }
                Ok(CopyJobStatus::Completed) => {
                    if self
                        .transition(&task.item_id, Transition::Completed)
                        .await
                        .is_ok()
                    {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                        info!(item = %task.item_id, job = %job_id, "Copy completed");
                    }
                    return;
                }
                Ok(CopyJobStatus::Failed { reason }) => {
                    let err = Error::permanent(format!("Copy job {job_id} failed: {reason}"));
                    self.fail(task, "copy_job_status", &err, true).await;
                    return;
                }
                Err(Error::Cancelled) => {
                    self.ledger.unclaim(&task.item_id).await;
                    return;
                }
                Err(err) if err.should_retry() => {
                    outages += 1;
                    if !self.settings.transient_retry.allows_another(outages) {
                        // The job may still be running, resubmitting could copy twice
                        self.fail(task, "copy_job_status", &err, false).await;
                        return;
                    }
                    warn!(item = %task.item_id, job = %job_id, error = %err, "Status query failed");
                }
                Err(err) => {
                    self.fail(task, "copy_job_status", &err, false).await;
                    return;
                }
            }

            if stopping {
                debug!(item = %task.item_id, job = %job_id, "Leaving in-flight job for resume");
                self.ledger.unclaim(&task.item_id).await;
                return;
            }

            let delay = if outages > 0 {
                self.settings.transient_retry.delay_after(outages)
            } else {
                self.settings.poll_interval
            };
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => {}
            }
        }
    }

    async fn fail(&self, task: &ClaimedTask, operation: &str, err: &Error, retryable: bool) {
        let now = Utc::now();
        let retry_at = if retryable && self.settings.task_retry.allows_another(task.attempt) {
            let delay = self.settings.task_retry.delay_after(task.attempt);
            chrono::Duration::from_std(delay).ok().map(|delay| now + delay)
        } else {
            None
        };

        error!(
            item = %task.item_id,
            operation,
            attempt = task.attempt,
            kind = ?err.kind(),
            error = %err,
            retry = retry_at.is_some(),
            "Copy attempt failed"
        );

        let transition = Transition::Failed {
            error: TaskError::from(err),
            retry_at,
        };
        if self.transition(&task.item_id, transition).await.is_ok() {
            let counter = if retry_at.is_some() {
                &self.counters.retried
            } else {
                &self.counters.failed
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn transition(&self, item_id: &ItemId, transition: Transition) -> Result<Applied> {
        match self.ledger.apply(item_id, transition).await {
            Ok(applied) => {
                let bucket = applied.transitions / self.settings.save_every_transitions;
                if self.last_checkpoint_bucket.fetch_max(bucket, Ordering::Relaxed) < bucket {
                    self.checkpoint.request();
                }
                Ok(applied)
            }
            Err(e) => {
                error!(item = %item_id, error = %e, "Ledger rejected transition");
                Err(e)
            }
        }
    }
}
