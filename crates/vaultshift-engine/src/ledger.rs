//! The task ledger: every task of a run plus aggregate counts
//!
//! Workers never touch a [`MigrationTask`] directly. They claim work with
//! [`Ledger::claim_next`], which performs the compare-and-set from a claimable
//! state to `SUBMITTED` under the write lock, and report progress with
//! [`Ledger::apply`]. A task is owned by at most one worker between its claim
//! and the transition that ends its attempt.

use crate::task::{MigrationTask, TaskState, Transition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};
use vaultshift_types::{CopyJobId, Error, ItemId, Result};

/// Aggregate task counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    /// Tasks waiting to be claimed
    pub pending: u64,
    /// Claimed tasks whose job was requested
    pub submitted: u64,
    /// Tasks whose job is being polled
    pub polling: u64,
    /// Finished tasks
    pub completed: u64,
    /// Permanently failed tasks
    pub failed: u64,
    /// Failed tasks waiting for a retry
    pub retrying: u64,
    /// Tasks excluded before the run
    pub skipped: u64,
}

impl LedgerCounts {
    /// Number of tasks in the ledger
    pub fn total(&self) -> u64 {
        self.pending
            + self.submitted
            + self.polling
            + self.completed
            + self.failed
            + self.retrying
            + self.skipped
    }

    /// Tasks with a copy attempt in flight
    pub fn in_progress(&self) -> u64 {
        self.submitted + self.polling
    }

    /// Tasks that reached a terminal state
    pub fn terminal(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }

    /// Tasks that still need work
    pub fn remaining(&self) -> u64 {
        self.total() - self.terminal()
    }

    fn bucket(&mut self, task: &MigrationTask) -> &mut u64 {
        match task.state {
            TaskState::Pending => &mut self.pending,
            TaskState::Submitted => &mut self.submitted,
            TaskState::Polling => &mut self.polling,
            TaskState::Completed => &mut self.completed,
            TaskState::Failed if task.retry_at.is_some() => &mut self.retrying,
            TaskState::Failed => &mut self.failed,
            TaskState::Skipped => &mut self.skipped,
        }
    }
}

/// A task handed to one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    /// Item to copy
    pub item_id: ItemId,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Copy job to keep polling, set when continuing an in-flight task
    pub job_id: Option<CopyJobId>,
    /// State at the time of the claim
    pub state: TaskState,
}

/// Result of asking the ledger for work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns this task
    Task(ClaimedTask),
    /// Nothing is claimable yet; a retry becomes due after the given delay,
    /// or `None` when only in-flight tasks are outstanding
    Wait(Option<Duration>),
    /// Nothing is claimable and nothing will become claimable
    Drained,
}

/// Outcome of a successful transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// New state of the task
    pub state: TaskState,
    /// Ledger-wide transition count after this one
    pub transitions: u64,
}

#[derive(Debug, Default)]
struct LedgerInner {
    tasks: HashMap<ItemId, MigrationTask>,
    pending: VecDeque<ItemId>,
    orphans: VecDeque<ItemId>,
    retries: BTreeSet<(DateTime<Utc>, ItemId)>,
    claimed: HashSet<ItemId>,
    counts: LedgerCounts,
}

/// Lock-protected set of migration tasks
#[derive(Debug)]
pub struct Ledger {
    inner: RwLock<LedgerInner>,
    changed: Notify,
    transitions: AtomicU64,
}

impl Ledger {
    /// Build a ledger from existing tasks
    ///
    /// In-flight tasks that already have a copy job become orphans, to be
    /// picked up by the next worker that asks for work. A `SUBMITTED` task
    /// without a job goes back to `PENDING`.
    pub fn new(tasks: impl IntoIterator<Item = MigrationTask>) -> Result<Self> {
        let now = Utc::now();
        let mut inner = LedgerInner::default();

        for mut task in tasks {
            if task.state == TaskState::Submitted && task.job_id.is_none() {
                task.apply(Transition::Released, now)?;
            }

            match task.state {
                TaskState::Pending => inner.pending.push_back(task.item_id.clone()),
                TaskState::Submitted | TaskState::Polling => {
                    inner.orphans.push_back(task.item_id.clone());
                }
                TaskState::Failed => {
                    if let Some(retry_at) = task.retry_at {
                        inner.retries.insert((retry_at, task.item_id.clone()));
                    }
                }
                TaskState::Completed | TaskState::Skipped => {}
            }

            *inner.counts.bucket(&task) += 1;
            let id = task.item_id.clone();
            if inner.tasks.insert(id.clone(), task).is_some() {
                return Err(Error::other(format!("Duplicate task for item {}", id)));
            }
        }

        debug!(
            tasks = inner.tasks.len(),
            pending = inner.pending.len(),
            orphans = inner.orphans.len(),
            retries = inner.retries.len(),
            "Ledger initialized"
        );

        Ok(Self {
            inner: RwLock::new(inner),
            changed: Notify::new(),
            transitions: AtomicU64::new(0),
        })
    }

    /// Claim the next claimable task
    ///
    /// Orphaned in-flight tasks come first, then retries that are due, then
    /// pending tasks in inventory order.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Claim> {
        let mut inner = self.inner.write().await;

        if let Some(id) = inner.orphans.pop_front() {
            inner.claimed.insert(id.clone());
            let task = inner
                .tasks
                .get(&id)
                .ok_or_else(|| Error::other(format!("Orphan {} has no task", id)))?;
            return Ok(Claim::Task(ClaimedTask {
                item_id: id.clone(),
                attempt: task.attempts,
                job_id: task.job_id.clone(),
                state: task.state,
            }));
        }

        let due = inner
            .retries
            .first()
            .filter(|(retry_at, _)| *retry_at <= now)
            .cloned();
        if let Some(entry) = due {
            inner.retries.remove(&entry);
            let claimed = inner.claim(&entry.1, now)?;
            drop(inner);
            self.record_transition();
            return Ok(Claim::Task(claimed));
        }

        while let Some(id) = inner.pending.pop_front() {
            let claimable = inner
                .tasks
                .get(&id)
                .is_some_and(|task| task.state == TaskState::Pending);
            if !claimable {
                continue;
            }
            let claimed = inner.claim(&id, now)?;
            drop(inner);
            self.record_transition();
            return Ok(Claim::Task(claimed));
        }

        if let Some((retry_at, _)) = inner.retries.first() {
            let delay = (*retry_at - now).to_std().unwrap_or_default();
            return Ok(Claim::Wait(Some(delay)));
        }

        if inner.claimed.is_empty() {
            Ok(Claim::Drained)
        } else {
            Ok(Claim::Wait(None))
        }
    }

    /// Apply a transition to a task
    pub async fn apply(&self, item_id: &ItemId, transition: Transition) -> Result<Applied> {
        let now = Utc::now();
        let state = {
            let mut inner = self.inner.write().await;
            let LedgerInner {
                tasks,
                pending,
                retries,
                claimed,
                counts,
                ..
            } = &mut *inner;

            let task = tasks
                .get_mut(item_id)
                .ok_or_else(|| Error::other(format!("Unknown item {}", item_id)))?;

            let previous = task.clone();
            task.apply(transition, now)?;
            *counts.bucket(&previous) -= 1;
            *counts.bucket(task) += 1;

            if let Some(retry_at) = previous.retry_at.filter(|_| previous.is_retrying()) {
                retries.remove(&(retry_at, item_id.clone()));
            }

            match task.state {
                TaskState::Pending => {
                    claimed.remove(item_id);
                    pending.push_back(item_id.clone());
                }
                TaskState::Failed => {
                    claimed.remove(item_id);
                    if let Some(retry_at) = task.retry_at {
                        retries.insert((retry_at, item_id.clone()));
                    }
                }
                TaskState::Completed | TaskState::Skipped => {
                    claimed.remove(item_id);
                }
                TaskState::Submitted | TaskState::Polling => {}
            }
            task.state
        };

        let transitions = self.record_transition();
        Ok(Applied { state, transitions })
    }

    /// Give up ownership of an in-flight task without changing its state
    ///
    /// The task is queued as an orphan so it can be continued later.
    pub async fn unclaim(&self, item_id: &ItemId) {
        let mut inner = self.inner.write().await;
        if inner.claimed.remove(item_id) {
            inner.orphans.push_back(item_id.clone());
        } else {
            warn!(item = %item_id, "Unclaim of a task that was not claimed");
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Future that resolves on the next ledger change
    ///
    /// Enable it before calling [`Ledger::claim_next`] so that no wakeup
    /// between the claim and the wait is missed.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Point-in-time copy of the aggregate counts
    pub async fn counts(&self) -> LedgerCounts {
        self.inner.read().await.counts
    }

    /// Copy of one task
    pub async fn get(&self, item_id: &ItemId) -> Option<MigrationTask> {
        self.inner.read().await.tasks.get(item_id).cloned()
    }

    /// Copy of every task, keyed by item
    pub async fn snapshot(&self) -> BTreeMap<ItemId, MigrationTask> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .iter()
            .map(|(id, task)| (id.clone(), task.clone()))
            .collect()
    }

    /// Number of transitions applied since the ledger was built
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Number of tasks
    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    /// Whether the ledger has no tasks
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tasks.is_empty()
    }

    fn record_transition(&self) -> u64 {
        let count = self.transitions.fetch_add(1, Ordering::Relaxed) + 1;
        self.changed.notify_waiters();
        count
    }
}

impl LedgerInner {
    fn claim(&mut self, id: &ItemId, now: DateTime<Utc>) -> Result<ClaimedTask> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::other(format!("Unknown item {}", id)))?;
        let previous = task.clone();
        task.apply(Transition::Claim, now)?;

        let claimed = ClaimedTask {
            item_id: id.clone(),
            attempt: task.attempts,
            job_id: None,
            state: task.state,
        };
        *self.counts.bucket(&previous) -= 1;
        *self.counts.bucket(task) += 1;
        self.claimed.insert(id.clone());
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskError;
    use std::sync::Arc;
    use vaultshift_types::ErrorKind;

    fn tasks(n: usize) -> Vec<MigrationTask> {
        (0..n)
            .map(|i| MigrationTask::new(ItemId::new(format!("arn:rp:{}", i))))
            .collect()
    }

    fn expect_task(claim: Claim) -> ClaimedTask {
        match claim {
            Claim::Task(task) => task,
            other => panic!("expected a task, got {:?}", other),
        }
    }

    fn failed(retry_at: Option<DateTime<Utc>>) -> Transition {
        Transition::Failed {
            error: TaskError {
                kind: ErrorKind::Permanent,
                message: "boom".to_string(),
            },
            retry_at,
        }
    }

    #[tokio::test]
    async fn test_claims_in_inventory_order() {
        let ledger = Ledger::new(tasks(3)).unwrap();
        let now = Utc::now();

        for i in 0..3 {
            let claimed = expect_task(ledger.claim_next(now).await.unwrap());
            assert_eq!(claimed.item_id.as_str(), format!("arn:rp:{}", i));
            assert_eq!(claimed.attempt, 1);
            assert_eq!(claimed.state, TaskState::Submitted);
        }

        assert_eq!(ledger.claim_next(now).await.unwrap(), Claim::Wait(None));
        let counts = ledger.counts().await;
        assert_eq!(counts.submitted, 3);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_drains_after_terminal_transitions() {
        let ledger = Ledger::new(tasks(2)).unwrap();
        let now = Utc::now();

        for _ in 0..2 {
            let claimed = expect_task(ledger.claim_next(now).await.unwrap());
            ledger
                .apply(&claimed.item_id, Transition::JobStarted(CopyJobId::new("j")))
                .await
                .unwrap();
            ledger
                .apply(&claimed.item_id, Transition::Completed)
                .await
                .unwrap();
        }

        assert_eq!(ledger.claim_next(now).await.unwrap(), Claim::Drained);
        let counts = ledger.counts().await;
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.remaining(), 0);
        assert_eq!(ledger.transitions(), 6);
    }

    #[tokio::test]
    async fn test_retry_becomes_claimable_when_due() {
        let ledger = Ledger::new(tasks(1)).unwrap();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);

        let claimed = expect_task(ledger.claim_next(now).await.unwrap());
        ledger
            .apply(&claimed.item_id, failed(Some(later)))
            .await
            .unwrap();
        assert_eq!(ledger.counts().await.retrying, 1);

        match ledger.claim_next(now).await.unwrap() {
            Claim::Wait(Some(delay)) => assert!(delay <= Duration::from_secs(30)),
            other => panic!("expected a timed wait, got {:?}", other),
        }

        let retried = expect_task(ledger.claim_next(later).await.unwrap());
        assert_eq!(retried.attempt, 2);
        assert_eq!(ledger.counts().await.retrying, 0);
    }

    #[tokio::test]
    async fn test_terminal_failure_counts() {
        let ledger = Ledger::new(tasks(1)).unwrap();
        let claimed = expect_task(ledger.claim_next(Utc::now()).await.unwrap());
        ledger.apply(&claimed.item_id, failed(None)).await.unwrap();

        let counts = ledger.counts().await;
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.terminal(), 1);
        assert_eq!(ledger.claim_next(Utc::now()).await.unwrap(), Claim::Drained);
    }

    #[tokio::test]
    async fn test_release_requeues() {
        let ledger = Ledger::new(tasks(1)).unwrap();
        let claimed = expect_task(ledger.claim_next(Utc::now()).await.unwrap());
        ledger
            .apply(&claimed.item_id, Transition::Released)
            .await
            .unwrap();

        let again = expect_task(ledger.claim_next(Utc::now()).await.unwrap());
        assert_eq!(again.item_id, claimed.item_id);
        assert_eq!(again.attempt, 1);
    }

    #[tokio::test]
    async fn test_orphans_are_resumed_first() {
        let mut in_flight = MigrationTask::new(ItemId::new("arn:rp:flight"));
        in_flight.state = TaskState::Polling;
        in_flight.attempts = 1;
        in_flight.job_id = Some(CopyJobId::new("job-9"));

        let mut unsent = MigrationTask::new(ItemId::new("arn:rp:unsent"));
        unsent.state = TaskState::Submitted;
        unsent.attempts = 1;

        let ledger = Ledger::new(vec![unsent, in_flight]).unwrap();
        let counts = ledger.counts().await;
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.polling, 1);

        let first = expect_task(ledger.claim_next(Utc::now()).await.unwrap());
        assert_eq!(first.item_id.as_str(), "arn:rp:flight");
        assert_eq!(first.job_id, Some(CopyJobId::new("job-9")));
        assert_eq!(first.state, TaskState::Polling);

        let second = expect_task(ledger.claim_next(Utc::now()).await.unwrap());
        assert_eq!(second.item_id.as_str(), "arn:rp:unsent");
        assert_eq!(second.attempt, 1);
    }

    #[tokio::test]
    async fn test_unclaim_keeps_state_and_requeues_orphan() {
        let mut in_flight = MigrationTask::new(ItemId::new("arn:rp:flight"));
        in_flight.state = TaskState::Polling;
        in_flight.job_id = Some(CopyJobId::new("job-9"));
        let ledger = Ledger::new(vec![in_flight]).unwrap();

        let claimed = expect_task(ledger.claim_next(Utc::now()).await.unwrap());
        ledger.unclaim(&claimed.item_id).await;

        let task = ledger.get(&claimed.item_id).await.unwrap();
        assert_eq!(task.state, TaskState::Polling);
        assert!(matches!(
            ledger.claim_next(Utc::now()).await.unwrap(),
            Claim::Task(_)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_items_rejected() {
        let mut duplicated = tasks(2);
        duplicated.push(MigrationTask::new(ItemId::new("arn:rp:0")));
        assert!(Ledger::new(duplicated).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let ledger = Arc::new(Ledger::new(tasks(500)).unwrap());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Claim::Task(task) = ledger.claim_next(Utc::now()).await.unwrap() {
                    mine.push(task.item_id);
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "item claimed twice");
            }
        }
        assert_eq!(seen.len(), 500);
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_counts() {
        let ledger = Ledger::new(tasks(1)).unwrap();
        let id = ItemId::new("arn:rp:0");
        let before = ledger.counts().await;

        let err = ledger.apply(&id, Transition::Completed).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(ledger.counts().await, before);
    }
}
