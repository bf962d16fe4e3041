//! Migration task records and their state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use vaultshift_types::{CopyJobId, Error, ErrorKind, ItemId, Result};

/// Lifecycle state of a migration task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker; the copy job may not exist yet
    Submitted,
    /// The copy job exists and is being polled
    Polling,
    /// The copy finished
    Completed,
    /// The copy failed; claimable again if a retry is scheduled
    Failed,
    /// Excluded before the run started
    Skipped,
}

impl TaskState {
    /// Whether a worker currently owns tasks in this state
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Submitted | Self::Polling)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Submitted => "SUBMITTED",
            Self::Polling => "POLLING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(label)
    }
}

/// Last error recorded on a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Classification of the error
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

impl From<&Error> for TaskError {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// A requested change to a task
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A worker takes ownership and starts a new attempt
    Claim,
    /// The service accepted the copy request
    JobStarted(CopyJobId),
    /// The first poll reported the job as running
    Polling,
    /// The job finished
    Completed,
    /// The attempt failed; `retry_at` schedules another one
    Failed {
        /// Error that ended the attempt
        error: TaskError,
        /// When the task becomes claimable again, `None` if terminal
        retry_at: Option<DateTime<Utc>>,
    },
    /// Ownership is given back before any copy job was created
    Released,
    /// Excluded from the run
    Skip(String),
}

impl Transition {
    fn target(&self) -> TaskState {
        match self {
            Self::Claim | Self::JobStarted(_) => TaskState::Submitted,
            Self::Polling => TaskState::Polling,
            Self::Completed => TaskState::Completed,
            Self::Failed { .. } => TaskState::Failed,
            Self::Released => TaskState::Pending,
            Self::Skip(_) => TaskState::Skipped,
        }
    }
}

/// The mutable migration record of one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationTask {
    /// Item this task migrates
    pub item_id: ItemId,
    /// Current state
    pub state: TaskState,
    /// Remote copy job, once the service accepted the request
    #[serde(default)]
    pub job_id: Option<CopyJobId>,
    /// Copy attempts started so far
    #[serde(default)]
    pub attempts: u32,
    /// Error of the most recent failed attempt
    #[serde(default)]
    pub last_error: Option<TaskError>,
    /// Start of the current attempt
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// When a failed task may be claimed again
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    /// Why the task was skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl MigrationTask {
    /// Create a pending task for an item
    pub fn new(item_id: ItemId) -> Self {
        Self {
            item_id,
            state: TaskState::Pending,
            job_id: None,
            attempts: 0,
            last_error: None,
            submitted_at: None,
            completed_at: None,
            retry_at: None,
            skip_reason: None,
        }
    }

    /// Whether no further work will happen for this task
    pub fn is_terminal(&self) -> bool {
        match self.state {
            TaskState::Completed | TaskState::Skipped => true,
            TaskState::Failed => self.retry_at.is_none(),
            TaskState::Pending | TaskState::Submitted | TaskState::Polling => false,
        }
    }

    /// Whether the task is failed with a retry scheduled
    pub fn is_retrying(&self) -> bool {
        self.state == TaskState::Failed && self.retry_at.is_some()
    }

    /// Apply a transition, rejecting edges the state machine does not have
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<()> {
        let target = transition.target();
        match (self.state, transition) {
            (TaskState::Pending, Transition::Claim) => {
                self.start_attempt(now);
            }
            (TaskState::Failed, Transition::Claim) if self.retry_at.is_some() => {
                self.job_id = None;
                self.start_attempt(now);
            }
            (TaskState::Submitted, Transition::JobStarted(job_id)) if self.job_id.is_none() => {
                self.job_id = Some(job_id);
            }
            (TaskState::Submitted, Transition::Polling) if self.job_id.is_some() => {
                self.state = TaskState::Polling;
            }
            (TaskState::Submitted | TaskState::Polling, Transition::Completed) => {
                self.state = TaskState::Completed;
                self.completed_at = Some(now);
                self.retry_at = None;
            }
            (TaskState::Submitted | TaskState::Polling, Transition::Failed { error, retry_at }) => {
                self.state = TaskState::Failed;
                self.last_error = Some(error);
                self.retry_at = retry_at;
                if retry_at.is_none() {
                    self.completed_at = Some(now);
                }
            }
            (TaskState::Submitted, Transition::Released) if self.job_id.is_none() => {
                self.state = TaskState::Pending;
                self.attempts = self.attempts.saturating_sub(1);
                self.submitted_at = None;
            }
            (TaskState::Pending, Transition::Skip(reason)) => {
                self.state = TaskState::Skipped;
                self.skip_reason = Some(reason);
                self.completed_at = Some(now);
            }
            (from, _) => {
                return Err(Error::InvalidTransition {
                    item: self.item_id.to_string(),
                    from: from.to_string(),
                    to: target.to_string(),
                });
            }
        }
        Ok(())
    }

    fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Submitted;
        self.attempts += 1;
        self.retry_at = None;
        self.submitted_at = Some(now);
    }
}
