//! Core data types for vaultshift
//!
//! Items are the immutable inventory records loaded from the source vault; copy
//! jobs are the remote units of work the engine requests and polls for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Bytes per gigabyte, as used for size filters and reports
pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Identity of an item: the recovery point reference
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Create a new item identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a remote copy job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CopyJobId(String);

impl CopyJobId {
    /// Create a new copy job identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CopyJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a recovery point in the source vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPointStatus {
    /// Backup finished; the only copyable status
    #[default]
    Completed,
    /// Backup finished with missing parts
    Partial,
    /// Being deleted
    Deleting,
    /// Past its retention period
    Expired,
    /// Any status this build does not know about
    #[serde(other)]
    Unknown,
}

impl fmt::Display for RecoveryPointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Deleting => "DELETING",
            Self::Expired => "EXPIRED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// One immutable backup snapshot in the source vault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Recovery point reference, unique within the inventory
    #[serde(rename = "recoveryPointArn")]
    pub id: ItemId,
    /// Vault holding the recovery point
    #[serde(rename = "backupVaultName", default)]
    pub vault_name: String,
    /// Reference of the backed-up resource
    #[serde(default)]
    pub resource_arn: String,
    /// Kind of the backed-up resource (EBS, RDS, EFS, ...)
    #[serde(default)]
    pub resource_type: String,
    /// Size of the snapshot in bytes
    #[serde(default)]
    pub size_bytes: u64,
    /// When the snapshot was created
    #[serde(default)]
    pub creation_date: Option<DateTime<Utc>>,
    /// When the backup job finished
    #[serde(default)]
    pub completion_date: Option<DateTime<Utc>>,
    /// Remote lifecycle status
    #[serde(default)]
    pub status: RecoveryPointStatus,
    /// Enrichment attributes joined onto the item before filtering
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Item {
    /// Create a completed item with the given identity and resource
    pub fn new(id: impl Into<ItemId>, resource_arn: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            vault_name: String::new(),
            resource_arn: resource_arn.into(),
            resource_type: String::new(),
            size_bytes: 0,
            creation_date: Some(now),
            completion_date: Some(now),
            status: RecoveryPointStatus::Completed,
            attributes: BTreeMap::new(),
        }
    }

    /// A snapshot can only be copied once its backup has completed
    pub fn is_copyable(&self) -> bool {
        self.status == RecoveryPointStatus::Completed && self.completion_date.is_some()
    }

    /// Size in gigabytes
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / BYTES_PER_GB
    }

    /// Whole days between creation and `now`, if the creation time is known
    pub fn age_days(&self, now: DateTime<Utc>) -> Option<i64> {
        self.creation_date.map(|created| (now - created).num_days())
    }

    /// Look up an enrichment attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Everything the service needs to start copying one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyJobRequest {
    /// Item being copied
    pub item_id: ItemId,
    /// Source vault name
    pub source_vault: String,
    /// Destination vault reference
    pub destination_vault: String,
    /// Role the service assumes for the copy, if any
    pub iam_role: Option<String>,
    /// Token that lets the service de-duplicate a resubmitted request
    pub idempotency_token: String,
}

/// Remote status of a copy job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CopyJobStatus {
    /// CREATED or RUNNING
    InProgress,
    /// The copy finished
    Completed,
    /// The copy failed remotely
    Failed {
        /// Reason reported by the service
        reason: String,
    },
}

impl CopyJobStatus {
    /// Map a raw service state onto a status
    pub fn from_remote(state: &str, message: Option<&str>) -> Self {
        match state {
            "COMPLETED" => Self::Completed,
            "FAILED" | "ABORTED" | "PARTIAL" => Self::Failed {
                reason: message.unwrap_or(state).to_string(),
            },
            _ => Self::InProgress,
        }
    }

    /// Whether polling can stop
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One page of a paginated listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Entries on this page
    pub items: Vec<T>,
    /// Token for the next page, `None` on the last page
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// A page with no successor
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// Outcome of a filter evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Copy the item
    Include,
    /// Skip the item, with a reason recorded on its task
    Exclude(String),
}

impl FilterDecision {
    /// Whether the item is included
    pub fn is_included(&self) -> bool {
        matches!(self, Self::Include)
    }
}
