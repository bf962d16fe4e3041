//! Traits at the engine's external boundary
//!
//! The engine never talks to a cloud SDK directly. It is handed a
//! [`BackupClient`] for the remote copy-job protocol, a [`CredentialSource`]
//! for refreshing authentication, and an [`ItemFilter`] for deciding what to
//! copy.

use crate::{CopyJobId, CopyJobRequest, CopyJobStatus, FilterDecision, Item, Page, Result};
use async_trait::async_trait;

/// Remote backup service operations used by the engine
#[async_trait]
pub trait BackupClient: Send + Sync {
    /// List one page of recovery points in `vault`
    async fn list_recovery_points(&self, vault: &str, page_token: Option<String>)
        -> Result<Page<Item>>;

    /// Ask the service to start copying one item
    async fn start_copy_job(&self, request: &CopyJobRequest) -> Result<CopyJobId>;

    /// Query the status of a previously started copy job
    async fn copy_job_status(&self, job_id: &CopyJobId) -> Result<CopyJobStatus>;

    /// Cheap authenticated call used to validate freshly loaded credentials
    async fn check_session(&self) -> Result<()>;
}

/// Source of authentication for a [`BackupClient`]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Discard every cached authenticated session or client handle
    async fn clear_sessions(&self);

    /// Load credentials again from their origin
    async fn reload(&self) -> Result<()>;
}

/// Per-item inclusion decision applied before workers start
pub trait ItemFilter: Send + Sync {
    /// Decide whether `item` is copied
    fn evaluate(&self, item: &Item) -> FilterDecision;
}

/// Filter that includes everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ItemFilter for AcceptAll {
    fn evaluate(&self, _item: &Item) -> FilterDecision {
        FilterDecision::Include
    }
}
