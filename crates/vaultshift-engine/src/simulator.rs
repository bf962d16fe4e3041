//! In-process backup service
//!
//! [`SimulatedBackupService`] implements both [`BackupClient`] and
//! [`CredentialSource`] over an in-memory inventory. It pages listings,
//! completes copy jobs after a number of status polls, de-duplicates
//! submissions by idempotency token and can be told to misbehave. Completed
//! copies show up in listings of their destination vault.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use vaultshift_types::{
    BackupClient, CopyJobId, CopyJobRequest, CopyJobStatus, CredentialSource, Error, Item, ItemId,
    Page, Result,
};

/// Behaviour of a well-behaved simulated service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorSettings {
    /// Items per listing page
    pub page_size: usize,
    /// Status queries a job answers with `InProgress` before completing
    pub polls_to_complete: u32,
    /// Added to every remote call
    pub latency: Duration,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            polls_to_complete: 2,
            latency: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct SimJob {
    item_id: ItemId,
    destination_vault: String,
    polls: u32,
    failure: Option<String>,
    reported: bool,
}

#[derive(Debug, Default)]
struct SimState {
    vaults: HashMap<String, Vec<Item>>,
    jobs: HashMap<CopyJobId, SimJob>,
    tokens: HashMap<String, CopyJobId>,
    submissions: HashMap<ItemId, u32>,
    remote_failures: HashMap<ItemId, u32>,
    throttled: HashMap<ItemId, u32>,
    lost_jobs: HashMap<ItemId, u32>,
    rejected: HashSet<ItemId>,
    status_outages: u32,
    completion_hold: Option<u64>,
    completions: u64,
    next_job: u64,
}

/// Simulated backup service and credential source
#[derive(Debug)]
pub struct SimulatedBackupService {
    settings: SimulatorSettings,
    inventory: Vec<Item>,
    positions: HashMap<ItemId, usize>,
    state: Mutex<SimState>,
    auth_failures: AtomicU32,
    expired: AtomicBool,
    reload_failures: AtomicU32,
    remote_calls: AtomicU64,
    reloads: AtomicU64,
    session_clears: AtomicU64,
    held: Notify,
}

impl SimulatedBackupService {
    /// Create a service holding `inventory` with default settings
    pub fn new(inventory: Vec<Item>) -> Self {
        Self::with_settings(inventory, SimulatorSettings::default())
    }

    /// Create a service with explicit settings
    pub fn with_settings(inventory: Vec<Item>, settings: SimulatorSettings) -> Self {
        let positions = inventory
            .iter()
            .enumerate()
            .map(|(position, item)| (item.id.clone(), position))
            .collect();
        Self {
            settings,
            inventory,
            positions,
            state: Mutex::new(SimState::default()),
            auth_failures: AtomicU32::new(0),
            expired: AtomicBool::new(false),
            reload_failures: AtomicU32::new(0),
            remote_calls: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            session_clears: AtomicU64::new(0),
            held: Notify::new(),
        }
    }

    /// Load the inventory from a JSON array of recovery points
    pub fn from_inventory_file(path: &Path, settings: SimulatorSettings) -> Result<Self> {
        Ok(Self::with_settings(load_inventory(path)?, settings))
    }

    /// Items the service lists for any vault it holds no copies for
    pub fn inventory(&self) -> &[Item] {
        &self.inventory
    }

    /// Seed the listing of `vault`, replacing whatever it held
    pub fn seed_vault(&self, vault: impl Into<String>, items: Vec<Item>) {
        self.lock().vaults.insert(vault.into(), items);
    }

    /// Recovery points currently held by `vault`, if it has been seeded or copied into
    pub fn vault_items(&self, vault: &str) -> Option<Vec<Item>> {
        self.lock().vaults.get(vault).cloned()
    }

    /// Fail the next `count` remote calls, session checks included, with an auth error
    pub fn fail_next_calls_with_auth(&self, count: u32) {
        self.auth_failures.store(count, Ordering::SeqCst);
    }

    /// Fail every remote call with an auth error until credentials are reloaded
    pub fn expire_credentials(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` credential reloads
    pub fn fail_reloads(&self, count: u32) {
        self.reload_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` copy jobs of `item` fail remotely
    pub fn fail_jobs(&self, item: &ItemId, count: u32) {
        self.lock().remote_failures.insert(item.clone(), count);
    }

    /// Throttle the next `count` submissions of `item`
    pub fn throttle_submissions(&self, item: &ItemId, count: u32) {
        self.lock().throttled.insert(item.clone(), count);
    }

    /// Answer the next `count` status queries for jobs of `item` with not-found
    pub fn lose_jobs(&self, item: &ItemId, count: u32) {
        self.lock().lost_jobs.insert(item.clone(), count);
    }

    /// Reject every submission of `item` as invalid
    pub fn reject(&self, item: &ItemId) {
        self.lock().rejected.insert(item.clone());
    }

    /// Answer the next `count` status queries with a throttling error
    pub fn status_outage(&self, count: u32) {
        self.lock().status_outages = count;
    }

    /// Report at most `limit` completions until [`Self::release_completions`]
    pub fn hold_completions_after(&self, limit: u64) {
        self.lock().completion_hold = Some(limit);
    }

    /// Lift a completion hold
    pub fn release_completions(&self) {
        self.lock().completion_hold = None;
    }

    /// Wait until a completion hold has been reached
    pub async fn completions_held(&self) {
        loop {
            let notified = self.held.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state
                    .completion_hold
                    .is_some_and(|limit| state.completions >= limit)
                {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Jobs reported as completed so far
    pub fn completions(&self) -> u64 {
        self.lock().completions
    }

    /// Accepted submissions of one item, duplicates by token excluded
    pub fn submissions(&self, item: &ItemId) -> u32 {
        self.lock().submissions.get(item).copied().unwrap_or(0)
    }

    /// Accepted submissions across all items
    pub fn total_submissions(&self) -> u64 {
        self.lock().submissions.values().map(|&n| u64::from(n)).sum()
    }

    /// Highest submission count of any single item
    pub fn max_submissions(&self) -> u32 {
        self.lock().submissions.values().copied().max().unwrap_or(0)
    }

    /// Remote calls received, failed ones included
    pub fn remote_calls(&self) -> u64 {
        self.remote_calls.load(Ordering::SeqCst)
    }

    /// Credential reloads received
    pub fn reload_calls(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Times cached sessions were cleared
    pub fn session_clears(&self) -> u64 {
        self.session_clears.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        self.remote_calls.fetch_add(1, Ordering::SeqCst);
        if self.settings.latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.settings.latency).await;
        }
        if self.expired.load(Ordering::SeqCst) || take_one(&self.auth_failures) {
            debug!(operation, "Simulated expired token");
            return Err(Error::from_service_code(
                "ExpiredTokenException",
                format!("{operation}: the security token included in the request is expired"),
            ));
        }
        Ok(())
    }
}

/// Read a JSON array of recovery points
pub fn load_inventory(path: &Path) -> Result<Vec<Item>> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::config(format!("Invalid inventory file {}: {e}", path.display())))
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn take_from(map: &mut HashMap<ItemId, u32>, item: &ItemId) -> bool {
    match map.get_mut(item) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl BackupClient for SimulatedBackupService {
    async fn list_recovery_points(
        &self,
        vault: &str,
        page_token: Option<String>,
    ) -> Result<Page<Item>> {
        self.enter("list_recovery_points").await?;
        let start = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::permanent(format!("Invalid page token: {token}")))?,
            None => 0,
        };
        let page_size = self.settings.page_size.max(1);
        let state = self.lock();
        let listed = state.vaults.get(vault).map_or(self.inventory.as_slice(), Vec::as_slice);
        let items: Vec<Item> = listed
            .iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .map(|mut item| {
                if item.vault_name.is_empty() {
                    item.vault_name = vault.to_string();
                }
                item
            })
            .collect();
        let end = start + items.len();
        let next_token = (end < listed.len()).then(|| end.to_string());
        Ok(Page { items, next_token })
    }

    async fn start_copy_job(&self, request: &CopyJobRequest) -> Result<CopyJobId> {
        self.enter("start_copy_job").await?;
        let mut state = self.lock();

        if let Some(existing) = state.tokens.get(&request.idempotency_token) {
            return Ok(existing.clone());
        }
        if state.rejected.contains(&request.item_id) {
            return Err(Error::from_service_code(
                "InvalidParameterValueException",
                format!("{} cannot be copied", request.item_id),
            ));
        }
        if take_from(&mut state.throttled, &request.item_id) {
            return Err(Error::from_service_code(
                "ThrottlingException",
                "Rate exceeded",
            ));
        }

        state
            .vaults
            .entry(request.destination_vault.clone())
            .or_default();
        state.next_job += 1;
        let job_id = CopyJobId::new(format!("copy-job-{:06}", state.next_job));
        let failure = take_from(&mut state.remote_failures, &request.item_id)
            .then(|| "Copy job failed in destination vault".to_string());
        state.jobs.insert(
            job_id.clone(),
            SimJob {
                item_id: request.item_id.clone(),
                destination_vault: request.destination_vault.clone(),
                polls: 0,
                failure,
                reported: false,
            },
        );
        state
            .tokens
            .insert(request.idempotency_token.clone(), job_id.clone());
        *state.submissions.entry(request.item_id.clone()).or_insert(0) += 1;
        Ok(job_id)
    }

    async fn copy_job_status(&self, job_id: &CopyJobId) -> Result<CopyJobStatus> {
        self.enter("copy_job_status").await?;
        let mut state = self.lock();

        if state.status_outages > 0 {
            state.status_outages -= 1;
            return Err(Error::from_service_code(
                "ServiceUnavailableException",
                "Service temporarily unavailable",
            ));
        }

        let owner = state.jobs.get(job_id).map(|job| job.item_id.clone());
        if let Some(item) = owner {
            if take_from(&mut state.lost_jobs, &item) {
                return Err(Error::from_service_code(
                    "ResourceNotFoundException",
                    format!("Copy job {job_id} not found"),
                ));
            }
        }

        let hold_reached = state
            .completion_hold
            .is_some_and(|limit| state.completions >= limit);
        let polls_to_complete = self.settings.polls_to_complete;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Err(Error::from_service_code(
                "ResourceNotFoundException",
                format!("Copy job {job_id} not found"),
            ));
        };

        if job.polls < polls_to_complete {
            job.polls += 1;
            return Ok(CopyJobStatus::InProgress);
        }
        if let Some(reason) = &job.failure {
            return Ok(CopyJobStatus::Failed {
                reason: reason.clone(),
            });
        }
        if job.reported {
            return Ok(CopyJobStatus::Completed);
        }
        if hold_reached {
            return Ok(CopyJobStatus::InProgress);
        }

        job.reported = true;
        debug!(item = %job.item_id, job = %job_id, "Simulated copy completed");
        let copy = self.positions.get(&job.item_id).map(|&position| {
            let source = &self.inventory[position];
            Item {
                id: ItemId::new(format!("{}:{}", job.destination_vault, source.id)),
                vault_name: job.destination_vault.clone(),
                ..source.clone()
            }
        });
        let destination = job.destination_vault.clone();
        state.completions += 1;
        state.vaults.entry(destination).or_default().extend(copy);
        let reached = state
            .completion_hold
            .is_some_and(|limit| state.completions >= limit);
        drop(state);
        if reached {
            self.held.notify_waiters();
        }
        Ok(CopyJobStatus::Completed)
    }

    async fn check_session(&self) -> Result<()> {
        self.enter("check_session").await
    }
}

#[async_trait]
impl CredentialSource for SimulatedBackupService {
    async fn clear_sessions(&self) {
        self.session_clears.fetch_add(1, Ordering::SeqCst);
    }

    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.reload_failures) {
            return Err(Error::auth("Unable to locate credentials"));
        }
        self.expired.store(false, Ordering::SeqCst);
        Ok(())
    }
}
