//! Run orchestration: load or build the ledger, drive the pool, report
//!
//! A run is prepared first. Preparation either lists the source vault and
//! builds a fresh [`RunState`], or loads an existing one and re-queries the
//! copy jobs that were in flight when it was last saved. The prepared run is
//! then executed under a [`ShutdownCoordinator`].

use crate::checkpoint::Checkpointer;
use crate::credentials::{CredentialCoordinator, CredentialSettings, CredentialStats};
use crate::enrich::{EnrichmentStats, MetadataTable};
use crate::filter::FilterSummary;
use crate::inventory::{collect_inventory, recovery_points};
use crate::ledger::{Ledger, LedgerCounts};
use crate::pool::{CopyTarget, PoolReport, PoolSettings, WorkerPool};
use crate::retry::call_with_retry;
use crate::shutdown::{RunOutcome, ShutdownCoordinator};
use crate::state::{RunContext, RunState, StateStore};
use crate::summary::SummaryReport;
use crate::task::{TaskError, Transition};
use crate::verify::{verify_copies, VerificationResult};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;
use vaultshift_config::Config;
use vaultshift_types::{
    AcceptAll, BackupClient, CopyJobId, CopyJobStatus, CredentialSource, Error, FilterDecision,
    Item, ItemFilter, ItemId, Result, BYTES_PER_GB,
};

/// How to treat an existing state file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartMode {
    /// Resume when a state file exists, start fresh otherwise
    #[default]
    Auto,
    /// Resume, failing when there is nothing to resume
    Resume,
    /// Ignore any existing state and start fresh
    Reset,
}

/// Entry point of the copy orchestration engine
pub struct MigrationEngine {
    config: Config,
    client: Arc<dyn BackupClient>,
    credential_source: Arc<dyn CredentialSource>,
    filter: Arc<dyn ItemFilter>,
    metadata: Option<MetadataTable>,
}

impl MigrationEngine {
    /// Create an engine that copies every copyable item
    pub fn new(
        config: Config,
        client: Arc<dyn BackupClient>,
        credential_source: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            config,
            client,
            credential_source,
            filter: Arc::new(AcceptAll),
            metadata: None,
        }
    }

    /// Decide per item whether it is copied
    pub fn with_filter(mut self, filter: Arc<dyn ItemFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Enrich listed items with attributes before filtering
    pub fn with_metadata(mut self, metadata: MetadataTable) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Configuration the engine runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load or build the run state and the ledger
    ///
    /// Fails before any copy is attempted if the configuration is incomplete
    /// or the state file is corrupt or from another schema.
    pub async fn prepare(
        &self,
        mode: StartMode,
        shutdown: &ShutdownCoordinator,
    ) -> Result<PreparedRun> {
        self.config.migration.require_endpoints()?;
        let pool_settings = PoolSettings::from_config(&self.config)?;
        let credentials = Arc::new(self.credentials(shutdown));

        let migration = &self.config.migration;
        let context = RunContext {
            source_account: migration.source_account.clone(),
            dest_account: migration.dest_account.clone(),
            source_vault: migration.source_vault.clone(),
            dest_vault: migration.dest_vault.clone(),
        };
        let existing = self.existing_state_path(&context)?;

        let (state, path, resumed, enrichment, filter_summary) = match (mode, existing) {
            (StartMode::Resume, None) => {
                return Err(Error::config(format!(
                    "No state file to resume for account {} vault {}",
                    context.source_account, context.source_vault
                )));
            }
            (StartMode::Auto | StartMode::Resume, Some(path)) => {
                let mut state = StateStore::load_from(&path)?;
                if state.context.source_account != context.source_account
                    || state.context.source_vault != context.source_vault
                {
                    return Err(Error::config(format!(
                        "State file {} belongs to account {} vault {}",
                        path.display(),
                        state.context.source_account,
                        state.context.source_vault
                    )));
                }
                self.reconcile(&mut state, &credentials, &pool_settings, shutdown)
                    .await?;
                (state, path, true, None, None)
            }
            (StartMode::Reset, existing) | (StartMode::Auto, existing @ None) => {
                if let Some(path) = &existing {
                    info!(path = %path.display(), "Ignoring existing state, starting fresh");
                }
                let (state, enrichment, summary) = self
                    .build_fresh(context, &credentials, &pool_settings, shutdown)
                    .await?;
                let path = self.config.state.state_file.clone().unwrap_or_else(|| {
                    self.config
                        .state
                        .state_dir
                        .join(StateStore::default_file_name(&state.context, state.created_at))
                });
                (state, path, false, enrichment, Some(summary))
            }
        };

        let ledger = Arc::new(Ledger::new(state.tasks.values().cloned())?);
        let counts = ledger.counts().await;
        info!(
            run_id = %state.run_id,
            resumed,
            total = counts.total(),
            pending = counts.pending,
            in_flight = counts.in_progress(),
            completed = counts.completed,
            skipped = counts.skipped,
            "Run prepared"
        );

        Ok(PreparedRun {
            target: CopyTarget {
                source_vault: state.context.source_vault.clone(),
                destination_vault: state.context.dest_vault.clone(),
                iam_role: migration.iam_role.clone(),
            },
            state,
            ledger,
            store: StateStore::new(path),
            credentials,
            client: Arc::clone(&self.client),
            shutdown: shutdown.clone(),
            pool_settings,
            timing: RunTiming::from_config(&self.config),
            resumed,
            enrichment,
            filter_summary,
        })
    }

    /// List the source vault, enriched with metadata when a table is attached
    pub async fn list_inventory(&self, shutdown: &ShutdownCoordinator) -> Result<InventoryListing> {
        let vault = &self.config.migration.source_vault;
        if vault.trim().is_empty() {
            return Err(Error::config("Missing required configuration: migration.source_vault"));
        }
        let credentials = self.credentials(shutdown);
        let policy = self.config.retry.transient()?;
        let cancel = shutdown.token();

        let mut items = collect_inventory(recovery_points(
            self.client.as_ref(),
            &credentials,
            &policy,
            &cancel,
            vault,
        ))
        .await?;
        let enrichment = self.metadata.as_ref().map(|table| table.enrich(&mut items));

        Ok(InventoryListing {
            vault: vault.clone(),
            total_size_gb: items.iter().map(|i| i.size_bytes).sum::<u64>() as f64 / BYTES_PER_GB,
            items,
            enrichment,
        })
    }

    /// Compare the destination vault against the source by resource
    pub async fn verify(&self, shutdown: &ShutdownCoordinator) -> Result<VerificationResult> {
        self.config.migration.require_endpoints()?;
        let migration = &self.config.migration;
        verify_copies(
            self.client.as_ref(),
            &self.credentials(shutdown),
            &self.config.retry.transient()?,
            &shutdown.token(),
            &migration.source_vault,
            &migration.dest_vault,
        )
        .await
    }

    fn credentials(&self, shutdown: &ShutdownCoordinator) -> CredentialCoordinator {
        CredentialCoordinator::new(
            Arc::clone(&self.client),
            Arc::clone(&self.credential_source),
            CredentialSettings::from_config(&self.config),
            shutdown.token(),
        )
    }

    fn existing_state_path(&self, context: &RunContext) -> Result<Option<PathBuf>> {
        match &self.config.state.state_file {
            Some(path) if path.is_file() => Ok(Some(path.clone())),
            Some(_) => Ok(None),
            None => StateStore::discover_latest(&self.config.state.state_dir, context),
        }
    }

    async fn build_fresh(
        &self,
        context: RunContext,
        credentials: &CredentialCoordinator,
        pool_settings: &PoolSettings,
        shutdown: &ShutdownCoordinator,
    ) -> Result<(RunState, Option<EnrichmentStats>, FilterSummary)> {
        info!(vault = %context.source_vault, "Listing recovery points");
        let cancel = shutdown.token();
        let mut items = collect_inventory(recovery_points(
            self.client.as_ref(),
            credentials,
            &pool_settings.transient_retry,
            &cancel,
            &context.source_vault,
        ))
        .await?;

        let enrichment = self.metadata.as_ref().map(|table| {
            let stats = table.enrich(&mut items);
            info!(
                enriched = stats.enriched_count,
                missing = stats.missing_count,
                "Metadata applied"
            );
            stats
        });

        let copyable: Vec<_> = items.iter().filter(|i| i.is_copyable()).cloned().collect();
        let filter_summary = FilterSummary::of(self.filter.as_ref(), &copyable);

        let mut state = RunState::new(context, items);
        let now = Utc::now();
        for item in &state.inventory {
            let decision = if item.is_copyable() {
                self.filter.evaluate(item)
            } else {
                FilterDecision::Exclude(format!("Recovery point not copyable: {}", item.status))
            };
            if let FilterDecision::Exclude(reason) = decision {
                if let Some(task) = state.tasks.get_mut(&item.id) {
                    task.apply(Transition::Skip(reason), now)?;
                }
            }
        }
        Ok((state, enrichment, filter_summary))
    }

    /// Re-query copy jobs that were in flight when the state was saved
    async fn reconcile(
        &self,
        state: &mut RunState,
        credentials: &CredentialCoordinator,
        pool_settings: &PoolSettings,
        shutdown: &ShutdownCoordinator,
    ) -> Result<()> {
        let in_flight: Vec<(ItemId, CopyJobId)> = state
            .tasks
            .values()
            .filter(|task| task.state.is_in_flight())
            .filter_map(|task| task.job_id.clone().map(|job| (task.item_id.clone(), job)))
            .collect();
        if in_flight.is_empty() {
            return Ok(());
        }
        info!(jobs = in_flight.len(), "Re-querying copy jobs left in flight");

        let cancel = shutdown.token();
        let client = self.client.as_ref();
        let policy = &pool_settings.transient_retry;
        let cancel = &cancel;
        let statuses: Vec<(ItemId, Result<CopyJobStatus>)> = stream::iter(in_flight)
            .map(|(item_id, job_id)| async move {
                let job = &job_id;
                let status = call_with_retry(credentials, policy, cancel, "copy_job_status", move || {
                    client.copy_job_status(job)
                })
                .await;
                (item_id, status)
            })
            .buffer_unordered(pool_settings.workers.get())
            .collect()
            .await;

        let now = Utc::now();
        let (mut completed, mut failed) = (0usize, 0usize);
        for (item_id, status) in statuses {
            let Some(task) = state.tasks.get_mut(&item_id) else {
                continue;
            };
            match status {
                Ok(CopyJobStatus::Completed) => {
                    task.apply(Transition::Completed, now)?;
                    completed += 1;
                }
                Ok(CopyJobStatus::Failed { reason }) => {
                    let task_policy = &pool_settings.task_retry;
                    let retry_at = if task_policy.allows_another(task.attempts) {
                        chrono::Duration::from_std(task_policy.delay_after(task.attempts))
                            .ok()
                            .map(|delay| now + delay)
                    } else {
                        None
                    };
                    let error = Error::permanent(format!("Copy job failed: {reason}"));
                    task.apply(
                        Transition::Failed {
                            error: TaskError::from(&error),
                            retry_at,
                        },
                        now,
                    )?;
                    failed += 1;
                }
                Ok(CopyJobStatus::InProgress) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(item = %item_id, error = %e, "Could not re-query copy job, polling it again");
                }
            }
        }
        info!(completed, failed, "In-flight jobs reconciled");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct RunTiming {
    grace_period: Duration,
    checkpoint_interval: Duration,
    max_runtime: Option<Duration>,
    safety_margin: Duration,
}

impl RunTiming {
    fn from_config(config: &Config) -> Self {
        Self {
            grace_period: config.runtime.grace_period(),
            checkpoint_interval: config.pool.checkpoint_interval(),
            max_runtime: config.runtime.max_runtime(),
            safety_margin: ShutdownCoordinator::safety_margin(
                config.pool.poll_interval(),
                config.runtime.min_safety_margin(),
            ),
        }
    }
}

/// A run whose ledger is built and ready to execute
pub struct PreparedRun {
    state: RunState,
    ledger: Arc<Ledger>,
    store: StateStore,
    credentials: Arc<CredentialCoordinator>,
    client: Arc<dyn BackupClient>,
    shutdown: ShutdownCoordinator,
    pool_settings: PoolSettings,
    target: CopyTarget,
    timing: RunTiming,
    resumed: bool,
    enrichment: Option<EnrichmentStats>,
    filter_summary: Option<FilterSummary>,
}

/// What a dry run would do
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunReport {
    /// Items in the inventory
    pub total_items: u64,
    /// Items a real run would copy
    pub to_copy: u64,
    /// Size of the items to copy
    pub to_copy_size_gb: f64,
    /// Items already completed by an earlier run
    pub already_completed: u64,
    /// Items excluded by copyability or filters
    pub skipped: u64,
    /// Filter statistics of a fresh run
    pub filter: Option<FilterSummary>,
    /// Enrichment statistics of a fresh run
    pub enrichment: Option<EnrichmentStats>,
    /// Where the state file would be written
    pub state_path: PathBuf,
}

/// Recovery points of the source vault
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventoryListing {
    /// Vault that was listed
    pub vault: String,
    /// Listed recovery points, enriched when metadata was attached
    pub items: Vec<Item>,
    /// Size of all listed recovery points
    pub total_size_gb: f64,
    /// Enrichment statistics, when metadata was attached
    pub enrichment: Option<EnrichmentStats>,
}

/// Result of an executed run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run identity
    pub run_id: Uuid,
    /// Final classification
    pub outcome: RunOutcome,
    /// Final counts
    pub counts: LedgerCounts,
    /// Totals and failures
    pub summary: SummaryReport,
    /// State file holding the final state
    pub state_path: PathBuf,
    /// Whether the run continued an earlier one
    pub resumed: bool,
    /// Pool activity
    pub pool: PoolReport,
    /// Credential activity
    pub credentials: CredentialStats,
}

impl PreparedRun {
    /// Ledger of the run, for progress observers
    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    /// Credential coordinator, for operator prompts
    pub fn credentials(&self) -> Arc<CredentialCoordinator> {
        Arc::clone(&self.credentials)
    }

    /// Run identity
    pub fn run_id(&self) -> Uuid {
        self.state.run_id
    }

    /// State file the run writes
    pub fn state_path(&self) -> &Path {
        self.store.path()
    }

    /// Whether an earlier run is being continued
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Enrichment statistics of a fresh run
    pub fn enrichment(&self) -> Option<EnrichmentStats> {
        self.enrichment
    }

    /// Report what a run would do without starting any copy job
    pub async fn dry_run(&self) -> DryRunReport {
        let counts = self.ledger.counts().await;
        let tasks = self.ledger.snapshot().await;
        let to_copy_bytes: u64 = self
            .state
            .inventory
            .iter()
            .filter(|item| tasks.get(&item.id).is_some_and(|task| !task.is_terminal()))
            .map(|item| item.size_bytes)
            .sum();

        DryRunReport {
            total_items: counts.total(),
            to_copy: counts.remaining(),
            to_copy_size_gb: to_copy_bytes as f64 / BYTES_PER_GB,
            already_completed: counts.completed,
            skipped: counts.skipped,
            filter: self.filter_summary.clone(),
            enrichment: self.enrichment,
            state_path: self.store.path().to_path_buf(),
        }
    }

    /// Persist the state, run the pool to completion or stop, persist again
    pub async fn run(self) -> Result<RunReport> {
        let started = Utc::now();
        let run_id = self.state.run_id;
        let checkpointer = Arc::new(Checkpointer::new(
            Arc::clone(&self.ledger),
            self.store.clone(),
            self.state,
        ));
        checkpointer.save().await?;
        info!(path = %self.store.path().display(), "State file written");

        let watchers = self
            .shutdown
            .watch(self.timing.max_runtime, self.timing.safety_margin);
        let checkpoint_stop = tokio_util::sync::CancellationToken::new();
        let background = checkpointer.spawn(self.timing.checkpoint_interval, checkpoint_stop.clone());

        let pool = WorkerPool::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.client),
            Arc::clone(&self.credentials),
            self.pool_settings,
            self.target,
            run_id,
            checkpointer.trigger(),
            self.shutdown.token(),
        );
        let pool_report = pool.run(self.timing.grace_period).await;

        checkpoint_stop.cancel();
        if let Err(e) = background.await {
            warn!(error = %e, "Checkpoint task ended abnormally");
        }
        for watcher in watchers {
            watcher.abort();
        }
        checkpointer.save().await?;

        let counts = self.ledger.counts().await;
        let tasks = self.ledger.snapshot().await;
        let stop = self.shutdown.reason();
        if stop.is_none() && counts.remaining() > 0 {
            warn!(
                remaining = counts.remaining(),
                "Workers stopped before the ledger drained"
            );
        }
        let outcome = RunOutcome::classify(&counts, stop);
        let summary = SummaryReport::from_tasks(tasks.values(), started, Utc::now());
        info!(
            %outcome,
            completed = counts.completed,
            failed = counts.failed,
            skipped = counts.skipped,
            remaining = counts.remaining(),
            path = %self.store.path().display(),
            "Run finished"
        );

        Ok(RunReport {
            run_id,
            outcome,
            counts,
            summary,
            state_path: self.store.path().to_path_buf(),
            resumed: self.resumed,
            pool: pool_report,
            credentials: self.credentials.stats(),
        })
    }
}
