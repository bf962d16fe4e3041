//! Copy orchestration engine for vaultshift
//!
//! This crate drives the migration of recovery points from a source vault to
//! a destination vault, one remote copy job per item, in a run that survives
//! expired credentials, restarts and runtime limits.
//!
//! # Features
//!
//! - **Task Ledger**: one state machine per item, claimed by at most one worker
//! - **State Store**: atomic, versioned state files that a later run resumes
//! - **Credential Lifecycle**: pool-wide pause and single-flight reload on expiry
//! - **Worker Pool**: bounded concurrency with transient and task-level retry
//! - **Shutdown**: signal and runtime-budget stops that leave resumable state
//! - **Progress**: rate and ETA over a trailing window
//! - **Verification**: source and destination vaults compared by resource
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vaultshift_config::Config;
//! use vaultshift_engine::{MigrationEngine, ShutdownCoordinator, SimulatedBackupService, StartMode};
//!
//! # async fn example() -> vaultshift_types::Result<()> {
//! let service = Arc::new(SimulatedBackupService::new(Vec::new()));
//! let engine = MigrationEngine::new(Config::default(), service.clone(), service);
//! let shutdown = ShutdownCoordinator::new();
//! let report = engine.prepare(StartMode::Auto, &shutdown).await?.run().await?;
//! println!("{}", report.summary.format_console_summary());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod credentials;
pub mod engine;
pub mod enrich;
pub mod filter;
pub mod inventory;
pub mod ledger;
pub mod monitor;
pub mod pool;
pub mod retry;
pub mod shutdown;
pub mod simulator;
pub mod state;
pub mod summary;
pub mod task;
pub mod verify;

pub use checkpoint::{CheckpointTrigger, Checkpointer};
pub use credentials::{
    CredentialCoordinator, CredentialSettings, CredentialStats, Lease, OperatorHandle,
    OperatorPrompt,
};
pub use engine::{
    DryRunReport, InventoryListing, MigrationEngine, PreparedRun, RunReport, StartMode,
};
pub use enrich::{EnrichmentStats, MetadataTable, RESOURCE_ARN_COLUMN};
pub use filter::{FilterCriteria, FilterRule, FilterRuleSet, FilterSummary};
pub use ledger::{Claim, ClaimedTask, Ledger, LedgerCounts};
pub use monitor::{ProgressSnapshot, ProgressTracker};
pub use pool::{CopyTarget, PoolReport, PoolSettings, WorkerPool};
pub use shutdown::{RunOutcome, ShutdownCoordinator, StopReason};
pub use simulator::{load_inventory, SimulatedBackupService, SimulatorSettings};
pub use state::{RunContext, RunState, StateStore, SCHEMA_VERSION};
pub use summary::{FailureDetail, SummaryReport};
pub use task::{MigrationTask, TaskError, TaskState, Transition};
pub use verify::{verify_copies, VerificationResult};
