//! vaultshift integration testing support
//!
//! Fixtures shared by the scenario tests: inventories, a configuration with
//! millisecond delays, and a [`Harness`] that runs the engine against a
//! [`SimulatedBackupService`] in a temporary state directory.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use vaultshift_config::Config;
use vaultshift_engine::{
    MigrationEngine, PreparedRun, RunReport, RunState, ShutdownCoordinator, SimulatedBackupService,
    SimulatorSettings, StartMode, StateStore,
};
use vaultshift_types::{Item, ItemId, Result};

/// Source account used by every fixture
pub const SOURCE_ACCOUNT: &str = "111111111111";
/// Source vault used by every fixture
pub const SOURCE_VAULT: &str = "prod-vault";

/// `count` copyable items with alternating resource types
pub fn inventory(count: usize) -> Vec<Item> {
    (0..count)
        .map(|i| {
            let mut item = Item::new(item_id(i), format!("arn:aws:ec2:volume/vol-{i:04}"));
            item.resource_type = if i % 2 == 0 { "EBS" } else { "RDS" }.to_string();
            item.size_bytes = (i as u64 + 1) * 1024 * 1024 * 1024;
            item
        })
        .collect()
}

/// Identity of the `index`-th fixture item
pub fn item_id(index: usize) -> ItemId {
    ItemId::new(format!("arn:aws:backup:recovery-point:{index:04}"))
}

/// Configuration with `workers` workers and near-zero delays
pub fn fast_config(state_dir: PathBuf, workers: usize) -> Config {
    let mut config = Config::default();
    config.migration.source_account = SOURCE_ACCOUNT.to_string();
    config.migration.dest_account = "222222222222".to_string();
    config.migration.source_vault = SOURCE_VAULT.to_string();
    config.migration.dest_vault = "arn:aws:backup:vault/dr-vault".to_string();
    config.pool.workers = workers;
    config.pool.poll_interval_secs = 0;
    config.pool.save_every_transitions = 10;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_secs = 1;
    config.credentials.reload_delays_secs = vec![0];
    config.runtime.grace_period_secs = 5;
    config.runtime.min_safety_margin_secs = 0;
    config.state.state_dir = state_dir;
    config
}

/// Engine, simulated service and state directory of one test
pub struct Harness {
    /// Service the engine talks to
    pub service: Arc<SimulatedBackupService>,
    /// Configuration handed to every engine built by the harness
    pub config: Config,
    dir: TempDir,
}

impl Harness {
    /// Harness over `items` fixture items, `workers` workers and `polls` polls per job
    pub fn new(items: usize, workers: usize, polls: u32) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = fast_config(dir.path().to_path_buf(), workers);
        let service = Arc::new(SimulatedBackupService::with_settings(
            inventory(items),
            SimulatorSettings {
                page_size: 25,
                polls_to_complete: polls,
                ..SimulatorSettings::default()
            },
        ));
        Self {
            service,
            config,
            dir,
        }
    }

    /// Directory holding the state files
    pub fn state_dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Engine over the harness service and configuration
    pub fn engine(&self) -> MigrationEngine {
        MigrationEngine::new(self.config.clone(), self.service.clone(), self.service.clone())
    }

    /// Prepare a run
    pub async fn prepare(&self, mode: StartMode, shutdown: &ShutdownCoordinator) -> Result<PreparedRun> {
        self.engine().prepare(mode, shutdown).await
    }

    /// Prepare and execute a run to the end
    pub async fn run(&self, mode: StartMode) -> Result<RunReport> {
        let shutdown = ShutdownCoordinator::new();
        self.prepare(mode, &shutdown).await?.run().await
    }

    /// Load the state file a run wrote
    pub fn load_state(&self, report: &RunReport) -> Result<RunState> {
        StateStore::load_from(&report.state_path)
    }
}
