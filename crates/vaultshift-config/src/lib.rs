//! Configuration management system for vaultshift
//!
//! Configuration is layered: built-in defaults, then an optional YAML, TOML or
//! JSON file, then `VAULTSHIFT_*` environment variables, and finally whatever
//! the command line overrides. Every layer is validated once, after merging.
//!
//! # Examples
//!
//! ```rust
//! use vaultshift_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_source_file("vaultshift.yaml")
//!     .add_env_prefix("VAULTSHIFT")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!("Workers: {}", config.pool.workers);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use vaultshift_types::{RetryConfig, WorkerCount};

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Main configuration structure for vaultshift
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Source and destination of the migration
    pub migration: MigrationConfig,
    /// Worker pool sizing and cadence
    pub pool: PoolConfig,
    /// Backoff for transient errors and failed copy jobs
    pub retry: RetrySettings,
    /// Credential reload behaviour
    pub credentials: CredentialConfig,
    /// Runtime budget and shutdown
    pub runtime: RuntimeConfig,
    /// Progress reporting
    pub progress: ProgressConfig,
    /// State file location
    pub state: StateConfig,
    /// Include/exclude rules applied to the inventory
    pub filter: FilterConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Source and destination of the migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Account that owns the source vault
    pub source_account: String,
    /// Account that owns the destination vault
    pub dest_account: String,
    /// Vault to copy from
    pub source_vault: String,
    /// Vault reference to copy into
    pub dest_vault: String,
    /// Role the service assumes while copying
    pub iam_role: Option<String>,
    /// Service region
    pub region: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_account: String::new(),
            dest_account: String::new(),
            source_vault: String::new(),
            dest_vault: String::new(),
            iam_role: None,
            region: "us-east-1".to_string(),
        }
    }
}

impl MigrationConfig {
    /// Check that both ends of the migration are named
    pub fn require_endpoints(&self) -> ConfigResult<()> {
        for (key, value) in [
            ("migration.source_account", &self.source_account),
            ("migration.source_vault", &self.source_vault),
            ("migration.dest_vault", &self.dest_vault),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::missing_required(key));
            }
        }
        Ok(())
    }
}

/// Worker pool sizing and cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of concurrent workers (1-50)
    pub workers: usize,
    /// Seconds between copy-job status polls
    pub poll_interval_secs: u64,
    /// Request a checkpoint after this many task transitions
    pub save_every_transitions: u64,
    /// Request a checkpoint at least this often, in seconds
    pub checkpoint_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: WorkerCount::DEFAULT,
            poll_interval_secs: 30,
            save_every_transitions: 25,
            checkpoint_interval_secs: 60,
        }
    }
}

impl PoolConfig {
    /// Validated worker count
    pub fn worker_count(&self) -> ConfigResult<WorkerCount> {
        WorkerCount::new(self.workers)
            .map_err(|message| ConfigError::invalid_value("pool.workers", message))
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Periodic checkpoint interval as a duration
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

/// Backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Copy attempts per item before it is permanently failed
    pub task_max_attempts: u32,
    /// Attempts per remote call for transient errors
    pub transient_max_attempts: u32,
    /// First backoff delay in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff cap in seconds
    pub max_delay_secs: u64,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            task_max_attempts: 3,
            transient_max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_secs: 60,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    /// Backoff for transient errors on a single remote call
    pub fn transient(&self) -> ConfigResult<RetryConfig> {
        self.policy(self.transient_max_attempts)
    }

    /// Backoff between copy attempts of one item after a remote failure
    pub fn task(&self) -> ConfigResult<RetryConfig> {
        self.policy(self.task_max_attempts)
    }

    fn policy(&self, attempts: u32) -> ConfigResult<RetryConfig> {
        RetryConfig::new(
            attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_secs(self.max_delay_secs),
            self.multiplier,
        )
        .map_err(|message| ConfigError::invalid_value("retry", message))
    }
}

/// Credential reload behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Consecutive reload failures before the operator is prompted
    pub max_reload_failures: u32,
    /// Delay before each reload retry, in seconds
    pub reload_delays_secs: Vec<u64>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            max_reload_failures: 3,
            reload_delays_secs: vec![1, 2, 4],
        }
    }
}

impl CredentialConfig {
    /// Reload delays as durations
    pub fn reload_delays(&self) -> Vec<Duration> {
        self.reload_delays_secs
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect()
    }
}

/// Runtime budget and shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Wall-clock budget for the run, unlimited when unset
    pub max_runtime_minutes: Option<u64>,
    /// Seconds to wait for workers after a stop is requested
    pub grace_period_secs: u64,
    /// Lower bound of the safety margin kept before the budget ends
    pub min_safety_margin_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_runtime_minutes: None,
            grace_period_secs: 10,
            min_safety_margin_secs: 30,
        }
    }
}

impl RuntimeConfig {
    /// Runtime budget as a duration
    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_minutes
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
    }

    /// Grace period as a duration
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Minimum safety margin as a duration
    pub fn min_safety_margin(&self) -> Duration {
        Duration::from_secs(self.min_safety_margin_secs)
    }
}

/// Progress reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Seconds between progress refreshes
    pub refresh_interval_secs: u64,
    /// Trailing window used for the rate, in seconds
    pub window_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 5,
            window_secs: 300,
        }
    }
}

impl ProgressConfig {
    /// Time between progress refreshes
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Trailing window for rate estimation
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// State file location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Explicit state file, overrides discovery in `state_dir`
    pub state_file: Option<PathBuf>,
    /// Directory where state files are created and discovered
    pub state_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            state_dir: PathBuf::from("."),
        }
    }
}

/// Include/exclude rules applied to the inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Require every rule to pass instead of any
    pub match_all: bool,
    /// Rules in evaluation order
    pub rules: Vec<FilterRuleConfig>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            match_all: true,
            rules: Vec::new(),
        }
    }
}

/// Raw filter rule as written in a configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRuleConfig {
    /// Criterion name, such as `resource_type` or `min_age_days`
    pub criteria: String,
    /// Criterion argument
    pub value: String,
    /// Include on match when true, exclude on match when false
    #[serde(default = "default_include")]
    pub include: bool,
}

fn default_include() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Enable JSON formatting
    pub json_format: bool,
    /// Also write logs to this file
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            log_file: None,
        }
    }
}
