//! vaultshift - Resumable recovery point migration between backup vaults
//!
//! Copies every recovery point of a source vault into a destination vault,
//! surviving expired credentials, interruptions and runtime limits.

mod display;
mod json_output;
mod logging;
mod progress;
mod prompt;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use vaultshift_config::{Config, ConfigBuilder, ConfigLoader};
use vaultshift_engine::{
    load_inventory, FilterCriteria, FilterRule, FilterRuleSet, MetadataTable, MigrationEngine,
    ShutdownCoordinator, SimulatedBackupService, SimulatorSettings, StartMode, StateStore,
    SummaryReport,
};

/// vaultshift - Resumable recovery point migration between backup vaults
#[derive(Parser)]
#[command(
    name = "vaultshift",
    version = env!("CARGO_PKG_VERSION"),
    about = "Resumable recovery point migration between backup vaults",
    long_about = "vaultshift copies every recovery point of a source vault into a destination vault.\n\
                  Progress is checkpointed to a state file so an interrupted run resumes where it\n\
                  stopped, and expired credentials pause the run instead of failing it."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose mode - detailed output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy recovery points from the source vault to the destination vault
    Copy(CopyArgs),
    /// List the recovery points of the source vault
    List(ListArgs),
    /// Check that every source resource has a copy in the destination vault
    Verify(VerifyArgs),
    /// Summarize a state file without contacting the service
    Status {
        /// State file to read
        #[arg(long)]
        state_file: PathBuf,
        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },
    /// Show or generate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Generate {
        /// Target file; the extension selects YAML, TOML or JSON
        #[arg(default_value = "vaultshift.yaml")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct CopyArgs {
    /// Account that owns the source vault
    #[arg(long)]
    source_account: Option<String>,
    /// Account that owns the destination vault
    #[arg(long)]
    dest_account: Option<String>,
    /// Vault to copy from
    #[arg(long, alias = "vault")]
    source_vault: Option<String>,
    /// Vault reference to copy into
    #[arg(long)]
    dest_vault: Option<String>,
    /// Role the service assumes while copying
    #[arg(long)]
    iam_role: Option<String>,
    /// Inventory export the built-in backup service is seeded from
    #[arg(long)]
    inventory: PathBuf,
    /// Number of concurrent workers (1-50)
    #[arg(short, long)]
    workers: Option<usize>,
    /// Seconds between copy job status polls
    #[arg(long)]
    poll_interval: Option<u64>,
    /// Stop cleanly after this many minutes
    #[arg(long)]
    max_runtime_minutes: Option<u64>,
    /// Resume from an existing state file, failing if there is none
    #[arg(long, conflicts_with = "reset")]
    resume: bool,
    /// Ignore any existing state file and start fresh
    #[arg(long)]
    reset: bool,
    /// State file to write and resume from
    #[arg(long)]
    state_file: Option<PathBuf>,
    /// CSV keyed by a resourceArn column, or a .json map, merged into the inventory
    #[arg(long, alias = "metadata-csv")]
    metadata: Option<PathBuf>,
    /// Only copy items whose attribute is in the set, as KEY=V1,V2
    #[arg(long, value_name = "KEY=V1,V2")]
    allow_attribute: Vec<String>,
    /// Report what would be copied without starting any copy job
    #[arg(long)]
    dry_run: bool,
    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,
    /// Also write the JSON summary to this file
    #[arg(long)]
    summary_file: Option<PathBuf>,
}

#[derive(Args)]
struct ListArgs {
    /// Account that owns the vault
    #[arg(long)]
    source_account: Option<String>,
    /// Vault to list
    #[arg(long, alias = "vault")]
    source_vault: Option<String>,
    /// Inventory export the built-in backup service is seeded from
    #[arg(long)]
    inventory: PathBuf,
    /// CSV keyed by a resourceArn column, or a .json map, merged into the listing
    #[arg(long, alias = "metadata-csv")]
    metadata: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,
}

#[derive(Args)]
struct VerifyArgs {
    /// Account that owns the source vault
    #[arg(long)]
    source_account: Option<String>,
    /// Account that owns the destination vault
    #[arg(long)]
    dest_account: Option<String>,
    /// Vault that was copied from
    #[arg(long, alias = "vault")]
    source_vault: Option<String>,
    /// Vault reference that was copied into
    #[arg(long)]
    dest_vault: Option<String>,
    /// Inventory export of the source vault
    #[arg(long)]
    inventory: PathBuf,
    /// Inventory export of the destination vault; empty when omitted
    #[arg(long)]
    dest_inventory: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    output: OutputFormat,
}

#[derive(ValueEnum, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl CopyArgs {
    fn start_mode(&self) -> StartMode {
        if self.reset {
            StartMode::Reset
        } else if self.resume {
            StartMode::Resume
        } else {
            StartMode::Auto
        }
    }

    fn apply_to(&self, config: &mut Config) {
        let migration = &mut config.migration;
        for (target, value) in [
            (&mut migration.source_account, &self.source_account),
            (&mut migration.dest_account, &self.dest_account),
            (&mut migration.source_vault, &self.source_vault),
            (&mut migration.dest_vault, &self.dest_vault),
        ] {
            if let Some(value) = value {
                target.clone_from(value);
            }
        }
        if self.iam_role.is_some() {
            migration.iam_role.clone_from(&self.iam_role);
        }
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        if let Some(poll) = self.poll_interval {
            config.pool.poll_interval_secs = poll;
        }
        if self.max_runtime_minutes.is_some() {
            config.runtime.max_runtime_minutes = self.max_runtime_minutes;
        }
        if self.state_file.is_some() {
            config.state.state_file.clone_from(&self.state_file);
        }
    }

    fn filter(&self, config: &Config) -> Result<FilterRuleSet> {
        let mut rules = FilterRuleSet::from_config(&config.filter)?;
        for value in &self.allow_attribute {
            rules.add_rule(FilterRule::include(FilterCriteria::parse("attribute_in", value)?));
        }
        Ok(rules)
    }
}

impl ListArgs {
    fn apply_to(&self, config: &mut Config) {
        let migration = &mut config.migration;
        if let Some(account) = &self.source_account {
            migration.source_account.clone_from(account);
        }
        if let Some(vault) = &self.source_vault {
            migration.source_vault.clone_from(vault);
        }
    }
}

impl VerifyArgs {
    fn apply_to(&self, config: &mut Config) {
        let migration = &mut config.migration;
        for (target, value) in [
            (&mut migration.source_account, &self.source_account),
            (&mut migration.dest_account, &self.dest_account),
            (&mut migration.source_vault, &self.source_vault),
            (&mut migration.dest_vault, &self.dest_vault),
        ] {
            if let Some(value) = value {
                target.clone_from(value);
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            display::display_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = ConfigLoader::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Copy(ref args) => {
            let mut config = config;
            args.apply_to(&mut config);
            ConfigBuilder::validate(&config)?;
            let _guard = logging::init_logging(&cli, &config.logging)?;
            info!("vaultshift v{} starting", env!("CARGO_PKG_VERSION"));
            copy_command(args, config, cli.quiet).await
        }
        Commands::List(ref args) => {
            let mut config = config;
            args.apply_to(&mut config);
            let _guard = logging::init_logging(&cli, &config.logging)?;
            list_command(args, config).await?;
            Ok(0)
        }
        Commands::Verify(ref args) => {
            let mut config = config;
            args.apply_to(&mut config);
            let _guard = logging::init_logging(&cli, &config.logging)?;
            verify_command(args, config).await
        }
        Commands::Status {
            ref state_file,
            output,
        } => {
            let _guard = logging::init_logging(&cli, &config.logging)?;
            status_command(state_file, output)?;
            Ok(0)
        }
        Commands::Config { ref action } => {
            config_command(action, &config)?;
            Ok(0)
        }
    }
}

async fn copy_command(args: &CopyArgs, config: Config, quiet: bool) -> Result<i32> {
    let service = Arc::new(
        SimulatedBackupService::from_inventory_file(&args.inventory, SimulatorSettings::default())
            .with_context(|| format!("Failed to load inventory {}", args.inventory.display()))?,
    );
    let filter = args.filter(&config)?;
    let mut engine =
        MigrationEngine::new(config.clone(), service.clone(), service).with_filter(Arc::new(filter));
    if let Some(path) = &args.metadata {
        engine = engine.with_metadata(MetadataTable::from_file(path)?);
    }

    let text = args.output == OutputFormat::Text;
    if text && !quiet {
        display::display_run_header(&config);
    }

    let shutdown = ShutdownCoordinator::new();
    let prepared = engine.prepare(args.start_mode(), &shutdown).await?;

    if args.dry_run {
        let report = prepared.dry_run().await;
        if text {
            display::display_dry_run(&report);
        } else {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        return Ok(0);
    }

    if text && !quiet {
        display::display_prepared(&prepared);
    }

    let bar = progress::ProgressDisplay::start(
        prepared.ledger(),
        config.progress.refresh_interval(),
        config.progress.window(),
        quiet || !text,
    );
    let operator = prompt::spawn_operator_prompt(prepared.credentials().operator(), bar.handle());

    let report = prepared.run().await;
    operator.abort();
    bar.finish();
    let report = report?;

    if let Some(path) = &args.summary_file {
        report.summary.save_to_file(path)?;
        info!(path = %path.display(), "Summary written");
    }

    if text {
        display::display_run_report(&report, quiet);
    } else {
        println!("{}", json_output::RunResultJson::from_report(&report)?.to_pretty()?);
    }
    Ok(report.outcome.exit_code())
}

async fn list_command(args: &ListArgs, config: Config) -> Result<()> {
    let service = Arc::new(
        SimulatedBackupService::from_inventory_file(&args.inventory, SimulatorSettings::default())
            .with_context(|| format!("Failed to load inventory {}", args.inventory.display()))?,
    );
    let mut engine = MigrationEngine::new(config, service.clone(), service);
    if let Some(path) = &args.metadata {
        engine = engine.with_metadata(MetadataTable::from_file(path)?);
    }

    let listing = engine.list_inventory(&ShutdownCoordinator::new()).await?;
    info!(vault = %listing.vault, items = listing.items.len(), "Recovery points listed");

    match args.output {
        OutputFormat::Text => display::display_listing(&listing),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
    }
    Ok(())
}

async fn verify_command(args: &VerifyArgs, config: Config) -> Result<i32> {
    let service = Arc::new(
        SimulatedBackupService::from_inventory_file(&args.inventory, SimulatorSettings::default())
            .with_context(|| format!("Failed to load inventory {}", args.inventory.display()))?,
    );
    let copies = match &args.dest_inventory {
        Some(path) => load_inventory(path)
            .with_context(|| format!("Failed to load inventory {}", path.display()))?,
        None => Vec::new(),
    };
    service.seed_vault(config.migration.dest_vault.clone(), copies);

    let engine = MigrationEngine::new(config, service.clone(), service);
    let result = engine.verify(&ShutdownCoordinator::new()).await?;

    match args.output {
        OutputFormat::Text => display::display_verification(&result),
        OutputFormat::Json => {
            println!("{}", json_output::VerifyJson::new(&result).to_pretty()?);
        }
    }
    Ok(if result.is_complete() { 0 } else { 1 })
}

fn status_command(state_file: &Path, output: OutputFormat) -> Result<()> {
    let state = StateStore::load_from(state_file)?;
    let summary = SummaryReport::from_tasks(state.tasks.values(), state.created_at, state.updated_at);

    match output {
        OutputFormat::Text => display::display_status(&state, &summary),
        OutputFormat::Json => {
            println!("{}", json_output::StatusJson::new(&state, &summary)?.to_pretty()?);
        }
    }
    Ok(())
}

fn config_command(action: &ConfigAction, config: &Config) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{} Effective configuration:", style("⚙").blue().bold());
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigAction::Generate { path } => {
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            ConfigLoader::generate_default_config(path)?;
            display::display_success(&format!("Wrote default configuration to {}", path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_resume_conflicts_with_reset() {
        let parsed = Cli::try_parse_from([
            "vaultshift",
            "copy",
            "--inventory",
            "inventory.json",
            "--resume",
            "--reset",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_copy_overrides_config() {
        let cli = Cli::try_parse_from([
            "vaultshift",
            "copy",
            "--inventory",
            "inventory.json",
            "--source-account",
            "111111111111",
            "--vault",
            "prod",
            "--dest-vault",
            "arn:vault:dr",
            "--workers",
            "20",
            "--max-runtime-minutes",
            "30",
        ])
        .unwrap();
        let Commands::Copy(args) = cli.command else {
            panic!("expected copy");
        };

        let mut config = Config::default();
        args.apply_to(&mut config);

        assert_eq!(config.migration.source_account, "111111111111");
        assert_eq!(config.migration.source_vault, "prod");
        assert_eq!(config.pool.workers, 20);
        assert_eq!(config.runtime.max_runtime_minutes, Some(30));
        assert_eq!(args.start_mode(), StartMode::Auto);
    }

    #[test]
    fn test_list_accepts_metadata_csv_alias() {
        let cli = Cli::try_parse_from([
            "vaultshift",
            "list",
            "--inventory",
            "inventory.json",
            "--vault",
            "prod",
            "--metadata-csv",
            "metadata.csv",
            "--output",
            "json",
        ])
        .unwrap();
        let Commands::List(args) = cli.command else {
            panic!("expected list");
        };

        let mut config = Config::default();
        args.apply_to(&mut config);

        assert_eq!(config.migration.source_vault, "prod");
        assert_eq!(args.metadata, Some(PathBuf::from("metadata.csv")));
        assert!(args.output == OutputFormat::Json);
    }

    #[test]
    fn test_verify_overrides_config() {
        let cli = Cli::try_parse_from([
            "vaultshift",
            "verify",
            "--inventory",
            "source.json",
            "--dest-inventory",
            "dest.json",
            "--source-account",
            "111111111111",
            "--dest-account",
            "222222222222",
            "--vault",
            "prod",
            "--dest-vault",
            "arn:vault:dr",
        ])
        .unwrap();
        let Commands::Verify(args) = cli.command else {
            panic!("expected verify");
        };

        let mut config = Config::default();
        args.apply_to(&mut config);

        assert_eq!(config.migration.dest_account, "222222222222");
        assert_eq!(config.migration.source_vault, "prod");
        assert_eq!(config.migration.dest_vault, "arn:vault:dr");
        assert_eq!(args.dest_inventory, Some(PathBuf::from("dest.json")));
    }

    #[test]
    fn test_verify_requires_inventory() {
        assert!(Cli::try_parse_from(["vaultshift", "verify", "--vault", "prod"]).is_err());
    }

    #[test]
    fn test_allow_attribute_builds_rule() {
        let cli = Cli::try_parse_from([
            "vaultshift",
            "copy",
            "--inventory",
            "inventory.json",
            "--allow-attribute",
            "APMID=APM1,APM2",
        ])
        .unwrap();
        let Commands::Copy(args) = cli.command else {
            panic!("expected copy");
        };

        let rules = args.filter(&Config::default()).unwrap();
        assert!(!rules.is_empty());
    }
}
