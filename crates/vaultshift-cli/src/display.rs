//! Console rendering of run headers, reports and state summaries

use console::style;
use std::time::Duration;
use vaultshift_config::Config;
use vaultshift_engine::summary::format_duration;
use vaultshift_engine::{
    DryRunReport, InventoryListing, PreparedRun, RunOutcome, RunReport, RunState, SummaryReport,
    VerificationResult,
};

/// Show where the run copies from and to
pub fn display_run_header(config: &Config) {
    let migration = &config.migration;
    println!(
        "{} Copying {} ({}) to {}",
        style("→").green().bold(),
        style(&migration.source_vault).cyan(),
        style(&migration.source_account).dim(),
        style(&migration.dest_vault).cyan()
    );
    println!(
        "  Workers: {}  Poll interval: {}s  Runtime budget: {}",
        style(config.pool.workers).yellow(),
        config.pool.poll_interval_secs,
        config
            .runtime
            .max_runtime_minutes
            .map_or_else(|| "none".to_string(), |m| format!("{m}m"))
    );
}

/// Show what preparation decided
pub fn display_prepared(prepared: &PreparedRun) {
    let verb = if prepared.is_resumed() { "Resuming" } else { "Starting" };
    display_info(&format!(
        "{verb} run {} with state file {}",
        prepared.run_id(),
        prepared.state_path().display()
    ));
    if let Some(stats) = prepared.enrichment() {
        display_info(&format!(
            "Metadata applied to {} of {} items ({} without metadata)",
            stats.enriched_count, stats.total_count, stats.missing_count
        ));
    }
}

/// Render a dry-run report
pub fn display_dry_run(report: &DryRunReport) {
    println!();
    println!("{}", style("Dry run - no copy jobs will be started").bold().underlined());
    println!("  Items in inventory: {}", style(report.total_items).cyan());
    println!(
        "  Would copy: {} ({:.2} GB)",
        style(report.to_copy).green().bold(),
        report.to_copy_size_gb
    );
    println!("  Already completed: {}", style(report.already_completed).green());
    println!("  Skipped: {}", style(report.skipped).yellow());
    if let Some(filter) = &report.filter {
        println!(
            "  Filter: {} of {} copyable items included ({:.1}%), {:.2} GB excluded",
            filter.included_count,
            filter.total_count,
            filter.inclusion_rate_percent,
            filter.total_size_gb_excluded
        );
    }
    if let Some(stats) = &report.enrichment {
        println!(
            "  Metadata: {} enriched, {} missing",
            stats.enriched_count, stats.missing_count
        );
    }
    println!("  State file: {}", style(report.state_path.display()).dim());
}

/// Render the final report of a run
pub fn display_run_report(report: &RunReport, quiet: bool) {
    if !quiet {
        println!("{}", report.summary.format_console_summary());
        println!(
            "  Submitted: {}  Retried: {}  Polls: {}  Credential pauses: {}  Reloads: {}",
            report.pool.submitted,
            report.pool.retried,
            report.pool.polls,
            report.credentials.pauses,
            report.credentials.reloads
        );
        println!("  State file: {}", style(report.state_path.display()).dim());
    }

    let message = format!("Run {}", report.outcome);
    match report.outcome {
        RunOutcome::Completed => display_success(&message),
        RunOutcome::CompletedWithFailures => display_error(&format!(
            "{message}: {} item(s) failed",
            report.counts.failed
        )),
        RunOutcome::Interrupted(_) => display_warning(&format!(
            "{message}: {} item(s) remaining, rerun to resume",
            report.counts.remaining()
        )),
    }
}

/// Render a state file summary
pub fn display_status(state: &RunState, summary: &SummaryReport) {
    println!("{}", style("Run state").bold().underlined());
    println!("  Run: {}", style(state.run_id).cyan());
    println!(
        "  Source: {} ({})",
        style(&state.context.source_vault).cyan(),
        state.context.source_account
    );
    println!("  Destination: {}", style(&state.context.dest_vault).cyan());
    println!("  Last saved: {}", state.updated_at.format("%Y-%m-%d %H:%M:%S"));
    for (task_state, count) in state.state_counts() {
        println!("  {task_state}: {count}");
    }
    println!("{}", summary.format_console_summary());
}

/// Render the recovery points of a vault
pub fn display_listing(listing: &InventoryListing) {
    for item in &listing.items {
        println!("Recovery Point: {}", style(&item.id).cyan());
        println!("  Vault: {}", item.vault_name);
        println!("  Resource: {}", item.resource_arn);
        println!("  Type: {}", item.resource_type);
        if let Some(created) = item.creation_date {
            println!("  Created: {}", created.format("%Y-%m-%d %H:%M:%S"));
        }
        println!("  Status: {}", item.status);
        println!("  Size: {:.2} GB", item.size_gb());
        if !item.attributes.is_empty() {
            println!("  Metadata:");
            for (key, value) in &item.attributes {
                println!("    {key}: {value}");
            }
        }
        println!();
    }
    display_info(&format!(
        "{} recovery points in {} ({:.2} GB)",
        listing.items.len(),
        listing.vault,
        listing.total_size_gb
    ));
    if let Some(stats) = &listing.enrichment {
        display_info(&format!(
            "Metadata applied to {} of {} items ({} without metadata)",
            stats.enriched_count, stats.total_count, stats.missing_count
        ));
    }
}

/// Render a source and destination comparison
pub fn display_verification(result: &VerificationResult) {
    println!("{}", style("Verification").bold().underlined());
    println!(
        "  Source: {} ({} recovery points)",
        style(&result.source_vault).cyan(),
        result.source_count
    );
    println!(
        "  Destination: {} ({} recovery points)",
        style(&result.dest_vault).cyan(),
        result.dest_count
    );
    println!("  Matched: {}", style(result.matched_count).green());
    println!("  Missing: {}", style(result.missing_count).red());
    println!("  Extra: {}", style(result.extra_count).yellow());
    for resource in result.missing.iter().take(MAX_MISSING_SHOWN) {
        println!("    {} {resource}", style("-").red());
    }
    if result.missing.len() > MAX_MISSING_SHOWN {
        println!("    ... and {} more", result.missing.len() - MAX_MISSING_SHOWN);
    }

    if result.is_complete() {
        display_success("Every source resource has a copy in the destination");
    } else {
        display_error(&format!(
            "{} source resource(s) have no copy in the destination",
            result.missing_count
        ));
    }
}

const MAX_MISSING_SHOWN: usize = 20;

/// ETA for display
pub fn format_eta(eta: Option<Duration>) -> String {
    eta.map_or_else(|| "unknown".to_string(), |eta| format_duration(eta.as_secs_f64()))
}

/// Display a warning message with proper formatting
pub fn display_warning(message: &str) {
    println!("{} {}", style("⚠").yellow().bold(), style(message).yellow());
}

/// Display an error message with proper formatting
pub fn display_error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), style(message).red());
}

/// Display a success message with proper formatting
pub fn display_success(message: &str) {
    println!("{} {}", style("✓").green().bold(), style(message).green());
}

/// Display an info message with proper formatting
pub fn display_info(message: &str) {
    println!("{} {}", style("ℹ").blue().bold(), style(message).blue());
}
