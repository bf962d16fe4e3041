//! End-of-run summary report

use crate::task::{MigrationTask, TaskState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use vaultshift_types::{Error, ItemId, Result};

const RULE_WIDTH: usize = 60;

/// One permanently failed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    /// Failed item
    pub recovery_point_arn: ItemId,
    /// Last error of the item
    pub error_message: String,
    /// When the item failed
    pub timestamp: Option<DateTime<Utc>>,
}

/// Totals and failures of a run
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryReport {
    /// All items of the run
    pub total_items: u64,
    /// Completed items
    pub completed: u64,
    /// Permanently failed items
    pub failed: u64,
    /// Skipped items
    pub skipped: u64,
    /// Items with a copy job in flight
    pub in_progress: u64,
    /// Items not started yet, retries included
    pub pending: u64,
    /// Wall time of the run, in seconds
    pub duration_seconds: f64,
    /// Run start
    pub start_time: DateTime<Utc>,
    /// Run end
    pub end_time: DateTime<Utc>,
    /// Failure details, in item order
    pub failures: Vec<FailureDetail>,
}

#[derive(Serialize)]
struct SummaryDocument<'a> {
    total_items: u64,
    completed: u64,
    failed: u64,
    skipped: u64,
    in_progress: u64,
    pending: u64,
    duration_seconds: f64,
    duration_formatted: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    success_rate: f64,
    throughput_per_hour: Option<f64>,
    failures: &'a [FailureDetail],
}

impl SummaryReport {
    /// Summarize tasks of a run that went from `start_time` to `end_time`
    pub fn from_tasks<'a>(
        tasks: impl IntoIterator<Item = &'a MigrationTask>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        let end_time = end_time.max(start_time);
        let mut report = Self {
            total_items: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            in_progress: 0,
            pending: 0,
            duration_seconds: (end_time - start_time)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            start_time,
            end_time,
            failures: Vec::new(),
        };

        for task in tasks {
            report.total_items += 1;
            match task.state {
                TaskState::Completed => report.completed += 1,
                TaskState::Skipped => report.skipped += 1,
                TaskState::Submitted | TaskState::Polling => report.in_progress += 1,
                TaskState::Failed if task.is_retrying() => report.pending += 1,
                TaskState::Pending => report.pending += 1,
                TaskState::Failed => {
                    report.failed += 1;
                    report.failures.push(FailureDetail {
                        recovery_point_arn: task.item_id.clone(),
                        error_message: task
                            .last_error
                            .as_ref()
                            .map_or_else(|| "Unknown error".to_string(), |e| e.message.clone()),
                        timestamp: task.completed_at,
                    });
                }
            }
        }
        report.failures.sort_by(|a, b| a.recovery_point_arn.cmp(&b.recovery_point_arn));
        report
    }

    /// Completed share of all items, in percent
    pub fn success_rate(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total_items as f64) * 100.0
    }

    /// Completed items per hour, `None` for runs shorter than a second
    pub fn throughput_per_hour(&self) -> Option<f64> {
        if self.duration_seconds < 1.0 {
            return None;
        }
        Some(self.completed as f64 / self.duration_seconds * 3600.0)
    }

    /// Duration as `1d 2h 3m`, `2h 3m`, `3m 4s` or `4s`
    pub fn format_duration(&self) -> String {
        format_duration(self.duration_seconds)
    }

    /// Pretty-printed JSON document
    pub fn to_json(&self) -> Result<String> {
        let document = SummaryDocument {
            total_items: self.total_items,
            completed: self.completed,
            failed: self.failed,
            skipped: self.skipped,
            in_progress: self.in_progress,
            pending: self.pending,
            duration_seconds: round2(self.duration_seconds),
            duration_formatted: self.format_duration(),
            start_time: self.start_time,
            end_time: self.end_time,
            success_rate: round2(self.success_rate()),
            throughput_per_hour: self.throughput_per_hour().map(round2),
            failures: &self.failures,
        };
        serde_json::to_string_pretty(&document)
            .map_err(|e| Error::other(format!("Failed to serialize summary: {e}")))
    }

    /// Write the JSON document to `path`, creating parent directories
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Multi-line plain-text summary
    pub fn format_console_summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SummaryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(RULE_WIDTH);
        writeln!(f, "\n{rule}")?;
        writeln!(f, "COPY OPERATION SUMMARY")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Total Items:      {}", self.total_items)?;
        writeln!(f, "Completed:        {}", self.completed)?;
        writeln!(f, "Failed:           {}", self.failed)?;
        writeln!(f, "Skipped:          {}", self.skipped)?;
        writeln!(f, "In Progress:      {}", self.in_progress)?;
        writeln!(f, "Pending:          {}", self.pending)?;
        writeln!(f)?;
        writeln!(f, "Success Rate:     {:.1}%", self.success_rate())?;
        writeln!(f, "Duration:         {}", self.format_duration())?;
        match self.throughput_per_hour() {
            Some(rate) => writeln!(f, "Throughput:       {rate:.1} items/hour")?,
            None => writeln!(f, "Throughput:       N/A (duration too short)")?,
        }
        writeln!(f)?;
        writeln!(f, "Started:          {}", self.start_time.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "Ended:            {}", self.end_time.format("%Y-%m-%d %H:%M:%S"))?;

        if !self.failures.is_empty() {
            writeln!(f)?;
            writeln!(f, "FAILURES ({}):", self.failures.len())?;
            writeln!(f, "{}", "-".repeat(RULE_WIDTH))?;
            for (index, failure) in self.failures.iter().enumerate() {
                writeln!(f, "{}. {}", index + 1, failure.recovery_point_arn)?;
                writeln!(f, "   Error: {}", failure.error_message)?;
                if let Some(at) = failure.timestamp {
                    writeln!(f, "   Time: {}", at.format("%Y-%m-%d %H:%M:%S"))?;
                }
            }
        }
        write!(f, "{rule}")
    }
}

/// Format whole seconds as `1d 2h 3m`, `2h 3m`, `3m 4s` or `4s`
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let days = total / 86_400;
    let hours = total % 86_400 / 3600;
    let minutes = total % 3600 / 60;
    let secs = total % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
