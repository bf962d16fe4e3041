//! Progress bar fed from ledger snapshots

use crate::display::format_eta;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use vaultshift_engine::{Ledger, ProgressSnapshot, ProgressTracker};

/// Periodically redrawn progress bar
pub struct ProgressDisplay {
    bar: Option<ProgressBar>,
    task: Option<JoinHandle<()>>,
}

impl ProgressDisplay {
    /// Start refreshing every `refresh`, or do nothing when `hidden`
    pub fn start(ledger: Arc<Ledger>, refresh: Duration, window: Duration, hidden: bool) -> Self {
        if hidden {
            return Self {
                bar: None,
                task: None,
            };
        }

        let bar = ProgressBar::new(0);
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(bar_style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.enable_steady_tick(Duration::from_millis(100));

        let tracker = ProgressTracker::new(window);
        let task_bar = bar.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh.max(Duration::from_millis(100)));
            loop {
                ticker.tick().await;
                let snapshot = tracker.snapshot(&ledger).await;
                render(&task_bar, &snapshot);
            }
        });

        Self {
            bar: Some(bar),
            task: Some(task),
        }
    }

    /// Bar handle for suspending output around prompts
    pub fn handle(&self) -> Option<ProgressBar> {
        self.bar.clone()
    }

    /// Stop refreshing and clear the bar
    pub fn finish(self) {
        if let Some(task) = self.task {
            task.abort();
        }
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

fn render(bar: &ProgressBar, snapshot: &ProgressSnapshot) {
    bar.set_length(snapshot.total);
    bar.set_position(snapshot.finished());
    bar.set_message(format!(
        "{:.1}% | {} done, {} failed, {} in flight | {:.2}/s | ETA {}",
        snapshot.percent_done(),
        snapshot.completed,
        snapshot.failed,
        snapshot.in_progress,
        snapshot.rate,
        format_eta(snapshot.eta),
    ));
}
