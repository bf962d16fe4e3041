//! Interactive acknowledgment of the credential reload prompt

use console::style;
use dialoguer::Confirm;
use indicatif::ProgressBar;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vaultshift_engine::{OperatorHandle, OperatorPrompt};

/// Answer operator prompts from the terminal until aborted
pub fn spawn_operator_prompt(mut operator: OperatorHandle, bar: Option<ProgressBar>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(prompt) = operator.next_prompt().await {
            let bar = bar.clone();
            let confirmed = tokio::task::spawn_blocking(move || ask(&prompt, bar.as_ref())).await;
            match confirmed {
                Ok(Ok(true)) => {
                    if operator.acknowledge() {
                        info!("Operator confirmed refreshed credentials");
                    }
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "No terminal to confirm credentials; stop with Ctrl-C to save and exit");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Credential prompt ended abnormally");
                    return;
                }
            }
        }
    })
}

fn ask(prompt: &OperatorPrompt, bar: Option<&ProgressBar>) -> dialoguer::Result<bool> {
    let question = || {
        eprintln!();
        eprintln!(
            "{} Credentials could not be reloaded after {} attempts: {}",
            style("⚠").yellow().bold(),
            prompt.consecutive_failures,
            style(&prompt.last_error).yellow()
        );
        eprintln!("  All workers are paused. Refresh the credentials, then confirm to retry.");
        Confirm::new()
            .with_prompt("Credentials refreshed?")
            .default(true)
            .interact()
    };
    match bar {
        Some(bar) => bar.suspend(question),
        None => question(),
    }
}
