//! Credential lifecycle coordination
//!
//! Every remote call goes through [`CredentialCoordinator::guard`]. When a call
//! fails with an authentication error the lease is invalidated, which parks
//! every worker at its next guard, and exactly one caller reloads credentials.
//! A successful reload bumps the lease generation and releases all parked
//! workers at once. After too many consecutive reload failures the coordinator
//! raises an [`OperatorPrompt`] and waits for [`OperatorHandle::acknowledge`].

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vaultshift_config::Config;
use vaultshift_types::{BackupClient, CredentialSource, Error, Result};

/// Reload behaviour of the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSettings {
    /// Consecutive reload failures before the operator is prompted
    pub max_reload_failures: u32,
    /// Delay after the first, second, ... failed reload
    pub reload_delays: Vec<Duration>,
}

impl CredentialSettings {
    /// Create settings from main config
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_reload_failures: config.credentials.max_reload_failures.max(1),
            reload_delays: config.credentials.reload_delays(),
        }
    }

    fn delay_after(&self, failures: u32) -> Duration {
        let index = failures.saturating_sub(1) as usize;
        self.reload_delays
            .get(index)
            .or_else(|| self.reload_delays.last())
            .copied()
            .unwrap_or_default()
    }
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            max_reload_failures: 3,
            reload_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

/// Process-wide permission to call the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Incremented on every successful reload
    pub generation: u64,
    /// Whether remote calls may proceed
    pub valid: bool,
}

/// Request for a human to fix credentials before the run continues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorPrompt {
    /// Reload failures in a row that led to the prompt
    pub consecutive_failures: u32,
    /// Error of the last reload attempt
    pub last_error: String,
    /// When the prompt was raised
    pub raised_at: DateTime<Utc>,
}

/// Counters describing what the coordinator has done
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialStats {
    /// Times the pool was paused
    pub pauses: u64,
    /// Reload attempts
    pub reloads: u64,
    /// Failed reload attempts
    pub reload_failures: u64,
    /// Operator prompts raised
    pub prompts: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    pauses: AtomicU64,
    reloads: AtomicU64,
    reload_failures: AtomicU64,
    prompts: AtomicU64,
}

#[derive(Debug)]
struct PromptChannel {
    current: watch::Sender<Option<OperatorPrompt>>,
    ack: Notify,
}

#[derive(Debug, Default)]
struct ReloadState {
    consecutive_failures: u32,
}

/// Gate in front of every remote call
pub struct CredentialCoordinator {
    client: Arc<dyn BackupClient>,
    source: Arc<dyn CredentialSource>,
    settings: CredentialSettings,
    lease: watch::Sender<Lease>,
    reload: Mutex<ReloadState>,
    prompt: Arc<PromptChannel>,
    stats: StatCounters,
    cancel: CancellationToken,
}

impl std::fmt::Debug for CredentialCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCoordinator")
            .field("settings", &self.settings)
            .field("lease", &*self.lease.borrow())
            .finish_non_exhaustive()
    }
}

impl CredentialCoordinator {
    /// Create a coordinator with a valid lease
    pub fn new(
        client: Arc<dyn BackupClient>,
        source: Arc<dyn CredentialSource>,
        settings: CredentialSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (lease, _) = watch::channel(Lease {
            generation: 0,
            valid: true,
        });
        let (current, _) = watch::channel(None);
        Self {
            client,
            source,
            settings,
            lease,
            reload: Mutex::new(ReloadState::default()),
            prompt: Arc::new(PromptChannel {
                current,
                ack: Notify::new(),
            }),
            stats: StatCounters::default(),
            cancel,
        }
    }

    /// Run `call` once the lease is valid, recovering from authentication errors
    ///
    /// Authentication errors never reach the caller: the call is repeated
    /// after credentials have been reloaded. The only way out of a pause
    /// without success is cancellation, reported as [`Error::Cancelled`].
    pub async fn guard<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let generation = self.wait_for_lease().await?;
            match call().await {
                Err(err) if err.is_auth() => {
                    warn!(operation, generation, error = %err, "Authentication failed");
                    self.recover(generation).await?;
                }
                result => return result,
            }
        }
    }

    /// Current lease
    pub fn lease(&self) -> Lease {
        *self.lease.borrow()
    }

    /// Snapshot of the coordinator's counters
    pub fn stats(&self) -> CredentialStats {
        CredentialStats {
            pauses: self.stats.pauses.load(Ordering::Relaxed),
            reloads: self.stats.reloads.load(Ordering::Relaxed),
            reload_failures: self.stats.reload_failures.load(Ordering::Relaxed),
            prompts: self.stats.prompts.load(Ordering::Relaxed),
        }
    }

    /// Handle through which an operator observes and answers prompts
    pub fn operator(&self) -> OperatorHandle {
        OperatorHandle {
            prompts: self.prompt.current.subscribe(),
            channel: Arc::clone(&self.prompt),
        }
    }

    async fn wait_for_lease(&self) -> Result<u64> {
        let mut lease_rx = self.lease.subscribe();
        loop {
            let lease = *lease_rx.borrow_and_update();
            if lease.valid {
                return Ok(lease.generation);
            }
            tokio::select! {
                changed = lease_rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    async fn recover(&self, generation: u64) -> Result<()> {
        let paused = self.lease.send_if_modified(|lease| {
            if lease.generation == generation && lease.valid {
                lease.valid = false;
                true
            } else {
                false
            }
        });
        if paused {
            self.stats.pauses.fetch_add(1, Ordering::Relaxed);
            warn!(generation, "Remote calls paused until credentials are reloaded");
        }

        let mut reload = self.reload.lock().await;
        if self.lease.borrow().generation != generation {
            // Another caller already reloaded
            return Ok(());
        }

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            self.stats.reloads.fetch_add(1, Ordering::Relaxed);
            self.source.clear_sessions().await;
            let outcome = match self.source.reload().await {
                Ok(()) => self.client.check_session().await,
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => {
                    reload.consecutive_failures = 0;
                    self.lease.send_modify(|lease| {
                        lease.generation += 1;
                        lease.valid = true;
                    });
                    info!(
                        generation = generation + 1,
                        "Credentials reloaded, remote calls resumed"
                    );
                    return Ok(());
                }
                Err(err) => {
                    reload.consecutive_failures += 1;
                    self.stats.reload_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        failures = reload.consecutive_failures,
                        error = %err,
                        "Credential reload failed"
                    );

                    if reload.consecutive_failures >= self.settings.max_reload_failures {
                        self.await_operator(reload.consecutive_failures, &err).await?;
                        reload.consecutive_failures = 0;
                    } else {
                        let delay = self.settings.delay_after(reload.consecutive_failures);
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = self.cancel.cancelled() => return Err(Error::Cancelled),
                        }
                    }
                }
            }
        }
    }

    async fn await_operator(&self, failures: u32, last_error: &Error) -> Result<()> {
        error!(
            failures,
            error = %last_error,
            "Credentials could not be reloaded; waiting for operator acknowledgment"
        );
        self.stats.prompts.fetch_add(1, Ordering::Relaxed);
        self.prompt.current.send_replace(Some(OperatorPrompt {
            consecutive_failures: failures,
            last_error: last_error.to_string(),
            raised_at: Utc::now(),
        }));

        tokio::select! {
            () = self.prompt.ack.notified() => {
                info!("Operator acknowledged, retrying credential reload");
                Ok(())
            }
            () = self.cancel.cancelled() => {
                self.prompt.current.send_replace(None);
                Err(Error::Cancelled)
            }
        }
    }
}

/// Operator side of the credential prompt
#[derive(Debug, Clone)]
pub struct OperatorHandle {
    prompts: watch::Receiver<Option<OperatorPrompt>>,
    channel: Arc<PromptChannel>,
}

impl OperatorHandle {
    /// The prompt currently waiting for an answer
    pub fn pending(&self) -> Option<OperatorPrompt> {
        self.prompts.borrow().clone()
    }

    /// Wait until a prompt is raised; `None` once the coordinator is gone
    pub async fn next_prompt(&mut self) -> Option<OperatorPrompt> {
        loop {
            if let Some(prompt) = self.prompts.borrow_and_update().clone() {
                return Some(prompt);
            }
            if self.prompts.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Answer the pending prompt; returns false when nothing was pending
    pub fn acknowledge(&self) -> bool {
        let answered = self.channel.current.send_if_modified(|prompt| prompt.take().is_some());
        if answered {
            self.channel.ack.notify_one();
        }
        answered
    }
}
