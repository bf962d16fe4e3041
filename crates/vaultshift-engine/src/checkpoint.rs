//! Periodic and on-demand persistence of the ledger

use crate::ledger::Ledger;
use crate::state::{RunState, RunStateView, StateStore};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use vaultshift_types::{Error, Result};

/// Cheap handle used to ask for a checkpoint
///
/// Requests coalesce: any number of requests made while a save is pending
/// result in one save.
#[derive(Debug, Clone, Default)]
pub struct CheckpointTrigger {
    requested: Arc<Notify>,
}

impl CheckpointTrigger {
    /// Ask for a checkpoint as soon as possible
    pub fn request(&self) {
        self.requested.notify_one();
    }
}

/// Writes ledger snapshots through a [`StateStore`]
#[derive(Debug)]
pub struct Checkpointer {
    ledger: Arc<Ledger>,
    store: StateStore,
    base: Arc<RunState>,
    trigger: CheckpointTrigger,
    write: Mutex<()>,
    saves: AtomicU64,
}

impl Checkpointer {
    /// Create a checkpointer; `base` supplies everything but the tasks
    pub fn new(ledger: Arc<Ledger>, store: StateStore, mut base: RunState) -> Self {
        base.tasks.clear();
        Self {
            ledger,
            store,
            base: Arc::new(base),
            trigger: CheckpointTrigger::default(),
            write: Mutex::new(()),
            saves: AtomicU64::new(0),
        }
    }

    /// Handle for requesting checkpoints
    pub fn trigger(&self) -> CheckpointTrigger {
        self.trigger.clone()
    }

    /// Store the checkpoints are written to
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Completed saves
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Snapshot the ledger and atomically replace the state file
    pub async fn save(&self) -> Result<()> {
        let _write = self.write.lock().await;
        let tasks = self.ledger.snapshot().await;
        let base = Arc::clone(&self.base);
        let store = self.store.clone();
        let updated_at = Utc::now();

        tokio::task::spawn_blocking(move || {
            let view = RunStateView {
                schema_version: base.schema_version,
                run_id: base.run_id,
                context: &base.context,
                inventory: &base.inventory,
                tasks: &tasks,
                created_at: base.created_at,
                updated_at,
            };
            store.save_view(&view)
        })
        .await
        .map_err(|e| Error::other(format!("Checkpoint task failed: {e}")))??;

        let saves = self.saves.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(path = %self.store.path().display(), saves, "Checkpoint written");
        Ok(())
    }

    /// Save on request and every `interval` until `cancel` fires
    ///
    /// Failed saves are logged; the previous file stays in place.
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let checkpointer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = checkpointer.trigger.requested.notified() => {}
                    _ = ticker.tick() => {}
                }
                if let Err(e) = checkpointer.save().await {
                    error!(error = %e, "Checkpoint failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunContext;
    use crate::task::{TaskState, Transition};
    use tempfile::TempDir;
    use vaultshift_types::{Item, ItemId};

    fn run_state() -> RunState {
        let context = RunContext {
            source_account: "111111111111".to_string(),
            dest_account: "222222222222".to_string(),
            source_vault: "prod".to_string(),
            dest_vault: "dr".to_string(),
        };
        let inventory = (0..3)
            .map(|i| Item::new(format!("arn:rp:{i}"), format!("arn:vol:{i}")))
            .collect();
        RunState::new(context, inventory)
    }

    fn setup(dir: &TempDir) -> (Arc<Ledger>, Arc<Checkpointer>, RunState) {
        let state = run_state();
        let ledger = Arc::new(Ledger::new(state.tasks.values().cloned()).unwrap());
        let store = StateStore::new(dir.path().join("state.json"));
        let checkpointer = Arc::new(Checkpointer::new(ledger.clone(), store, state.clone()));
        (ledger, checkpointer, state)
    }

    #[tokio::test]
    async fn test_save_reflects_ledger() {
        let dir = TempDir::new().unwrap();
        let (ledger, checkpointer, state) = setup(&dir);
        let id = ItemId::new("arn:rp:0");

        ledger.claim_next(Utc::now()).await.unwrap();
        ledger
            .apply(&id, Transition::Released)
            .await
            .unwrap();
        ledger
            .apply(&id, Transition::Skip("excluded".to_string()))
            .await
            .unwrap();
        checkpointer.save().await.unwrap();

        let loaded = checkpointer.store().load().unwrap();
        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.inventory.len(), 3);
        assert_eq!(loaded.tasks[&id].state, TaskState::Skipped);
        assert_eq!(checkpointer.saves(), 1);
    }

    #[tokio::test]
    async fn test_background_saves_on_request() {
        let dir = TempDir::new().unwrap();
        let (_ledger, checkpointer, _state) = setup(&dir);
        let cancel = CancellationToken::new();
        let handle = checkpointer.spawn(Duration::from_secs(3600), cancel.clone());

        checkpointer.trigger().request();
        for _ in 0..100 {
            if checkpointer.saves() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(checkpointer.saves() >= 1);
        assert!(checkpointer.store().exists());

        cancel.cancel();
        handle.await.unwrap();
    }
}
