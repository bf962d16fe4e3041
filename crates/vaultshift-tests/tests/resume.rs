//! Interrupting runs and resuming them from the state file

use chrono::Utc;
use std::fs;
use vaultshift_engine::{
    RunContext, RunOutcome, ShutdownCoordinator, StartMode, StateStore, StopReason, TaskState,
};
use vaultshift_tests::Harness;
use vaultshift_types::Error;

fn context(harness: &Harness) -> RunContext {
    let migration = &harness.config.migration;
    RunContext {
        source_account: migration.source_account.clone(),
        dest_account: migration.dest_account.clone(),
        source_vault: migration.source_vault.clone(),
        dest_vault: migration.dest_vault.clone(),
    }
}

#[tokio::test]
async fn test_interrupt_then_resume_copies_each_item_once() {
    let harness = Harness::new(100, 10, 2);
    harness.service.hold_completions_after(40);
    let shutdown = ShutdownCoordinator::new();
    let prepared = harness.prepare(StartMode::Auto, &shutdown).await.unwrap();

    let (first, ()) = tokio::join!(prepared.run(), async {
        harness.service.completions_held().await;
        shutdown.stop(StopReason::Signal);
    });
    let first = first.unwrap();

    assert_eq!(first.outcome, RunOutcome::Interrupted(StopReason::Signal));
    assert_eq!(first.outcome.exit_code(), 2);
    assert_eq!(first.counts.completed, 40);
    assert_eq!(first.counts.remaining(), 60);

    let saved = harness.load_state(&first).unwrap();
    let counts = saved.state_counts();
    assert_eq!(counts.get(&TaskState::Completed).copied(), Some(40));
    assert!(!counts.contains_key(&TaskState::Failed));

    harness.service.release_completions();
    let second = harness.run(StartMode::Auto).await.unwrap();

    assert!(second.resumed);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.state_path, first.state_path);
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.outcome.exit_code(), 0);
    assert_eq!(second.counts.completed, 100);
    assert_eq!(harness.service.max_submissions(), 1);
    assert_eq!(harness.service.total_submissions(), 100);
}

#[tokio::test(start_paused = true)]
async fn test_runtime_budget_stops_before_deadline() {
    let mut harness = Harness::new(30, 3, 2);
    harness.config.pool.poll_interval_secs = 10;
    harness.config.runtime.max_runtime_minutes = Some(1);

    let first = harness.run(StartMode::Auto).await.unwrap();

    assert_eq!(first.outcome, RunOutcome::Interrupted(StopReason::Deadline));
    assert!(first.counts.remaining() > 0);
    let saved = harness.load_state(&first).unwrap();
    assert!(saved.tasks.values().all(|t| t.state != TaskState::Failed));

    harness.config.runtime.max_runtime_minutes = None;
    let second = harness.run(StartMode::Auto).await.unwrap();

    assert!(second.resumed);
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.counts.completed, 30);
    assert_eq!(harness.service.max_submissions(), 1);
}

#[tokio::test]
async fn test_stray_temp_file_is_ignored() {
    let harness = Harness::new(10, 2, 0);
    let first = harness.run(StartMode::Auto).await.unwrap();

    let name = first.state_path.file_name().unwrap().to_str().unwrap();
    let stray = harness.state_dir().join(format!(".{name}.tmp.4242"));
    fs::write(&stray, "{\"schemaVersion\": 1, \"tasks\": ").unwrap();

    let second = harness.run(StartMode::Auto).await.unwrap();
    assert!(second.resumed);
    assert_eq!(second.state_path, first.state_path);
    assert_eq!(second.counts.completed, 10);
    assert_eq!(harness.service.total_submissions(), 10);
}

#[tokio::test]
async fn test_reset_starts_a_new_run() {
    let harness = Harness::new(10, 2, 0);
    let first = harness.run(StartMode::Auto).await.unwrap();

    let second = harness.run(StartMode::Reset).await.unwrap();

    assert!(!second.resumed);
    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.counts.completed, 10);
    assert_eq!(harness.service.max_submissions(), 2);
}

#[tokio::test]
async fn test_resume_without_state_is_fatal() {
    let harness = Harness::new(10, 2, 0);
    let shutdown = ShutdownCoordinator::new();

    let err = harness
        .prepare(StartMode::Resume, &shutdown)
        .await
        .err()
        .unwrap();

    assert!(err.is_fatal());
    assert_eq!(harness.service.remote_calls(), 0);
}

#[tokio::test]
async fn test_corrupt_state_is_never_overwritten() {
    let harness = Harness::new(10, 2, 0);
    let path = harness
        .state_dir()
        .join(StateStore::default_file_name(&context(&harness), Utc::now()));
    fs::write(&path, "not json at all").unwrap();

    let err = harness.run(StartMode::Auto).await.unwrap_err();

    assert!(matches!(err, Error::StateCorrupt { .. }));
    assert!(err.is_fatal());
    assert_eq!(fs::read_to_string(&path).unwrap(), "not json at all");
    assert_eq!(harness.service.remote_calls(), 0);
}

#[tokio::test]
async fn test_newer_schema_is_rejected() {
    let harness = Harness::new(10, 2, 0);
    let path = harness
        .state_dir()
        .join(StateStore::default_file_name(&context(&harness), Utc::now()));
    fs::write(&path, r#"{"schemaVersion": 99, "tasks": {}}"#).unwrap();

    let err = harness.run(StartMode::Auto).await.unwrap_err();

    assert!(matches!(err, Error::SchemaMismatch { found: 99, .. }));
    assert_eq!(harness.service.remote_calls(), 0);
}
