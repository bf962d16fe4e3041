//! Credential expiry while a run is in progress

use std::time::Duration;
use vaultshift_engine::{RunOutcome, ShutdownCoordinator, StartMode, StopReason, TaskState};
use vaultshift_tests::Harness;

/// Let `count` jobs complete, then expire credentials and let the run continue
async fn expire_after(harness: &Harness, count: u64) {
    harness.service.completions_held().await;
    harness.service.expire_credentials();
    harness.service.release_completions();
    assert!(harness.service.completions() >= count);
}

#[tokio::test]
async fn test_expiry_mid_run_reloads_once() {
    let harness = Harness::new(100, 10, 2);
    harness.service.hold_completions_after(20);
    let shutdown = ShutdownCoordinator::new();
    let prepared = harness.prepare(StartMode::Auto, &shutdown).await.unwrap();

    let (report, ()) = tokio::join!(prepared.run(), async {
        expire_after(&harness, 20).await;
    });
    let report = report.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counts.completed, 100);
    assert_eq!(report.credentials.pauses, 1);
    assert_eq!(report.credentials.reloads, 1);
    assert_eq!(report.credentials.reload_failures, 0);
    assert_eq!(report.credentials.prompts, 0);
    assert_eq!(harness.service.reload_calls(), 1);
    assert_eq!(harness.service.session_clears(), 1);
    assert_eq!(harness.service.max_submissions(), 1);
}

#[tokio::test]
async fn test_auth_errors_never_fail_tasks() {
    let harness = Harness::new(100, 10, 2);
    harness.service.fail_next_calls_with_auth(3);

    let report = harness.run(StartMode::Auto).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counts.completed, 100);
    assert_eq!(report.counts.failed, 0);
    assert_eq!(report.credentials.pauses, 1);
    assert_eq!(report.credentials.prompts, 0);
    assert_eq!(harness.service.max_submissions(), 1);
    let state = harness.load_state(&report).unwrap();
    assert!(state.tasks.values().all(|t| t.attempts == 1));
}

#[tokio::test]
async fn test_failed_reloads_block_calls_until_acknowledged() {
    let harness = Harness::new(30, 5, 1);
    harness.service.hold_completions_after(5);
    let shutdown = ShutdownCoordinator::new();
    let prepared = harness.prepare(StartMode::Auto, &shutdown).await.unwrap();
    let mut operator = prepared.credentials().operator();

    let (report, ()) = tokio::join!(prepared.run(), async {
        harness.service.fail_reloads(3);
        expire_after(&harness, 5).await;

        let prompt = operator.next_prompt().await.unwrap();
        assert_eq!(prompt.consecutive_failures, 3);
        assert_eq!(harness.service.reload_calls(), 3);

        let calls = harness.service.remote_calls();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.service.remote_calls(), calls);

        assert!(operator.acknowledge());
    });
    let report = report.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counts.completed, 30);
    assert_eq!(report.credentials.pauses, 1);
    assert_eq!(report.credentials.prompts, 1);
    assert_eq!(report.credentials.reload_failures, 3);
    assert_eq!(harness.service.reload_calls(), 4);
    assert!(operator.pending().is_none());
}

#[tokio::test]
async fn test_stop_while_waiting_for_operator() {
    let harness = Harness::new(30, 5, 1);
    harness.service.hold_completions_after(5);
    let shutdown = ShutdownCoordinator::new();
    let prepared = harness.prepare(StartMode::Auto, &shutdown).await.unwrap();
    let mut operator = prepared.credentials().operator();

    let (report, ()) = tokio::join!(prepared.run(), async {
        harness.service.fail_reloads(u32::MAX);
        expire_after(&harness, 5).await;
        operator.next_prompt().await.unwrap();
        shutdown.stop(StopReason::Signal);
    });
    let report = report.unwrap();

    assert_eq!(report.outcome, RunOutcome::Interrupted(StopReason::Signal));
    assert_eq!(report.outcome.exit_code(), 2);
    assert!(operator.pending().is_none());

    let state = harness.load_state(&report).unwrap();
    let completed = state
        .tasks
        .values()
        .filter(|t| t.state == TaskState::Completed)
        .count() as u64;
    assert_eq!(completed, report.counts.completed);
    assert!(state.tasks.values().all(|t| t.state != TaskState::Failed));
}
