//! End-to-end runs against the simulated backup service

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use vaultshift_engine::{
    FilterCriteria, FilterRule, FilterRuleSet, MetadataTable, RunOutcome, ShutdownCoordinator,
    StartMode, StopReason, SummaryReport, TaskState,
};
use vaultshift_tests::{item_id, Harness};

#[tokio::test]
async fn test_hundred_items_complete_with_ten_workers() {
    let harness = Harness::new(100, 10, 2);

    let report = harness.run(StartMode::Auto).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.outcome.exit_code(), 0);
    assert_eq!(report.counts.completed, 100);
    assert_eq!(report.counts.remaining(), 0);
    assert_eq!(report.pool.submitted, 100);
    assert_eq!(harness.service.total_submissions(), 100);
    assert_eq!(harness.service.max_submissions(), 1);

    let state = harness.load_state(&report).unwrap();
    assert_eq!(state.tasks.len(), 100);
    assert!(state.tasks.values().all(|t| t.state == TaskState::Completed));
    assert!(state.tasks.values().all(|t| t.job_id.is_some()));
}

#[tokio::test]
async fn test_failures_retries_and_rejections() {
    let harness = Harness::new(20, 4, 1);
    let rejected = item_id(3);
    let flaky = item_id(5);
    let throttled = item_id(7);
    harness.service.reject(&rejected);
    harness.service.fail_jobs(&flaky, 1);
    harness.service.throttle_submissions(&throttled, 2);

    let report = harness.run(StartMode::Auto).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::CompletedWithFailures);
    assert_eq!(report.outcome.exit_code(), 1);
    assert_eq!(report.counts.completed, 19);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.summary.failures.len(), 1);
    assert_eq!(report.summary.failures[0].recovery_point_arn, rejected);

    let state = harness.load_state(&report).unwrap();
    let flaky_task = &state.tasks[&flaky];
    assert_eq!(flaky_task.state, TaskState::Completed);
    assert_eq!(flaky_task.attempts, 2);
    assert_eq!(state.tasks[&throttled].state, TaskState::Completed);
    assert_eq!(state.tasks[&throttled].attempts, 1);
    assert_eq!(harness.service.submissions(&flaky), 2);
}

#[tokio::test]
async fn test_interrupted_run_verifies_complete_after_resume() {
    let harness = Harness::new(30, 5, 1);
    harness.service.hold_completions_after(10);
    let shutdown = ShutdownCoordinator::new();
    let prepared = harness.prepare(StartMode::Auto, &shutdown).await.unwrap();

    let (first, ()) = tokio::join!(prepared.run(), async {
        harness.service.completions_held().await;
        shutdown.stop(StopReason::Signal);
    });
    assert_eq!(first.unwrap().counts.completed, 10);

    let partial = harness.engine().verify(&ShutdownCoordinator::new()).await.unwrap();
    assert!(!partial.is_complete());
    assert_eq!(partial.matched_count, 10);
    assert_eq!(partial.missing_count, 20);

    harness.service.release_completions();
    harness.run(StartMode::Auto).await.unwrap();

    let result = harness.engine().verify(&ShutdownCoordinator::new()).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.source_count, 30);
    assert_eq!(result.dest_count, 30);
    assert_eq!(result.extra_count, 0);
}

#[tokio::test]
async fn test_dry_run_never_submits() {
    let harness = Harness::new(30, 5, 1);
    let shutdown = ShutdownCoordinator::new();

    let prepared = harness.prepare(StartMode::Auto, &shutdown).await.unwrap();
    let report = prepared.dry_run().await;

    assert_eq!(report.total_items, 30);
    assert_eq!(report.to_copy, 30);
    assert_eq!(report.skipped, 0);
    assert!(report.to_copy_size_gb > 0.0);
    assert!(!report.state_path.exists());
    assert_eq!(harness.service.total_submissions(), 0);
}

#[tokio::test]
async fn test_filtered_items_are_skipped() {
    let harness = Harness::new(40, 8, 1);
    let mut rules = FilterRuleSet::default();
    rules.add_rule(FilterRule::include(FilterCriteria::ResourceType("EBS".into())));
    let shutdown = ShutdownCoordinator::new();

    let report = harness
        .engine()
        .with_filter(Arc::new(rules))
        .prepare(StartMode::Auto, &shutdown)
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counts.completed, 20);
    assert_eq!(report.counts.skipped, 20);
    assert_eq!(harness.service.total_submissions(), 20);

    let state = harness.load_state(&report).unwrap();
    let skipped = &state.tasks[&item_id(1)];
    assert_eq!(skipped.state, TaskState::Skipped);
    assert!(skipped
        .skip_reason
        .as_deref()
        .is_some_and(|reason| reason.starts_with("Excluded by filter")));
}

#[tokio::test]
async fn test_metadata_drives_attribute_filter() {
    let harness = Harness::new(10, 2, 1);
    let inventory = harness.service.inventory().to_vec();
    let metadata = MetadataTable::new(inventory.iter().take(6).enumerate().map(|(i, item)| {
        let apmid = if i < 3 { "APM0001" } else { "APM0002" };
        (
            item.resource_arn.clone(),
            BTreeMap::from([("APMID".to_string(), apmid.to_string())]),
        )
    }));
    let mut rules = FilterRuleSet::default();
    rules.add_rule(FilterRule::include(
        FilterCriteria::parse("attribute_in", "APMID=APM0001").unwrap(),
    ));
    let shutdown = ShutdownCoordinator::new();

    let prepared = harness
        .engine()
        .with_metadata(metadata)
        .with_filter(Arc::new(rules))
        .prepare(StartMode::Auto, &shutdown)
        .await
        .unwrap();
    let stats = prepared.enrichment().unwrap();
    assert_eq!(stats.enriched_count, 6);
    assert_eq!(stats.missing_count, 4);

    let report = prepared.run().await.unwrap();
    assert_eq!(report.counts.completed, 3);
    assert_eq!(report.counts.skipped, 7);
}

#[tokio::test]
async fn test_summary_from_saved_state_matches_run() {
    let harness = Harness::new(12, 3, 1);
    harness.service.reject(&item_id(0));

    let report = harness.run(StartMode::Auto).await.unwrap();
    let state = harness.load_state(&report).unwrap();
    let summary = SummaryReport::from_tasks(state.tasks.values(), state.created_at, state.updated_at);

    assert_eq!(summary.total_items, report.summary.total_items);
    assert_eq!(summary.completed, report.summary.completed);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures, report.summary.failures);

    let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
    assert_eq!(json["failed"], 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_every_run_drains_without_duplicates(
        items in 1usize..40,
        workers in 1usize..12,
        polls in 0u32..3,
        flaky in proptest::collection::vec(0usize..40, 0..5),
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let harness = Harness::new(items, workers, polls);
        for index in flaky.iter().filter(|&&i| i < items) {
            harness.service.fail_jobs(&item_id(*index), 1);
        }

        let report = rt.block_on(harness.run(StartMode::Auto)).unwrap();

        prop_assert_eq!(report.counts.remaining(), 0);
        prop_assert_eq!(report.counts.completed, items as u64);
        prop_assert_eq!(report.outcome, RunOutcome::Completed);
        prop_assert!(harness.service.max_submissions() <= 2);
    }
}
