//! Batch runs: per-item isolation, ordering and the persisted report.

mod common;

use common::{harness, harness_with, standard_platform};
use ferry_core::batch::{BatchCoordinator, BatchItem, ItemStatus, parse_batch};
use ferry_core::testing::FakeMirror;
use ferry_core::transport::Method;

fn three_items() -> Vec<BatchItem> {
    vec![
        BatchItem::new("platform/billing"),
        BatchItem::new("platform/ledger"),
        BatchItem::new("platform/audit"),
    ]
}

#[test]
fn test_scenario_missing_project_fails_only_that_item() {
    let h = harness(standard_platform());
    let items = vec![
        BatchItem::new("platform/billing"),
        BatchItem::new("platform/ledger").with_target_project("Ghost"),
        BatchItem::new("platform/audit"),
    ];
    let report = BatchCoordinator::new(&h.session).run_batch(&items, "Payments", false);

    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert!(!report.all_succeeded());

    let failed: Vec<_> = report
        .items
        .iter()
        .filter(|o| !o.status.is_success())
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].index, 1);
    assert_eq!(failed[0].status, ItemStatus::Blocked);
    assert_eq!(failed[0].target, "Ghost/ledger");
    assert!(failed[0].message.as_deref().unwrap().contains("'Ghost'"));

    assert_eq!(h.platform.repository_names("Payments"), vec!["billing", "audit"]);
}

#[test]
fn test_failure_is_isolated_at_every_position() {
    let sources = ["platform/billing", "platform/ledger", "platform/audit"];
    for (position, failing) in sources.iter().enumerate() {
        let h = harness_with(
            standard_platform(),
            FakeMirror::new().failing_for(failing),
            "",
        );
        let report = BatchCoordinator::new(&h.session).run_batch(&three_items(), "Payments", false);

        assert_eq!(report.succeeded, 2, "failing position {position}");
        assert_eq!(report.failed, 1, "failing position {position}");
        for outcome in &report.items {
            if outcome.index == position {
                assert_eq!(outcome.status, ItemStatus::Failed);
                assert!(outcome.message.as_deref().unwrap().contains(failing));
                assert_eq!(outcome.migration_count, None);
            } else {
                assert_eq!(outcome.status, ItemStatus::Succeeded);
                assert_eq!(outcome.migration_count, Some(1));
                assert!(outcome.message.is_none());
            }
        }
        // The failed item's repository was created before the mirror step.
        assert_eq!(h.platform.repository_names("Payments").len(), 3);
    }
}

#[test]
fn test_items_run_in_input_order() {
    let h = harness(standard_platform());
    let mut items = three_items();
    items.reverse();
    let report = BatchCoordinator::new(&h.session).run_batch(&items, "Payments", false);

    let sources: Vec<&str> = report.items.iter().map(|o| o.source.as_str()).collect();
    assert_eq!(
        sources,
        vec!["platform/audit", "platform/ledger", "platform/billing"]
    );
    let mirrored: Vec<String> = h.mirror.calls().into_iter().map(|c| c.source).collect();
    assert_eq!(mirrored, sources);
    let indices: Vec<usize> = report.items.iter().map(|o| o.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[test]
fn test_batch_sync_extends_each_chain() {
    let h = harness(standard_platform());
    let coordinator = BatchCoordinator::new(&h.session);
    let first = coordinator.run_batch(&three_items(), "Payments", false);
    assert!(first.all_succeeded());

    let rerun = coordinator.run_batch(&three_items(), "Payments", false);
    assert_eq!(rerun.failed, 3);
    assert!(rerun.items.iter().all(|o| o.status == ItemStatus::Blocked));
    assert_eq!(h.platform.count_requests(Method::Post, "_apis/git/repositories"), 3);

    let synced = coordinator.run_batch(&three_items(), "Payments", true);
    assert!(synced.all_succeeded());
    assert!(synced.sync);
    assert!(synced.items.iter().all(|o| o.migration_count == Some(2)));
}

#[test]
fn test_report_is_persisted_under_run_id() {
    let h = harness(standard_platform());
    let items = parse_batch("platform/billing\nplatform/ledger=ledger-core\n").unwrap();
    let report = BatchCoordinator::new(&h.session).run_batch(&items, "Payments", false);

    assert_eq!(report.items[1].target, "Payments/ledger-core");
    assert!(report.finished_at >= report.started_at);

    let stored = h.session.store().load_batch(&report.run_id).unwrap();
    assert_eq!(stored, Some(report));
    assert!(h.state_dir.path().join("batches").is_dir());
}

#[test]
fn test_empty_batch() {
    let h = harness(standard_platform());
    let report = BatchCoordinator::new(&h.session).run_batch(&[], "Payments", false);
    assert_eq!(report.total, 0);
    assert!(report.all_succeeded());
    assert!(h.mirror.calls().is_empty());
}
