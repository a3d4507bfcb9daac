//! End-to-end tests of the migration lifecycle against the in-memory
//! platform.
//!
//! - Pre-flight validation scenarios (ready, already migrated, sync)
//! - Blocked attempts perform no mutation
//! - Sync history chaining across repeated runs
//! - Failure records name the last completed step; no rollback
//! - Deny-list restriction for a named group
//! - Project scaffolding

mod common;

use common::{SOURCE_TOKEN, TARGET_PAT, harness, harness_with, standard_platform};
use ferry_core::config::ScaffoldConfig;
use ferry_core::migration::{
    MigrationError, MigrationKind, MigrationRequest, MigrationStep, Orchestrator, Scaffolder,
};
use ferry_core::reconcile::{Origin, ReconcileError, ResourceKind};
use ferry_core::testing::{FakeMirror, FakeResponse};
use ferry_core::transport::Method;

fn billing() -> MigrationRequest {
    MigrationRequest::new("platform/billing", "Payments")
}

// =============================================================================
// Pre-flight validation
// =============================================================================

#[test]
fn test_scenario_ready_when_repository_absent() {
    let h = harness(standard_platform());
    let report = Orchestrator::new(&h.session).validate(&billing()).unwrap();

    assert!(report.ready);
    assert!(report.blocking.is_empty());
    assert!(!report.sync_mode);
    let facts = report.source_facts.as_ref().unwrap();
    assert_eq!(facts.default_branch.as_deref(), Some("main"));
    assert_eq!(facts.size_bytes, Some(4096));

    let stored = h.session.store().load_precondition(&billing()).unwrap();
    assert_eq!(stored, Some(report));
}

#[test]
fn test_scenario_revalidation_after_migration_blocks_without_sync() {
    let h = harness(standard_platform());
    let orchestrator = Orchestrator::new(&h.session);
    orchestrator.run(&billing()).unwrap();

    let report = orchestrator.validate(&billing()).unwrap();
    assert!(!report.ready);
    assert_eq!(report.blocking.len(), 1);
    assert!(report.blocking[0].starts_with("repository already exists"));
}

#[test]
fn test_scenario_revalidation_with_sync_is_ready() {
    let h = harness(standard_platform());
    let orchestrator = Orchestrator::new(&h.session);
    orchestrator.run(&billing()).unwrap();

    let report = orchestrator.validate(&billing().with_sync(true)).unwrap();
    assert!(report.ready);
    assert!(report.blocking.is_empty());
    assert!(report.sync_mode);
}

#[test]
fn test_validation_never_mutates() {
    let h = harness(standard_platform());
    let orchestrator = Orchestrator::new(&h.session);
    orchestrator.validate(&billing()).unwrap();
    orchestrator
        .validate(&MigrationRequest::new("platform/billing", "Missing"))
        .unwrap();

    let writes = h
        .platform
        .requests()
        .into_iter()
        .filter(|r| r.method != Method::Get)
        .count();
    assert_eq!(writes, 0);
}

#[test]
fn test_missing_target_project_blocks_with_no_mutation() {
    let h = harness(standard_platform());
    let request = MigrationRequest::new("platform/billing", "Ghost");
    let err = Orchestrator::new(&h.session).run(&request).unwrap_err();

    let MigrationError::Blocked { report } = err else {
        panic!("expected a blocked attempt, got {err:?}");
    };
    assert_eq!(
        report.blocking,
        vec!["target project 'Ghost' does not exist; create it before migrating"]
    );
    assert!(h.mirror.calls().is_empty());
    assert_eq!(h.platform.count_requests(Method::Post, ""), 0);
    assert!(h.session.store().load_record(&request).unwrap().is_none());
}

#[test]
fn test_missing_and_empty_source_block() {
    let platform = standard_platform().with_source_project("platform/empty", None);
    let h = harness(platform);
    let orchestrator = Orchestrator::new(&h.session);

    let missing = orchestrator
        .validate(&MigrationRequest::new("platform/nope", "Payments"))
        .unwrap();
    assert_eq!(
        missing.blocking,
        vec!["source project 'platform/nope' was not found"]
    );

    let empty = orchestrator
        .run(&MigrationRequest::new("platform/empty", "Payments"))
        .unwrap_err();
    assert!(empty.is_blocked());
}

// =============================================================================
// Migration and sync
// =============================================================================

#[test]
fn test_initial_migration_reconciles_everything() {
    let h = harness(standard_platform());
    let record = Orchestrator::new(&h.session).run(&billing()).unwrap();

    assert_eq!(record.kind, MigrationKind::Initial);
    assert_eq!(record.migration_count, 1);
    assert!(record.history.is_empty());
    assert_eq!(record.target, "Payments/billing");
    assert_eq!(record.outcome.repository_origin, Origin::Created);
    assert_eq!(record.outcome.default_branch, "main");
    assert_eq!(record.outcome.branch_policies.len(), 2);
    assert!(record.outcome.restriction.is_none());
    assert!(record.duration_secs >= 0.0);

    let calls = h.mirror.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].source, "platform/billing");
    assert_eq!(calls[0].target, "Payments/billing");
    assert!(calls[0].credentialed);

    assert_eq!(h.platform.repository_names("Payments"), vec!["billing"]);
    assert_eq!(h.platform.policy_count(), 2);
    assert_eq!(
        h.session.store().load_record(&billing()).unwrap(),
        Some(record)
    );
}

#[test]
fn test_sync_chain_preserves_history() {
    let h = harness(standard_platform());
    let orchestrator = Orchestrator::new(&h.session);
    let first = orchestrator.run(&billing()).unwrap();

    let mut last = first.clone();
    for k in 2..=4u32 {
        last = orchestrator.run(&billing().with_sync(true)).unwrap();
        assert_eq!(last.kind, MigrationKind::Sync);
        assert_eq!(last.migration_count, k);
        assert_eq!(last.history.len(), (k - 1) as usize);
        assert_eq!(last.outcome.repository_origin, Origin::Reused);
    }

    assert_eq!(last.history[0], first);
    let counts: Vec<u32> = last.history.iter().map(|r| r.migration_count).collect();
    assert_eq!(counts, vec![1, 2, 3]);
    assert!(last.history.iter().all(|r| r.history.is_empty()));
    assert!(
        last.history
            .windows(2)
            .all(|w| w[0].started_at <= w[1].started_at)
    );
}

#[test]
fn test_sync_reconciliation_is_idempotent() {
    let h = harness(standard_platform());
    let orchestrator = Orchestrator::new(&h.session);
    let first = orchestrator.run(&billing()).unwrap();
    h.platform.clear_requests();

    let second = orchestrator.run(&billing().with_sync(true)).unwrap();
    assert_eq!(second.outcome.repository_id, first.outcome.repository_id);
    assert_eq!(second.outcome.branch_policies, first.outcome.branch_policies);
    assert_eq!(
        h.platform
            .count_requests(Method::Post, "_apis/git/repositories"),
        0
    );
    assert_eq!(
        h.platform
            .count_requests(Method::Post, "_apis/policy/configurations"),
        0
    );
    assert_eq!(h.platform.policy_count(), 2);
}

#[test]
fn test_sync_against_unrecorded_repository_starts_fresh_chain() {
    let platform = standard_platform().with_repository("Payments", "billing");
    let h = harness(platform);
    let record = Orchestrator::new(&h.session)
        .run(&billing().with_sync(true))
        .unwrap();

    assert_eq!(record.kind, MigrationKind::Sync);
    assert_eq!(record.migration_count, 1);
    assert!(record.history.is_empty());
    assert_eq!(record.outcome.repository_origin, Origin::Reused);
}

#[test]
fn test_sync_against_absent_repository_is_initial() {
    let h = harness(standard_platform());
    let record = Orchestrator::new(&h.session)
        .run(&billing().with_sync(true))
        .unwrap();

    assert_eq!(record.kind, MigrationKind::Initial);
    assert_eq!(record.migration_count, 1);
    assert!(record.history.is_empty());
    assert_eq!(record.outcome.repository_origin, Origin::Created);
}

#[test]
fn test_recreated_repository_does_not_inherit_history() {
    let earlier = harness(standard_platform());
    let first = Orchestrator::new(&earlier.session).run(&billing()).unwrap();

    // Same stored record, but the target repository is gone.
    let h = harness(standard_platform());
    h.session.store().save_record(&billing(), &first).unwrap();
    let record = Orchestrator::new(&h.session)
        .run(&billing().with_sync(true))
        .unwrap();

    assert_eq!(record.kind, MigrationKind::Initial);
    assert_eq!(record.migration_count, 1);
    assert!(record.history.is_empty());
    assert_eq!(h.platform.repository_names("Payments"), vec!["billing"]);
    let stored = h.session.store().load_record(&billing()).unwrap().unwrap();
    assert_eq!(stored.kind, MigrationKind::Initial);
    assert!(stored.history.is_empty());
}

#[test]
fn test_explicit_repository_name() {
    let h = harness(standard_platform());
    let request = billing().with_target_repository("billing-core");
    let record = Orchestrator::new(&h.session).run(&request).unwrap();
    assert_eq!(record.target, "Payments/billing-core");
    assert_eq!(h.platform.repository_names("Payments"), vec!["billing-core"]);
}

#[test]
fn test_restricted_group_gets_deny_entry() {
    let platform = standard_platform().with_group("Payments", "Contractors");
    let h = harness_with(
        platform,
        FakeMirror::new(),
        "[migration]\nrestricted_group = \"Contractors\"\n",
    );
    let record = Orchestrator::new(&h.session).run(&billing()).unwrap();

    let restriction = record.outcome.restriction.unwrap();
    assert_eq!(restriction.deny, 4 | 8 | 16 | 32);
    assert!(restriction.token.starts_with("repoV2/"));
    assert!(restriction.token.ends_with(&record.outcome.repository_id));
    assert_eq!(
        h.platform
            .deny_bits(&restriction.token, &restriction.descriptor),
        Some(60)
    );
}

#[test]
fn test_absent_restricted_group_is_skipped() {
    let h = harness_with(
        standard_platform(),
        FakeMirror::new(),
        "[migration]\nrestricted_group = \"Contractors\"\n",
    );
    let record = Orchestrator::new(&h.session).run(&billing()).unwrap();
    assert!(record.outcome.restriction.is_none());
    assert_eq!(
        h.platform.count_requests(Method::Post, "accesscontrolentries"),
        0
    );
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_mirror_failure_keeps_repository_and_records_step() {
    let h = harness_with(
        standard_platform(),
        FakeMirror::new().failing_for("platform/billing"),
        "",
    );
    let err = Orchestrator::new(&h.session).run(&billing()).unwrap_err();
    assert!(matches!(err, MigrationError::Mirror(_)));

    let failure = h.session.store().load_failure(&billing()).unwrap().unwrap();
    assert_eq!(failure.last_completed_step, MigrationStep::Repository);
    assert!(failure.error.contains("remote rejected push"));
    assert!(failure.elapsed_secs >= 0.0);

    assert_eq!(h.platform.repository_names("Payments"), vec!["billing"]);
    assert!(h.session.store().load_record(&billing()).unwrap().is_none());
}

#[test]
fn test_policy_failure_records_mirror_step_and_retry_converges() {
    let h = harness(standard_platform());
    h.platform.inject(
        Some(Method::Post),
        "_apis/policy/configurations",
        FakeResponse::Status(403, r#"{"message":"TF401027: permission denied"}"#.to_string()),
        Some(1),
    );
    let orchestrator = Orchestrator::new(&h.session);
    let err = orchestrator.run(&billing()).unwrap_err();
    let MigrationError::Reconcile(ReconcileError::Transport(normalized)) = &err else {
        panic!("expected a transport failure, got {err:?}");
    };
    assert_eq!(normalized.status, 403);

    let failure = h.session.store().load_failure(&billing()).unwrap().unwrap();
    assert_eq!(failure.last_completed_step, MigrationStep::Mirror);

    let blocked = orchestrator.run(&billing()).unwrap_err();
    assert!(blocked.is_blocked());

    let record = orchestrator.run(&billing().with_sync(true)).unwrap();
    assert_eq!(record.migration_count, 1);
    assert_eq!(h.platform.policy_count(), 2);
    assert!(h.session.store().load_failure(&billing()).unwrap().is_none());
}

#[test]
fn test_failure_record_never_leaks_credentials() {
    let h = harness(standard_platform());
    h.platform.inject(
        Some(Method::Post),
        "_apis/git/repositories",
        FakeResponse::Status(
            500,
            format!(r#"{{"message":"upstream rejected token {TARGET_PAT} and {SOURCE_TOKEN}"}}"#),
        ),
        None,
    );
    let err = Orchestrator::new(&h.session).run(&billing()).unwrap_err();
    assert!(!err.to_string().contains(TARGET_PAT));

    let failure = h.session.store().load_failure(&billing()).unwrap().unwrap();
    assert_eq!(failure.last_completed_step, MigrationStep::None);
    assert!(!failure.error.contains(TARGET_PAT));
    assert!(!failure.error.contains(SOURCE_TOKEN));
    assert_eq!(
        h.platform
            .count_requests(Method::Post, "_apis/git/repositories"),
        3
    );
}

// =============================================================================
// Scaffolding
// =============================================================================

#[test]
fn test_scaffold_is_idempotent() {
    let h = harness(standard_platform());
    let config: ScaffoldConfig = toml::from_str(
        r#"
        wiki = "Handbook"

        [[groups]]
        name = "Release Managers"
        members = ["aad.alice", "aad.bob"]

        [[templates]]
        name = "Bug triage"
        work_item_type = "Bug"
        fields = { "System.Tags" = "triage" }
        "#,
    )
    .unwrap();
    let scaffolder = Scaffolder::new(h.session.reconciler());

    let first = scaffolder.apply("Payments", &config).unwrap();
    let kinds: Vec<ResourceKind> = first.entries.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ResourceKind::Group,
            ResourceKind::Membership,
            ResourceKind::Membership,
            ResourceKind::Wiki,
            ResourceKind::WorkItemTemplate,
        ]
    );
    assert_eq!(first.created(), 5);
    let group = &first.entries[0].id;
    assert!(h.platform.has_membership("aad.alice", group));

    let second = scaffolder.apply("Payments", &config).unwrap();
    assert_eq!(second.created(), 0);
    assert_eq!(h.platform.group_count(), 1);
    assert!(
        h.platform
            .requests()
            .iter()
            .any(|r| r.url.contains("/Payments%20Team/_apis/wit/templates"))
    );
}

#[test]
fn test_scaffold_never_creates_project() {
    let h = harness(standard_platform());
    let err = Scaffolder::new(h.session.reconciler())
        .apply("Ghost", &ScaffoldConfig::default())
        .unwrap_err();
    assert!(matches!(err, ReconcileError::ProjectNotFound { .. }));
    assert_eq!(h.platform.count_requests(Method::Post, ""), 0);
}
