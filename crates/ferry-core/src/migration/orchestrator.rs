//! Drives one migration attempt through its lifecycle.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    CompletedAttempt, FailureRecord, MigrationError, MigrationOutcome, MigrationRecord,
    MigrationRequest, MigrationState, MigrationStep, MirrorJob, PreconditionReport, Remote,
    SourceFacts, SourceProjectPayload, TargetFlags, round_duration,
};
use crate::Session;
use crate::reconcile::{
    BranchPolicySpec, ProjectRef, ReconcileError, Reconciler, RepositorySpec, ResourceKind,
};
use crate::transport::{Method, Side, encode_component};

/// User name the source platform expects alongside a token in clone URLs.
const SOURCE_CLONE_USER: &str = "oauth2";

/// Runs validation and migration for single requests.
#[derive(Debug, Clone, Copy)]
pub struct Orchestrator<'a> {
    session: &'a Session,
}

/// Everything validation learned that migration needs.
struct Validated {
    report: PreconditionReport,
    project: Option<ProjectRef>,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator over a session.
    #[must_use]
    pub const fn new(session: &'a Session) -> Self {
        Self { session }
    }

    fn reconciler(&self) -> Reconciler<'a> {
        Reconciler::new(self.session.client())
    }

    /// Runs pre-flight validation and persists the report.
    ///
    /// Nothing on either platform is mutated. The report is returned whether
    /// or not it is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if a lookup fails or the report cannot be persisted.
    pub fn validate(
        &self,
        request: &MigrationRequest,
    ) -> Result<PreconditionReport, MigrationError> {
        Ok(self.gather(request)?.report)
    }

    fn gather(&self, request: &MigrationRequest) -> Result<Validated, MigrationError> {
        let source_facts = self.source_facts(&request.source_path)?;
        let reconciler = self.reconciler();
        let project = reconciler.find_project(&request.target_project)?;
        let repository_exists = match &project {
            Some(project) => reconciler
                .find_repository(project, request.target_repository())?
                .is_some(),
            None => false,
        };
        let flags = TargetFlags {
            project_exists: project.is_some(),
            repository_exists,
        };

        let report = PreconditionReport::evaluate(request, source_facts, flags, Utc::now());
        let path = self.session.store().save_precondition(request, &report)?;
        tracing::debug!(
            path = %path.display(),
            ready = report.ready,
            "precondition report saved"
        );
        Ok(Validated { report, project })
    }

    /// Reads the source project, mapping absence to `None`.
    fn source_facts(&self, path: &str) -> Result<Option<SourceFacts>, MigrationError> {
        let endpoint = format!("api/v4/projects/{}?statistics=true", encode_component(path));
        let response = match self
            .session
            .client()
            .send(Method::Get, &endpoint, None, Side::Source)
        {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let payload: SourceProjectPayload = response.json()?;
        Ok(Some(SourceFacts::from(payload)))
    }

    /// Runs one full attempt.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Blocked`] with the full report when
    /// validation finds blocking issues. Any failure after validation is
    /// recorded in the pair's failure record and returned unchanged; created
    /// resources are kept.
    pub fn run(&self, request: &MigrationRequest) -> Result<MigrationRecord, MigrationError> {
        let started_at = Utc::now();
        let mut state = MigrationState::NotStarted.transition(MigrationState::Validating)?;

        let Validated { report, project } = self.gather(request)?;
        let ready = report.ready;
        let (project, facts) = match (project, report.source_facts.clone()) {
            (Some(project), Some(facts)) if ready => (project, facts),
            _ => {
                state.transition(MigrationState::Blocked)?;
                tracing::info!(
                    source = %request.source_path,
                    target = %request.target_display(),
                    outcome = MigrationState::Blocked.as_str(),
                    issues = %report.blocking.join("; "),
                    "migration finished"
                );
                return Err(MigrationError::Blocked {
                    report: Box::new(report),
                });
            },
        };
        state = state.transition(MigrationState::Ready)?;

        // A sync request against an absent repository is an initial migration.
        let sync_mode = report.sync_mode;
        let predecessor = if sync_mode {
            self.session.store().load_record(request)?
        } else {
            None
        };
        state = state.transition(MigrationState::Migrating)?;

        let mut step = MigrationStep::None;
        let outcome = match self.migrate(request, &project, &facts, &mut step) {
            Ok(outcome) => outcome,
            Err(error) => {
                state.transition(MigrationState::Failed)?;
                self.record_failure(request, &error, started_at, step);
                return Err(error);
            },
        };

        let record = MigrationRecord::completed(
            CompletedAttempt {
                source: request.source_path.clone(),
                source_id: facts.id,
                target: request.target_display(),
                started_at,
                finished_at: Utc::now(),
                outcome,
            },
            sync_mode,
            predecessor,
        );
        if let Err(error) = self.session.store().save_record(request, &record) {
            let error = MigrationError::from(error);
            state.transition(MigrationState::Failed)?;
            self.record_failure(request, &error, started_at, step);
            return Err(error);
        }
        if let Err(e) = self.session.store().clear_failure(request) {
            tracing::warn!(error = %e, "failed to remove stale failure record");
        }
        state.transition(MigrationState::Completed)?;

        tracing::info!(
            source = %record.source,
            target = %record.target,
            outcome = MigrationState::Completed.as_str(),
            kind = %record.kind,
            migration_count = record.migration_count,
            duration_secs = record.duration_secs,
            "migration finished"
        );
        Ok(record)
    }

    /// The mutating part of an attempt. `step` tracks the last completed
    /// step for the failure record.
    fn migrate(
        &self,
        request: &MigrationRequest,
        project: &ProjectRef,
        facts: &SourceFacts,
        step: &mut MigrationStep,
    ) -> Result<MigrationOutcome, MigrationError> {
        let reconciler = self.reconciler();
        let config = self.session.config();
        let credentials = self.session.credentials();

        let repository = reconciler.ensure(
            project,
            &RepositorySpec::new(request.target_repository()),
            request.sync,
        )?;
        *step = MigrationStep::Repository;

        let remote_url = repository
            .payload
            .get("remoteUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| ReconcileError::UnexpectedPayload {
                kind: ResourceKind::Repository,
                reason: "missing 'remoteUrl'".to_string(),
            })?;
        let job = MirrorJob {
            source: Remote::new(
                &facts.clone_url,
                SOURCE_CLONE_USER,
                &credentials.source_token,
            )?,
            target: Remote::new(
                remote_url,
                &credentials.target_user,
                &credentials.target_pat,
            )?,
            lfs: facts.lfs_enabled,
            source_display: request.source_path.clone(),
            target_display: request.target_display(),
        };
        self.session.mirror().mirror(&job)?;
        *step = MigrationStep::Mirror;

        let default_branch =
            facts
                .default_branch
                .clone()
                .ok_or_else(|| MigrationError::MissingDefaultBranch {
                    source_path: request.source_path.clone(),
                })?;
        let mut branch_policies = Vec::new();
        for spec in BranchPolicySpec::from_config(
            &repository.id,
            &default_branch,
            &config.migration.branch_policies,
        ) {
            branch_policies.push(reconciler.ensure(project, &spec, false)?.id);
        }
        *step = MigrationStep::BranchPolicies;

        let restriction = match &config.migration.restricted_group {
            Some(group_name) => match reconciler.find_group(project, group_name)? {
                Some(group) => {
                    let subject = group
                        .get("descriptor")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ReconcileError::UnexpectedPayload {
                            kind: ResourceKind::Group,
                            reason: "missing 'descriptor'".to_string(),
                        })?;
                    let identity = reconciler.identity_descriptor(subject)?;
                    Some(reconciler.deny_permissions(
                        project,
                        &repository.id,
                        &identity,
                        &config.migration.deny_permissions,
                    )?)
                },
                None => {
                    tracing::info!(
                        group = %group_name,
                        project = %project.name,
                        "restricted group not present; skipping permission restriction"
                    );
                    None
                },
            },
            None => None,
        };
        *step = MigrationStep::Security;

        Ok(MigrationOutcome {
            repository_id: repository.id,
            repository_origin: repository.origin,
            default_branch,
            branch_policies,
            restriction,
        })
    }

    /// Persists the failure record. A write failure is logged and never
    /// replaces the original error.
    fn record_failure(
        &self,
        request: &MigrationRequest,
        error: &MigrationError,
        started_at: DateTime<Utc>,
        step: MigrationStep,
    ) {
        let recorded_at = Utc::now();
        let elapsed = (recorded_at - started_at)
            .to_std()
            .map_or(0.0, |d| d.as_secs_f64());
        let failure = FailureRecord {
            state: MigrationState::Failed,
            error: self.session.client().redact(&error.to_string()),
            elapsed_secs: round_duration(elapsed),
            last_completed_step: step,
            recorded_at,
        };
        if let Err(e) = self.session.store().save_failure(request, &failure) {
            tracing::warn!(error = %e, "failed to persist failure record");
        }
        tracing::info!(
            source = %request.source_path,
            target = %request.target_display(),
            outcome = MigrationState::Failed.as_str(),
            last_completed_step = %step,
            elapsed_secs = failure.elapsed_secs,
            error = %failure.error,
            "migration finished"
        );
    }
}
