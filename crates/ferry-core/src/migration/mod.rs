//! Migration orchestration.
//!
//! One [`MigrationRequest`] moves a source project's repository into a
//! target project:
//!
//! 1. **Validate**: gather [`SourceFacts`] and [`TargetFlags`] into a
//!    [`PreconditionReport`]. Any blocking issue ends the attempt before a
//!    single mutation.
//! 2. **Migrate**: reconcile the repository, mirror its content, reconcile
//!    branch policies on the default branch and the deny-list restriction.
//! 3. **Record**: a completed attempt produces a [`MigrationRecord`]; a sync
//!    run chains onto the previous record.
//!
//! A failure while migrating is recorded and re-raised. Nothing created so
//! far is rolled back; the next attempt converges through reconciliation.

mod mirror;
mod orchestrator;
mod record;
mod report;
mod scaffold;
mod state;
mod store;

use thiserror::Error;

pub use mirror::{GitMirror, MirrorError, MirrorJob, Remote, RepositoryMirror};
pub use orchestrator::Orchestrator;
pub use record::{
    CompletedAttempt, MigrationKind, MigrationOutcome, MigrationRecord, round_duration,
};
pub(crate) use report::SourceProjectPayload;
pub use report::{PreconditionReport, SourceFacts, TargetFlags};
pub use scaffold::{ScaffoldEntry, ScaffoldReport, Scaffolder};
pub use state::MigrationState;
pub use store::{FailureRecord, MigrationStep, StateStore, StoreError, pair_key};

use crate::reconcile::ReconcileError;
use crate::transport::NormalizedError;

/// Errors raised by a migration attempt.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MigrationError {
    /// Validation found blocking issues; nothing was mutated.
    #[error("migration blocked: {}", .report.blocking.join("; "))]
    Blocked {
        /// The full precondition report.
        report: Box<PreconditionReport>,
    },

    /// A state transition that the lifecycle does not allow.
    #[error("invalid migration state transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: MigrationState,
        /// Requested state.
        to: MigrationState,
    },

    /// The source repository has no default branch to protect.
    #[error("source project '{source_path}' has no default branch")]
    MissingDefaultBranch {
        /// Source project path.
        source_path: String,
    },

    /// A request failed.
    #[error(transparent)]
    Transport(#[from] NormalizedError),

    /// Reconciling a target resource failed.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// Mirroring the repository content failed.
    #[error(transparent)]
    Mirror(#[from] MirrorError),

    /// Persisting state failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MigrationError {
    /// Whether the attempt ended in validation rather than failing.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// One unit of migration work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRequest {
    /// Source project path, e.g. `group/sub/project`.
    pub source_path: String,
    /// Target project name.
    pub target_project: String,
    /// Target repository name; defaults to the last source path segment.
    pub target_repository: Option<String>,
    /// Permit running against an existing target repository.
    pub sync: bool,
}

impl MigrationRequest {
    /// Creates an initial-migration request.
    #[must_use]
    pub fn new(source_path: impl Into<String>, target_project: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into().trim_matches('/').to_string(),
            target_project: target_project.into(),
            target_repository: None,
            sync: false,
        }
    }

    /// Sets the sync flag.
    #[must_use]
    pub const fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Names the target repository explicitly.
    #[must_use]
    pub fn with_target_repository(mut self, name: impl Into<String>) -> Self {
        self.target_repository = Some(name.into());
        self
    }

    /// The effective target repository name.
    #[must_use]
    pub fn target_repository(&self) -> &str {
        match self.target_repository.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => self
                .source_path
                .rsplit('/')
                .next()
                .unwrap_or(&self.source_path),
        }
    }

    /// `<project>/<repository>`, as shown in records and logs.
    #[must_use]
    pub fn target_display(&self) -> String {
        format!("{}/{}", self.target_project, self.target_repository())
    }
}
