//! Batch migrations with per-item failure isolation.
//!
//! Items run strictly in input order, one after another. Every item gets an
//! outcome in the report: a blocked or failed item is recorded and the run
//! moves on to the next one.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Session;
use crate::migration::{MigrationError, MigrationRequest, Orchestrator, round_duration};

/// Errors raised while reading a batch file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BatchError {
    /// The batch file could not be read.
    #[error("failed to read batch file {path}: {source}")]
    Io {
        /// Batch file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A line is not a valid item.
    #[error("invalid batch item on line {line}: {reason}")]
    InvalidLine {
        /// One-based line number.
        line: usize,
        /// What is wrong.
        reason: String,
    },
}

/// One source project to migrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Source project path.
    pub source_path: String,
    /// Target project, when it differs from the batch's.
    pub target_project: Option<String>,
    /// Explicit target repository name.
    pub target_repository: Option<String>,
}

impl BatchItem {
    /// An item migrated into the batch's project under its default
    /// repository name.
    #[must_use]
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            target_project: None,
            target_repository: None,
        }
    }

    /// Sends this item to another project.
    #[must_use]
    pub fn with_target_project(mut self, project: impl Into<String>) -> Self {
        self.target_project = Some(project.into());
        self
    }

    /// Names the target repository explicitly.
    #[must_use]
    pub fn with_target_repository(mut self, repository: impl Into<String>) -> Self {
        self.target_repository = Some(repository.into());
        self
    }

    fn request(&self, target_project: &str, sync: bool) -> MigrationRequest {
        let project = self.target_project.as_deref().unwrap_or(target_project);
        let request = MigrationRequest::new(self.source_path.as_str(), project).with_sync(sync);
        match &self.target_repository {
            Some(name) => request.with_target_repository(name.as_str()),
            None => request,
        }
    }
}

/// Parses a batch file. Each line is one item:
///
/// ```text
/// group/project                  # default project and repository name
/// group/project=repository       # explicit repository name
/// group/project=Project/repository
/// ```
///
/// Blank lines and lines starting with `#` are skipped.
///
/// # Errors
///
/// Returns [`BatchError::InvalidLine`] for an item with an empty source
/// path or an empty target after `=`.
pub fn parse_batch(text: &str) -> Result<Vec<BatchItem>, BatchError> {
    let mut items = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let invalid = |reason: &str| BatchError::InvalidLine {
            line: index + 1,
            reason: reason.to_string(),
        };
        let (source, project, repository) = match line.split_once('=') {
            Some((source, target)) => {
                let (project, repository) = match target.trim().rsplit_once('/') {
                    Some((project, repository)) => (Some(project.trim()), repository.trim()),
                    None => (None, target.trim()),
                };
                if repository.is_empty() || project.is_some_and(str::is_empty) {
                    return Err(invalid("empty target after '='"));
                }
                (
                    source.trim(),
                    project.map(str::to_string),
                    Some(repository.to_string()),
                )
            },
            None => (line, None, None),
        };
        let source = source.trim_matches('/');
        if source.is_empty() {
            return Err(invalid("empty source path"));
        }
        if source.chars().any(char::is_whitespace) {
            return Err(invalid("source path contains whitespace"));
        }
        items.push(BatchItem {
            source_path: source.to_string(),
            target_project: project,
            target_repository: repository,
        });
    }
    Ok(items)
}

/// Reads and parses a batch file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a line is invalid.
pub fn read_batch_file(path: &Path) -> Result<Vec<BatchItem>, BatchError> {
    let text = std::fs::read_to_string(path).map_err(|source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_batch(&text)
}

/// Result of one batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    /// Migrated.
    Succeeded,
    /// Stopped by a blocking precondition; nothing was mutated.
    Blocked,
    /// Failed while migrating.
    Failed,
}

impl ItemStatus {
    /// Whether the item counts as a success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Blocked => "BLOCKED",
            Self::Failed => "FAILED",
        })
    }
}

/// Outcome of one batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Zero-based position in the input.
    pub index: usize,
    /// Source project path.
    pub source: String,
    /// Target as `<project>/<repository>`.
    pub target: String,
    /// Result.
    pub status: ItemStatus,
    /// Error message or blocking issues; `None` on success.
    pub message: Option<String>,
    /// Chain length of the written record, on success.
    pub migration_count: Option<u32>,
    /// Seconds spent on the item.
    pub duration_secs: f64,
}

/// Aggregate report of one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRunReport {
    /// Identifier of the run; also names the persisted report.
    pub run_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the last item finished.
    pub finished_at: DateTime<Utc>,
    /// Target project of items without their own.
    pub target_project: String,
    /// Whether sync was requested for every item.
    pub sync: bool,
    /// Number of items.
    pub total: usize,
    /// Items that succeeded.
    pub succeeded: usize,
    /// Items that were blocked or failed.
    pub failed: usize,
    /// Per-item outcomes, in input order.
    pub items: Vec<ItemOutcome>,
}

impl BatchRunReport {
    /// Whether every item succeeded.
    #[must_use]
    pub const fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Runs migrations over a list of items.
#[derive(Debug, Clone, Copy)]
pub struct BatchCoordinator<'a> {
    session: &'a Session,
}

impl<'a> BatchCoordinator<'a> {
    /// Creates a coordinator over a session.
    #[must_use]
    pub const fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Migrates every item into `target_project`, or into the item's own
    /// project when it names one.
    ///
    /// Never fails: each item's error is captured in its outcome. The report
    /// is persisted in the state store; a persistence failure is logged.
    pub fn run_batch(
        &self,
        items: &[BatchItem],
        target_project: &str,
        sync: bool,
    ) -> BatchRunReport {
        let started_at = Utc::now();
        let run_id = run_id(started_at);
        let orchestrator = Orchestrator::new(self.session);
        tracing::info!(
            run_id = %run_id,
            items = items.len(),
            target_project,
            sync,
            "batch started"
        );

        let mut outcomes = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let request = item.request(target_project, sync);
            let item_started = Utc::now();
            let result = orchestrator.run(&request);
            let elapsed = (Utc::now() - item_started)
                .to_std()
                .map_or(0.0, |d| d.as_secs_f64());

            let (status, message, migration_count) = match result {
                Ok(record) => (ItemStatus::Succeeded, None, Some(record.migration_count)),
                Err(MigrationError::Blocked { report }) => (
                    ItemStatus::Blocked,
                    Some(report.blocking.join("; ")),
                    None,
                ),
                Err(e) => (
                    ItemStatus::Failed,
                    Some(self.session.client().redact(&e.to_string())),
                    None,
                ),
            };
            if !status.is_success() {
                tracing::warn!(
                    index,
                    source = %item.source_path,
                    status = %status,
                    error = message.as_deref().unwrap_or_default(),
                    "batch item did not complete"
                );
            }
            outcomes.push(ItemOutcome {
                index,
                source: request.source_path.clone(),
                target: request.target_display(),
                status,
                message,
                migration_count,
                duration_secs: round_duration(elapsed),
            });
        }

        let succeeded = outcomes.iter().filter(|o| o.status.is_success()).count();
        let report = BatchRunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            target_project: target_project.to_string(),
            sync,
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
            items: outcomes,
        };

        match self.session.store().save_batch(&report) {
            Ok(path) => tracing::debug!(path = %path.display(), "batch report saved"),
            Err(e) => tracing::warn!(error = %e, "failed to persist batch report"),
        }
        tracing::info!(
            run_id = %report.run_id,
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            "batch finished"
        );
        report
    }
}

/// `<UTC timestamp>-<4 hex digits>`; sortable and unique enough for
/// sequential runs.
fn run_id(started_at: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().r#gen();
    format!("{}-{suffix:04x}", started_at.format("%Y%m%dT%H%M%SZ"))
}
