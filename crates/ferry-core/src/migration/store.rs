//! Flat JSON persistence of per-pair state and batch reports.
//!
//! ```text
//! <root>/
//!   <pair-key>/precondition.json
//!   <pair-key>/record.json
//!   <pair-key>/failure.json
//!   batches/<run-id>.json
//! ```
//!
//! The pair key is derived from the source path, target project and target
//! repository. Every file is replaced atomically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{MigrationRecord, MigrationRequest, MigrationState, PreconditionReport};
use crate::batch::BatchRunReport;
use crate::persist::atomic_write_json;

const PRECONDITION_FILE: &str = "precondition.json";
const RECORD_FILE: &str = "record.json";
const FAILURE_FILE: &str = "failure.json";
const BATCHES_DIR: &str = "batches";

/// Errors raised by the state store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Reading or writing a file failed.
    #[error("state store I/O error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A file is not valid JSON for its type.
    #[error("malformed state file {path}: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A migration record violates the history invariant.
    #[error("corrupt migration record {path}: {reason}")]
    CorruptRecord {
        /// File involved.
        path: PathBuf,
        /// What is wrong.
        reason: String,
    },
}

/// The last step a failed attempt completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    /// Nothing completed.
    None,
    /// The repository was reconciled.
    Repository,
    /// Content was mirrored.
    Mirror,
    /// Branch policies were reconciled.
    BranchPolicies,
    /// The deny-list restriction was applied.
    Security,
}

impl std::fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Repository => "repository",
            Self::Mirror => "mirror",
            Self::BranchPolicies => "branch_policies",
            Self::Security => "security",
        })
    }
}

/// What is persisted when an attempt fails while migrating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Always [`MigrationState::Failed`].
    pub state: MigrationState,
    /// Error message.
    pub error: String,
    /// Seconds between the start of the attempt and the failure.
    pub elapsed_secs: f64,
    /// Last step that completed before the failure.
    pub last_completed_step: MigrationStep,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// File-backed store rooted at a directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Creates a store; directories are created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the state of one source/target pair.
    #[must_use]
    pub fn pair_dir(&self, request: &MigrationRequest) -> PathBuf {
        self.root.join(pair_key(request))
    }

    /// Persists a precondition report.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_precondition(
        &self,
        request: &MigrationRequest,
        report: &PreconditionReport,
    ) -> Result<PathBuf, StoreError> {
        self.write(&self.pair_dir(request).join(PRECONDITION_FILE), report)
    }

    /// Loads the last precondition report.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_precondition(
        &self,
        request: &MigrationRequest,
    ) -> Result<Option<PreconditionReport>, StoreError> {
        self.read(&self.pair_dir(request).join(PRECONDITION_FILE))
    }

    /// Persists a migration record after checking its invariant.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is inconsistent or cannot be written.
    pub fn save_record(
        &self,
        request: &MigrationRequest,
        record: &MigrationRecord,
    ) -> Result<PathBuf, StoreError> {
        let path = self.pair_dir(request).join(RECORD_FILE);
        record
            .validate()
            .map_err(|reason| StoreError::CorruptRecord {
                path: path.clone(),
                reason,
            })?;
        self.write(&path, record)
    }

    /// Loads the last migration record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptRecord`] if the stored record violates
    /// the history invariant.
    pub fn load_record(
        &self,
        request: &MigrationRequest,
    ) -> Result<Option<MigrationRecord>, StoreError> {
        let path = self.pair_dir(request).join(RECORD_FILE);
        let record: Option<MigrationRecord> = self.read(&path)?;
        if let Some(record) = &record {
            record
                .validate()
                .map_err(|reason| StoreError::CorruptRecord { path, reason })?;
        }
        Ok(record)
    }

    /// Persists a failure record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_failure(
        &self,
        request: &MigrationRequest,
        failure: &FailureRecord,
    ) -> Result<PathBuf, StoreError> {
        self.write(&self.pair_dir(request).join(FAILURE_FILE), failure)
    }

    /// Loads the last failure record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_failure(
        &self,
        request: &MigrationRequest,
    ) -> Result<Option<FailureRecord>, StoreError> {
        self.read(&self.pair_dir(request).join(FAILURE_FILE))
    }

    /// Removes a stale failure record after a successful attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear_failure(&self, request: &MigrationRequest) -> Result<(), StoreError> {
        let path = self.pair_dir(request).join(FAILURE_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// Persists a batch run report.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_batch(&self, report: &BatchRunReport) -> Result<PathBuf, StoreError> {
        let path = self
            .root
            .join(BATCHES_DIR)
            .join(format!("{}.json", sanitize(&report.run_id)));
        self.write(&path, report)
    }

    /// Loads a batch run report.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_batch(&self, run_id: &str) -> Result<Option<BatchRunReport>, StoreError> {
        self.read(
            &self
                .root
                .join(BATCHES_DIR)
                .join(format!("{}.json", sanitize(run_id))),
        )
    }

    fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<PathBuf, StoreError> {
        atomic_write_json(path, value).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(path.to_path_buf())
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            },
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StoreError::Json {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// `<source>--<project>--<repository>`, each part escaped.
///
/// Every byte outside `A-Z a-z 0-9 . _` becomes `%XX`, so `-` never
/// appears inside a part and distinct pairs always get distinct keys.
#[must_use]
pub fn pair_key(request: &MigrationRequest) -> String {
    format!(
        "{}--{}--{}",
        escape(&request.source_path),
        escape(&request.target_project),
        escape(request.target_repository())
    )
}

fn escape(value: &str) -> String {
    use std::fmt::Write;

    let mut escaped = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_') {
            escaped.push(char::from(byte));
        } else {
            let _ = write!(escaped, "%{byte:02X}");
        }
    }
    escaped
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
