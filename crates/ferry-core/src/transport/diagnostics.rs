//! Diagnostic records for requests that finally failed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FailureKind, Method, NormalizedError, Side};
use crate::persist::atomic_write_json;

/// What is persisted for a request that exhausted its attempts or failed
/// with a non-retryable error. All text fields are already redacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// Which platform the request was sent to.
    pub side: Side,
    /// HTTP method.
    pub method: Method,
    /// Redacted endpoint.
    pub endpoint: String,
    /// HTTP status, or 0 for connection-level failures.
    pub status: u16,
    /// Failure classification.
    pub kind: FailureKind,
    /// Redacted message.
    pub message: String,
    /// Redacted response body.
    pub raw_body: Option<String>,
    /// Attempts spent.
    pub attempts: u32,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl DiagnosticRecord {
    /// Captures a normalized error.
    #[must_use]
    pub fn from_error(error: &NormalizedError, recorded_at: DateTime<Utc>) -> Self {
        Self {
            side: error.side,
            method: error.method,
            endpoint: error.endpoint.clone(),
            status: error.status,
            kind: error.kind,
            message: error.message.clone(),
            raw_body: error.raw_body.clone(),
            attempts: error.attempts,
            recorded_at,
        }
    }

    /// Deterministic file name: `<side>-<method>-<timestamp>.json`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.json",
            self.side,
            self.method.as_str().to_ascii_lowercase(),
            self.recorded_at.format("%Y%m%dT%H%M%S%.6fZ")
        )
    }
}

/// Writes [`DiagnosticRecord`]s into a directory.
#[derive(Debug, Clone)]
pub struct DiagnosticsWriter {
    dir: PathBuf,
}

impl DiagnosticsWriter {
    /// Creates a writer for `dir`; the directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists a record and returns its path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the record cannot be written.
    pub fn write(&self, record: &DiagnosticRecord) -> std::io::Result<PathBuf> {
        let path = self.dir.join(record.file_name());
        atomic_write_json(&path, record)?;
        Ok(path)
    }
}
