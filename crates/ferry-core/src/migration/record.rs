//! Migration records and their history chain.
//!
//! A record is written for every completed attempt. A sync run carries its
//! predecessor forward: `history` is the predecessor's history with the
//! predecessor itself appended, so `migration_count == 1 + history.len()`
//! always holds and history entries are never reordered or dropped.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reconcile::{DenyOutcome, Origin};

/// Whether a record starts a chain or continues one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationKind {
    /// First migration into a new repository.
    Initial,
    /// Update of an existing repository.
    Sync,
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "INITIAL",
            Self::Sync => "SYNC",
        })
    }
}

/// What a completed attempt reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    /// Target repository id.
    pub repository_id: String,
    /// Whether the repository was created or reused.
    pub repository_origin: Origin,
    /// Default branch the policies were applied to.
    pub default_branch: String,
    /// Branch policy ids, in reconciliation order.
    pub branch_policies: Vec<String>,
    /// Deny-list restriction, when a restricted group exists.
    pub restriction: Option<DenyOutcome>,
}

/// Durable outcome of one completed migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Source project path.
    pub source: String,
    /// Source project id.
    pub source_id: u64,
    /// Target as `<project>/<repository>`.
    pub target: String,
    /// Initial migration or sync.
    pub kind: MigrationKind,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration in seconds, rounded to milliseconds.
    pub duration_secs: f64,
    /// What was reconciled.
    pub outcome: MigrationOutcome,
    /// Number of completed attempts in this chain, including this one.
    pub migration_count: u32,
    /// Earlier attempts, oldest first. Entries carry no history of their
    /// own.
    pub history: Vec<MigrationRecord>,
}

/// Everything about a completed attempt except its place in the chain.
#[derive(Debug, Clone)]
pub struct CompletedAttempt {
    /// Source project path.
    pub source: String,
    /// Source project id.
    pub source_id: u64,
    /// Target as `<project>/<repository>`.
    pub target: String,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub finished_at: DateTime<Utc>,
    /// What was reconciled.
    pub outcome: MigrationOutcome,
}

impl MigrationRecord {
    /// Builds the record of a completed attempt.
    ///
    /// `sync` is the effective mode: sync was requested and the target
    /// repository already exists. With it, the chain continues from
    /// `predecessor` (a fresh chain if there is none). Without it, a new
    /// chain starts and any predecessor is ignored.
    #[must_use]
    pub fn completed(attempt: CompletedAttempt, sync: bool, predecessor: Option<Self>) -> Self {
        let (kind, history) = if sync {
            let history = predecessor.map(Self::into_history).unwrap_or_default();
            (MigrationKind::Sync, history)
        } else {
            (MigrationKind::Initial, Vec::new())
        };
        let elapsed = (attempt.finished_at - attempt.started_at)
            .to_std()
            .map_or(0.0, |d| d.as_secs_f64());

        Self {
            source: attempt.source,
            source_id: attempt.source_id,
            target: attempt.target,
            kind,
            started_at: attempt.started_at,
            finished_at: attempt.finished_at,
            duration_secs: round_duration(elapsed),
            outcome: attempt.outcome,
            migration_count: chain_count(history.len()),
            history,
        }
    }

    /// Flattens this record into the history a successor inherits.
    fn into_history(mut self) -> Vec<Self> {
        let mut history = std::mem::take(&mut self.history);
        history.push(self);
        history
    }

    /// Checks the chain invariant.
    ///
    /// # Errors
    ///
    /// Returns a description of the violation.
    pub fn validate(&self) -> Result<(), String> {
        let expected = chain_count(self.history.len());
        if self.migration_count != expected {
            return Err(format!(
                "migration_count is {} but history holds {} entries",
                self.migration_count,
                self.history.len()
            ));
        }
        if self.duration_secs < 0.0 || !self.duration_secs.is_finite() {
            return Err(format!("invalid duration {}", self.duration_secs));
        }
        Ok(())
    }
}

fn chain_count(history_len: usize) -> u32 {
    u32::try_from(history_len).map_or(u32::MAX, |n| n.saturating_add(1))
}

/// Clamps to non-negative and rounds to three decimals.
#[must_use]
pub fn round_duration(secs: f64) -> f64 {
    if !secs.is_finite() || secs <= 0.0 {
        return 0.0;
    }
    (secs * 1000.0).round() / 1000.0
}
