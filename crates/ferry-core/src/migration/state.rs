//! Migration lifecycle states.
//!
//! ```text
//! NOT_STARTED -> VALIDATING -> BLOCKED
//!                           -> READY -> MIGRATING -> COMPLETED
//!                                                 -> FAILED
//! ```
//!
//! `BLOCKED` and `FAILED` end an attempt. A `COMPLETED` attempt becomes the
//! predecessor of the next run against the same target.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::MigrationError;

/// State of one migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    /// Nothing has happened yet.
    NotStarted,
    /// Gathering source facts and target existence flags.
    Validating,
    /// A precondition failed; nothing was mutated.
    Blocked,
    /// All preconditions passed.
    Ready,
    /// Mutating the target.
    Migrating,
    /// Finished successfully.
    Completed,
    /// Failed while migrating; partial progress is kept.
    Failed,
}

impl MigrationState {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Validating => "VALIDATING",
            Self::Blocked => "BLOCKED",
            Self::Ready => "READY",
            Self::Migrating => "MIGRATING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether the attempt is over.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Blocked | Self::Completed | Self::Failed)
    }

    /// Whether `next` may follow this state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Validating)
                | (Self::Validating, Self::Blocked | Self::Ready)
                | (Self::Ready, Self::Migrating)
                | (Self::Migrating, Self::Completed | Self::Failed)
        )
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::InvalidTransition`] if `next` may not follow
    /// this state.
    pub fn transition(self, next: Self) -> Result<Self, MigrationError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(MigrationError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
