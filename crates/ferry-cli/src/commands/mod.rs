//! Subcommand implementations.
//!
//! Each command returns an exit code; hard errors propagate as
//! [`anyhow::Error`]. Machine-readable results go to stdout as JSON, logs go
//! to stderr.

use std::path::Path;

use anyhow::{Context, Result};
use ferry_core::Session;
use ferry_core::config::{Credentials, FerryConfig};
use ferry_core::migration::StateStore;
use serde::Serialize;

pub mod batch;
pub mod migrate;
pub mod scaffold;

/// Exit codes shared by every subcommand.
pub mod exit_codes {
    /// Everything requested completed.
    pub const SUCCESS: u8 = 0;
    /// Validation blocked the attempt, or some batch items failed.
    pub const BLOCKED: u8 = 2;
}

/// Loads configuration and credentials and builds the session.
pub fn open_session(config_path: &Path, state_dir: Option<&Path>) -> Result<Session> {
    let config = FerryConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let credentials =
        Credentials::from_env(&config).context("failed to read credentials from environment")?;
    let session = Session::new(config, credentials).context("failed to initialize transport")?;
    let session = match state_dir {
        Some(dir) => session.with_store(StateStore::new(dir)),
        None => session,
    };
    tracing::debug!(
        config = %config_path.display(),
        state_dir = %session.store().root().display(),
        "session ready"
    );
    Ok(session)
}

/// Prints `value` to stdout as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}
