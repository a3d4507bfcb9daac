//! `ferry scaffold`: reconcile the configured project furniture.

use anyhow::{Context, Result};
use ferry_core::Session;
use ferry_core::migration::Scaffolder;

use super::{exit_codes, print_json};

/// Applies `[scaffold]` from the configuration to `project`.
pub fn run(session: &Session, project: &str) -> Result<u8> {
    let report = Scaffolder::new(session.reconciler())
        .apply(project, &session.config().scaffold)
        .with_context(|| format!("failed to scaffold project '{project}'"))?;
    print_json(&report)?;
    Ok(exit_codes::SUCCESS)
}
