//! `ferry batch`: migrate every item of a batch file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use ferry_core::Session;
use ferry_core::batch::{BatchCoordinator, read_batch_file};

use super::{exit_codes, print_json};

/// Arguments for `ferry batch`.
#[derive(Args, Debug)]
pub struct BatchArgs {
    /// Batch file: one `source/path[=repository]` or
    /// `source/path=Project/repository` per line
    pub file: PathBuf,

    /// Target project for items that do not name one
    pub project: String,

    /// Update existing target repositories instead of refusing
    #[arg(long)]
    pub sync: bool,
}

/// Runs the batch and prints its report. Partial failure is not an error.
pub fn run(session: &Session, args: &BatchArgs) -> Result<u8> {
    let items = read_batch_file(&args.file)
        .with_context(|| format!("failed to load batch file {}", args.file.display()))?;
    let report = BatchCoordinator::new(session).run_batch(&items, &args.project, args.sync);
    for outcome in report.items.iter().filter(|o| !o.status.is_success()) {
        eprintln!(
            "{} {} -> {}: {}",
            outcome.status,
            outcome.source,
            outcome.target,
            outcome.message.as_deref().unwrap_or_default()
        );
    }
    print_json(&report)?;
    Ok(if report.all_succeeded() {
        exit_codes::SUCCESS
    } else {
        exit_codes::BLOCKED
    })
}
