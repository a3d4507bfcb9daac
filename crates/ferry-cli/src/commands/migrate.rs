//! Single-pair commands: `validate`, `migrate` and `history`.

use anyhow::{Context, Result, bail};
use clap::Args;
use ferry_core::Session;
use ferry_core::migration::{MigrationError, MigrationRequest, Orchestrator};

use super::{exit_codes, print_json};

/// Identifies one source/target pair.
#[derive(Args, Debug)]
pub struct PairArgs {
    /// Source project path, e.g. `platform/billing`
    pub source: String,

    /// Target project name
    pub project: String,

    /// Target repository name (defaults to the last source path segment)
    #[arg(short, long)]
    pub repository: Option<String>,

    /// Update an existing target repository instead of refusing
    #[arg(long)]
    pub sync: bool,
}

impl PairArgs {
    fn request(&self) -> MigrationRequest {
        let request = MigrationRequest::new(self.source.as_str(), self.project.as_str())
            .with_sync(self.sync);
        match &self.repository {
            Some(name) => request.with_target_repository(name.as_str()),
            None => request,
        }
    }
}

/// Prints the precondition report; blocked when it is not ready.
pub fn validate(session: &Session, args: &PairArgs) -> Result<u8> {
    let report = Orchestrator::new(session)
        .validate(&args.request())
        .context("validation failed")?;
    print_json(&report)?;
    Ok(if report.ready {
        exit_codes::SUCCESS
    } else {
        exit_codes::BLOCKED
    })
}

/// Runs one attempt and prints the written record.
pub fn migrate(session: &Session, args: &PairArgs) -> Result<u8> {
    let request = args.request();
    match Orchestrator::new(session).run(&request) {
        Ok(record) => {
            print_json(&record)?;
            Ok(exit_codes::SUCCESS)
        },
        Err(MigrationError::Blocked { report }) => {
            for issue in &report.blocking {
                eprintln!("blocked: {issue}");
            }
            print_json(&report)?;
            Ok(exit_codes::BLOCKED)
        },
        Err(e) => Err(e).with_context(|| {
            format!(
                "migration of {} to {} failed",
                request.source_path,
                request.target_display()
            )
        }),
    }
}

/// Prints the stored record, whose `history` holds earlier runs.
pub fn history(session: &Session, args: &PairArgs) -> Result<u8> {
    let request = args.request();
    let Some(record) = session
        .store()
        .load_record(&request)
        .context("failed to read migration record")?
    else {
        bail!(
            "no migration recorded for {} to {}",
            request.source_path,
            request.target_display()
        );
    };
    print_json(&record)?;
    Ok(exit_codes::SUCCESS)
}
