//! ferry - repository migration CLI
//!
//! Validates, migrates and re-syncs repositories from the source platform
//! into target projects, one at a time or from a batch file.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// ferry - repository migration CLI
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "ferry.toml")]
    config: PathBuf,

    /// State directory, overriding `state.dir` from the configuration
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run pre-flight validation only and print the report
    Validate(commands::migrate::PairArgs),

    /// Migrate one repository, or re-sync it with --sync
    Migrate(commands::migrate::PairArgs),

    /// Migrate every repository listed in a batch file
    Batch(commands::batch::BatchArgs),

    /// Apply the configured groups, wiki and templates to a project
    Scaffold {
        /// Target project name
        project: String,
    },

    /// Print the stored migration record chain of a pair
    History(commands::migrate::PairArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let session = commands::open_session(&cli.config, cli.state_dir.as_deref())?;

    // Exit codes: 0=success, 1=error, 2=blocked or partially failed.
    // Errors propagate through anyhow and exit with 1.
    let exit_code = match cli.command {
        Commands::Validate(args) => commands::migrate::validate(&session, &args)?,
        Commands::Migrate(args) => commands::migrate::migrate(&session, &args)?,
        Commands::Batch(args) => commands::batch::run(&session, &args)?,
        Commands::Scaffold { project } => commands::scaffold::run(&session, &project)?,
        Commands::History(args) => commands::migrate::history(&session, &args)?,
    };
    std::process::exit(i32::from(exit_code));
}
