//! # ferry-core
//!
//! Re-runnable repository migrations between two code-hosting platforms.
//!
//! The crate is layered leaf-first:
//!
//! - [`transport`]: one logical request against either platform, with
//!   retry, backoff, redaction, a TLS fallback transport and a single
//!   [`transport::NormalizedError`] shape.
//! - [`reconcile`]: "ensure" semantics per target resource kind.
//! - [`migration`]: the validate, migrate and record lifecycle of one
//!   repository, plus project scaffolding.
//! - [`batch`]: sequential migrations over a list with per-item failure
//!   isolation.
//!
//! Everything runs synchronously on the calling thread. A [`Session`]
//! carries configuration, credentials and collaborators; there is no
//! ambient global state.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ferry_core::config::{Credentials, FerryConfig};
//! use ferry_core::migration::{MigrationRequest, Orchestrator};
//! use ferry_core::Session;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FerryConfig::from_file("ferry.toml".as_ref())?;
//! let credentials = Credentials::from_env(&config)?;
//! let session = Session::new(config, credentials)?;
//!
//! let request = MigrationRequest::new("platform/billing", "Payments");
//! let record = Orchestrator::new(&session).run(&request)?;
//! println!("migration #{} done", record.migration_count);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod config;
pub mod log;
pub mod migration;
mod persist;
pub mod reconcile;
mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use session::Session;
