//! Log hygiene.
//!
//! Every line the crate logs about a request goes through [`SecretRedactor`]
//! first.

mod redact;

pub use redact::{REDACTED, SecretRedactor};
