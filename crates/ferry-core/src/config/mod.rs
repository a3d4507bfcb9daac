//! Configuration parsing and management.
//!
//! A single TOML document describes both platforms, the transport policy,
//! where state is persisted, and what a migration reconciles beyond the
//! repository itself. Secrets are never stored in the document; it only
//! names the environment variables that hold them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconcile::GitPermission;

/// Hosts that identify the hosted (cloud) flavour of the target platform.
const HOSTED_TARGET_SUFFIXES: &[&str] = &["dev.azure.com", ".visualstudio.com"];

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML document is malformed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization back to TOML failed.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// A credential environment variable is unset or empty.
    #[error("credential environment variable {var} is not set")]
    MissingCredential {
        /// Name of the environment variable.
        var: String,
    },
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Platform repositories are migrated from.
    pub source: SourceConfig,

    /// Platform repositories are migrated into.
    pub target: TargetConfig,

    /// Retry, timeout and diagnostics policy.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Persisted state location.
    #[serde(default)]
    pub state: StateConfig,

    /// What a migration reconciles after the repository.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Project scaffolding.
    #[serde(default)]
    pub scaffold: ScaffoldConfig,
}

impl FerryConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid
    /// - A base URL is not an absolute http(s) URL
    /// - `transport.max_attempts` is zero
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        parse_base_url("source.base_url", &self.source.base_url)?;
        parse_base_url("target.base_url", &self.target.base_url)?;
        if self.transport.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "transport.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.target.user.trim().is_empty() {
            return Err(ConfigError::Validation(
                "target.user must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_base_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::Validation(format!("{field} is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Validation(format!(
            "{field} must use http or https, got {}",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Source platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    /// Base URL, e.g. `https://gitlab.example.com`.
    pub base_url: String,

    /// Environment variable holding the API token.
    #[serde(default = "default_source_token_env")]
    pub token_env: String,
}

fn default_source_token_env() -> String {
    "FERRY_SOURCE_TOKEN".to_string()
}

/// Target platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetConfig {
    /// Organization or collection URL, e.g. `https://dev.azure.com/contoso`.
    pub base_url: String,

    /// User name sent with the basic-auth credential.
    #[serde(default = "default_target_user")]
    pub user: String,

    /// Environment variable holding the personal access token.
    #[serde(default = "default_target_pat_env")]
    pub pat_env: String,

    /// Explicit API version. When unset it is probed once per session.
    #[serde(default)]
    pub api_version: Option<String>,

    /// Whether the target is internally hosted. When unset it is derived
    /// from the host name.
    #[serde(default)]
    pub internal_host: Option<bool>,

    /// Permit the certificate-bypassing secondary transport for TLS
    /// failures against an internally hosted target.
    #[serde(default)]
    pub allow_insecure_fallback: bool,
}

fn default_target_user() -> String {
    "ferry".to_string()
}

fn default_target_pat_env() -> String {
    "FERRY_TARGET_PAT".to_string()
}

impl TargetConfig {
    /// Whether the target should be treated as internally hosted.
    #[must_use]
    pub fn is_internal_host(&self) -> bool {
        if let Some(explicit) = self.internal_host {
            return explicit;
        }
        let Ok(url) = Url::parse(&self.base_url) else {
            return false;
        };
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        !HOSTED_TARGET_SUFFIXES
            .iter()
            .any(|suffix| host == suffix.trim_start_matches('.') || host.ends_with(suffix))
    }
}

/// Transport policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    /// Total attempts per request, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubled for each further retry.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Per-attempt timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Where to write a diagnostic record when a request finally fails.
    /// Diagnostics are disabled when unset.
    #[serde(default)]
    pub diagnostics_dir: Option<PathBuf>,
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            timeout: default_timeout(),
            diagnostics_dir: None,
        }
    }
}

/// Persisted state location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Directory holding precondition reports, records and batch reports.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".ferry/state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

/// Post-repository reconciliation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Group whose permissions on the migrated repository are restricted,
    /// if it exists in the target project.
    #[serde(default)]
    pub restricted_group: Option<String>,

    /// Permissions denied to `restricted_group`.
    #[serde(default = "default_deny_permissions")]
    pub deny_permissions: Vec<GitPermission>,

    /// Branch policies applied to the default branch.
    #[serde(default)]
    pub branch_policies: BranchPolicyConfig,
}

fn default_deny_permissions() -> Vec<GitPermission> {
    vec![
        GitPermission::GenericContribute,
        GitPermission::ForcePush,
        GitPermission::CreateBranch,
        GitPermission::CreateTag,
    ]
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            restricted_group: None,
            deny_permissions: default_deny_permissions(),
            branch_policies: BranchPolicyConfig::default(),
        }
    }
}

/// Branch policies applied to the migrated default branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchPolicyConfig {
    /// Minimum number of approving reviewers; 0 disables the policy.
    #[serde(default = "default_min_reviewers")]
    pub min_reviewers: u32,

    /// Whether the pull request author's vote counts.
    #[serde(default)]
    pub creator_vote_counts: bool,

    /// Reset votes when new commits are pushed.
    #[serde(default)]
    pub reset_on_source_push: bool,

    /// Require all comments to be resolved.
    #[serde(default = "default_true")]
    pub require_comment_resolution: bool,

    /// Require a linked work item.
    #[serde(default)]
    pub require_work_item_link: bool,

    /// Whether the policies block completion (as opposed to advising).
    #[serde(default = "default_true")]
    pub blocking: bool,
}

const fn default_min_reviewers() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

impl Default for BranchPolicyConfig {
    fn default() -> Self {
        Self {
            min_reviewers: default_min_reviewers(),
            creator_vote_counts: false,
            reset_on_source_push: false,
            require_comment_resolution: true,
            require_work_item_link: false,
            blocking: true,
        }
    }
}

/// Project scaffolding: resources created alongside migrated repositories.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScaffoldConfig {
    /// Project-scoped security groups.
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Name of the project wiki to ensure, if any.
    #[serde(default)]
    pub wiki: Option<String>,

    /// Team whose work-item templates are reconciled. Defaults to the
    /// project's default team (`<project> Team`).
    #[serde(default)]
    pub team: Option<String>,

    /// Work-item templates.
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

/// A project-scoped group and its members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupConfig {
    /// Display name.
    pub name: String,

    /// Description used on creation.
    #[serde(default)]
    pub description: String,

    /// Subject descriptors added as members.
    #[serde(default)]
    pub members: Vec<String>,
}

/// A work-item template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateConfig {
    /// Template name.
    pub name: String,

    /// Work-item type the template applies to, e.g. `Bug`.
    pub work_item_type: String,

    /// Description used on creation.
    #[serde(default)]
    pub description: String,

    /// Field reference name to default value.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// Credentials for both platforms.
///
/// Secrets are wrapped in [`SecretString`] so they never appear in `Debug`
/// output.
#[derive(Debug)]
pub struct Credentials {
    /// Source platform API token.
    pub source_token: SecretString,
    /// Target platform basic-auth user.
    pub target_user: String,
    /// Target platform personal access token.
    pub target_pat: SecretString,
}

impl Credentials {
    /// Creates credentials from explicit values.
    #[must_use]
    pub fn new(
        source_token: impl Into<String>,
        target_user: impl Into<String>,
        target_pat: impl Into<String>,
    ) -> Self {
        Self {
            source_token: SecretString::from(source_token.into()),
            target_user: target_user.into(),
            target_pat: SecretString::from(target_pat.into()),
        }
    }

    /// Reads credentials from the environment variables named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredential`] if a variable is unset or
    /// empty.
    pub fn from_env(config: &FerryConfig) -> Result<Self, ConfigError> {
        let source_token = read_secret_env(&config.source.token_env)?;
        let target_pat = read_secret_env(&config.target.pat_env)?;
        Ok(Self::new(source_token, config.target.user.clone(), target_pat))
    }
}

fn read_secret_env(var: &str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingCredential {
            var: var.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [source]
        base_url = "https://gitlab.example.com"

        [target]
        base_url = "https://dev.azure.com/contoso"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = FerryConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.source.token_env, "FERRY_SOURCE_TOKEN");
        assert_eq!(config.target.pat_env, "FERRY_TARGET_PAT");
        assert_eq!(config.transport.max_attempts, 4);
        assert_eq!(config.transport.base_delay, Duration::from_secs(1));
        assert!(config.transport.diagnostics_dir.is_none());
        assert_eq!(config.state.dir, PathBuf::from(".ferry/state"));
        assert_eq!(config.migration.branch_policies.min_reviewers, 1);
        assert_eq!(config.migration.deny_permissions.len(), 4);
        assert!(!config.target.allow_insecure_fallback);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            [source]
            base_url = "https://gitlab.internal"
            token_env = "GL_TOKEN"

            [target]
            base_url = "https://tfs.internal/tfs/DefaultCollection"
            user = "svc-migrate"
            api_version = "6.0"
            allow_insecure_fallback = true

            [transport]
            max_attempts = 6
            base_delay = "250ms"
            timeout = "30s"
            diagnostics_dir = "/tmp/ferry-diag"

            [migration]
            restricted_group = "Contractors"
            deny_permissions = ["force_push", "policy_exempt"]

            [migration.branch_policies]
            min_reviewers = 2
            require_work_item_link = true

            [scaffold]
            wiki = "Handbook"

            [[scaffold.groups]]
            name = "Release Managers"
            members = ["aad.abc"]

            [[scaffold.templates]]
            name = "Bug triage"
            work_item_type = "Bug"
            fields = { "System.Tags" = "triage" }
        "#;
        let config = FerryConfig::from_toml(toml).unwrap();
        assert_eq!(config.transport.max_attempts, 6);
        assert_eq!(config.transport.base_delay, Duration::from_millis(250));
        assert_eq!(config.target.api_version.as_deref(), Some("6.0"));
        assert_eq!(
            config.migration.deny_permissions,
            vec![GitPermission::ForcePush, GitPermission::PolicyExempt]
        );
        assert_eq!(config.migration.branch_policies.min_reviewers, 2);
        assert!(config.migration.branch_policies.require_comment_resolution);
        assert_eq!(config.scaffold.groups[0].members, vec!["aad.abc"]);
        assert_eq!(
            config.scaffold.templates[0].fields.get("System.Tags"),
            Some(&"triage".to_string())
        );
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let toml = format!("{MINIMAL}\n[transport]\nmax_attempts = 0\n");
        let err = FerryConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_non_http_url() {
        let toml = r#"
            [source]
            base_url = "ftp://gitlab.example.com"

            [target]
            base_url = "https://dev.azure.com/contoso"
        "#;
        let err = FerryConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("source.base_url"));
    }

    #[test]
    fn test_internal_host_detection() {
        let mut target = FerryConfig::from_toml(MINIMAL).unwrap().target;
        assert!(!target.is_internal_host());

        target.base_url = "https://contoso.visualstudio.com".to_string();
        assert!(!target.is_internal_host());

        target.base_url = "https://tfs.corp.local/tfs/DefaultCollection".to_string();
        assert!(target.is_internal_host());

        target.internal_host = Some(false);
        assert!(!target.is_internal_host());
    }

    #[test]
    fn test_round_trip_toml() {
        let config = FerryConfig::from_toml(MINIMAL).unwrap();
        let rendered = config.to_toml().unwrap();
        let reparsed = FerryConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.target, config.target);
        assert_eq!(reparsed.transport, config.transport);
    }

    #[test]
    fn test_missing_credential() {
        let mut config = FerryConfig::from_toml(MINIMAL).unwrap();
        config.source.token_env = "FERRY_TEST_SURELY_UNSET_VARIABLE_1F2E".to_string();
        let err = Credentials::from_env(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingCredential { ref var } if var == "FERRY_TEST_SURELY_UNSET_VARIABLE_1F2E"
        ));
    }
}
