//! Pre-flight validation: source facts and the precondition report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MigrationRequest;

/// Facts about the source project that drive the migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFacts {
    /// Numeric project id.
    pub id: u64,
    /// Full path, e.g. `group/sub/project`.
    pub path: String,
    /// Default branch; `None` for an empty repository.
    pub default_branch: Option<String>,
    /// `private`, `internal` or `public`.
    pub visibility: String,
    /// Repository size in bytes, when statistics are available.
    pub size_bytes: Option<u64>,
    /// Whether large-file storage is enabled.
    pub lfs_enabled: bool,
    /// HTTP clone URL.
    pub clone_url: String,
}

/// The source platform's project representation, as far as it is used.
#[derive(Debug, Deserialize)]
pub(crate) struct SourceProjectPayload {
    id: u64,
    path_with_namespace: String,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    visibility: Option<String>,
    #[serde(default)]
    lfs_enabled: bool,
    http_url_to_repo: String,
    #[serde(default)]
    statistics: Option<SourceStatistics>,
}

#[derive(Debug, Deserialize)]
struct SourceStatistics {
    #[serde(default)]
    repository_size: Option<u64>,
}

impl From<SourceProjectPayload> for SourceFacts {
    fn from(payload: SourceProjectPayload) -> Self {
        Self {
            id: payload.id,
            path: payload.path_with_namespace,
            default_branch: payload.default_branch.filter(|b| !b.is_empty()),
            visibility: payload.visibility.unwrap_or_else(|| "private".to_string()),
            size_bytes: payload.statistics.and_then(|s| s.repository_size),
            lfs_enabled: payload.lfs_enabled,
            clone_url: payload.http_url_to_repo,
        }
    }
}

/// What was observed on the target before any mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFlags {
    /// The target project exists.
    pub project_exists: bool,
    /// The target repository exists.
    pub repository_exists: bool,
}

/// Result of pre-flight validation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionReport {
    /// Source project path.
    pub source: String,
    /// Target project name.
    pub target_project: String,
    /// Target repository name.
    pub target_repository: String,
    /// Source facts; `None` if the source project was not found.
    pub source_facts: Option<SourceFacts>,
    /// Target existence flags.
    pub target: TargetFlags,
    /// Sync was requested.
    pub sync_requested: bool,
    /// The run will update an existing repository.
    pub sync_mode: bool,
    /// No blocking issue was found.
    pub ready: bool,
    /// Blocking issues, in evaluation order.
    pub blocking: Vec<String>,
    /// When validation finished.
    pub validated_at: DateTime<Utc>,
}

impl PreconditionReport {
    /// Applies the blocking rules.
    ///
    /// - The source project must exist and have a default branch.
    /// - The target project must exist; it is never created implicitly.
    /// - An existing target repository blocks unless sync was requested.
    #[must_use]
    pub fn evaluate(
        request: &MigrationRequest,
        source_facts: Option<SourceFacts>,
        target: TargetFlags,
        validated_at: DateTime<Utc>,
    ) -> Self {
        let mut blocking = Vec::new();
        match &source_facts {
            None => blocking.push(format!(
                "source project '{}' was not found",
                request.source_path
            )),
            Some(facts) if facts.default_branch.is_none() => blocking.push(format!(
                "source repository '{}' is empty (no default branch)",
                request.source_path
            )),
            Some(_) => {},
        }
        if !target.project_exists {
            blocking.push(format!(
                "target project '{}' does not exist; create it before migrating",
                request.target_project
            ));
        }
        if target.repository_exists && !request.sync {
            blocking.push(format!(
                "repository already exists in target project '{}': '{}'; request sync to update it",
                request.target_project,
                request.target_repository()
            ));
        }

        Self {
            source: request.source_path.clone(),
            target_project: request.target_project.clone(),
            target_repository: request.target_repository().to_string(),
            source_facts,
            target,
            sync_requested: request.sync,
            sync_mode: request.sync && target.repository_exists,
            ready: blocking.is_empty(),
            blocking,
            validated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(default_branch: Option<&str>) -> SourceFacts {
        SourceFacts {
            id: 42,
            path: "platform/billing".to_string(),
            default_branch: default_branch.map(str::to_string),
            visibility: "private".to_string(),
            size_bytes: Some(1024),
            lfs_enabled: false,
            clone_url: "https://gitlab.example.com/platform/billing.git".to_string(),
        }
    }

    fn flags(project_exists: bool, repository_exists: bool) -> TargetFlags {
        TargetFlags {
            project_exists,
            repository_exists,
        }
    }

    fn evaluate(
        request: &MigrationRequest,
        facts: Option<SourceFacts>,
        target: TargetFlags,
    ) -> PreconditionReport {
        PreconditionReport::evaluate(request, facts, target, Utc::now())
    }

    #[test]
    fn ready_when_project_exists_and_repository_absent() {
        let request = MigrationRequest::new("platform/billing", "Payments");
        let report = evaluate(&request, Some(facts(Some("main"))), flags(true, false));
        assert!(report.ready);
        assert!(report.blocking.is_empty());
        assert!(!report.sync_mode);
        assert_eq!(report.target_repository, "billing");
    }

    #[test]
    fn existing_repository_blocks_without_sync() {
        let request = MigrationRequest::new("platform/billing", "Payments");
        let report = evaluate(&request, Some(facts(Some("main"))), flags(true, true));
        assert!(!report.ready);
        assert_eq!(report.blocking.len(), 1);
        assert!(report.blocking[0].starts_with("repository already exists"));
    }

    #[test]
    fn existing_repository_with_sync_is_ready() {
        let request = MigrationRequest::new("platform/billing", "Payments").with_sync(true);
        let report = evaluate(&request, Some(facts(Some("main"))), flags(true, true));
        assert!(report.ready);
        assert!(report.sync_mode);
    }

    #[test]
    fn all_issues_are_listed() {
        let request = MigrationRequest::new("platform/billing", "Missing");
        let report = evaluate(&request, None, flags(false, false));
        assert!(!report.ready);
        assert_eq!(report.blocking.len(), 2);
        assert!(report.blocking[0].contains("source project"));
        assert!(report.blocking[1].contains("target project 'Missing' does not exist"));
    }

    #[test]
    fn empty_source_blocks() {
        let request = MigrationRequest::new("platform/billing", "Payments");
        let report = evaluate(&request, Some(facts(None)), flags(true, false));
        assert_eq!(
            report.blocking,
            vec!["source repository 'platform/billing' is empty (no default branch)"]
        );
    }

    #[test]
    fn source_payload_maps_to_facts() {
        let payload: SourceProjectPayload = serde_json::from_value(serde_json::json!({
            "id": 7,
            "path_with_namespace": "a/b",
            "default_branch": "develop",
            "visibility": "internal",
            "lfs_enabled": true,
            "http_url_to_repo": "https://gitlab.example.com/a/b.git",
            "statistics": {"repository_size": 2048, "lfs_objects_size": 10}
        }))
        .unwrap();
        let facts = SourceFacts::from(payload);
        assert_eq!(facts.default_branch.as_deref(), Some("develop"));
        assert_eq!(facts.size_bytes, Some(2048));
        assert!(facts.lfs_enabled);
    }
}
