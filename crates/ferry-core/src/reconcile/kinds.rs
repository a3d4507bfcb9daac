//! Resource kinds and their platform endpoints.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Value, json};

use super::{
    ProjectRef, ReconcileError, Reconciler, ResourceKind, ResourceSpec, payload_id, same_name,
};
use crate::config::{BranchPolicyConfig, GroupConfig, TemplateConfig};
use crate::transport::{Method, Side, encode_component};

/// A Git repository. Conflict-sensitive: an existing repository is only
/// returned when reuse is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositorySpec {
    /// Repository name.
    pub name: String,
}

impl RepositorySpec {
    /// Creates a spec.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ResourceSpec for RepositorySpec {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Repository
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn desired(&self, project: &ProjectRef) -> Value {
        json!({
            "name": self.name,
            "project": { "id": project.id },
        })
    }

    fn find(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
    ) -> Result<Option<Value>, ReconcileError> {
        reconciler.find_repository(project, &self.name)
    }

    fn create(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
        desired: &Value,
    ) -> Result<Value, ReconcileError> {
        reconciler.write(
            Method::Post,
            &format!("{}/_apis/git/repositories", project.id),
            desired,
        )
    }
}

/// Supported branch policy types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyType {
    /// Minimum number of reviewers.
    MinimumReviewers,
    /// All comments must be resolved.
    CommentRequirements,
    /// A work item must be linked.
    WorkItemLinking,
}

impl PolicyType {
    /// The platform's policy type GUID.
    #[must_use]
    pub const fn type_id(self) -> &'static str {
        match self {
            Self::MinimumReviewers => "fa4e907d-c16b-4a4c-9dfa-4906e5d171dd",
            Self::CommentRequirements => "c6a1889d-b943-4856-b76f-9e46bb6b0df2",
            Self::WorkItemLinking => "40e92b44-2fe1-4dd6-b3d8-74a9c21d0c6e",
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MinimumReviewers => "minimum reviewers",
            Self::CommentRequirements => "comment requirements",
            Self::WorkItemLinking => "work item linking",
        })
    }
}

/// A branch policy on one ref of one repository. Matched on
/// (type, repository, ref); an existing policy is never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchPolicySpec {
    /// Policy type.
    pub policy: PolicyType,
    /// Repository GUID.
    pub repository_id: String,
    /// Full ref name, e.g. `refs/heads/main`.
    pub ref_name: String,
    /// Whether the policy blocks completion.
    pub blocking: bool,
    /// Type-specific settings, without the scope.
    pub settings: Value,
}

impl BranchPolicySpec {
    /// Derives the enabled policies from configuration. `branch` may be a
    /// short name or a full ref.
    #[must_use]
    pub fn from_config(
        repository_id: &str,
        branch: &str,
        config: &BranchPolicyConfig,
    ) -> Vec<Self> {
        let ref_name = if branch.starts_with("refs/") {
            branch.to_string()
        } else {
            format!("refs/heads/{branch}")
        };
        let spec = |policy, settings| Self {
            policy,
            repository_id: repository_id.to_string(),
            ref_name: ref_name.clone(),
            blocking: config.blocking,
            settings,
        };

        let mut specs = Vec::new();
        if config.min_reviewers > 0 {
            specs.push(spec(
                PolicyType::MinimumReviewers,
                json!({
                    "minimumApproverCount": config.min_reviewers,
                    "creatorVoteCounts": config.creator_vote_counts,
                    "resetOnSourcePush": config.reset_on_source_push,
                }),
            ));
        }
        if config.require_comment_resolution {
            specs.push(spec(PolicyType::CommentRequirements, json!({})));
        }
        if config.require_work_item_link {
            specs.push(spec(PolicyType::WorkItemLinking, json!({})));
        }
        specs
    }

    fn matches(&self, configuration: &Value) -> bool {
        let type_matches = configuration
            .pointer("/type/id")
            .and_then(Value::as_str)
            .is_some_and(|id| id.eq_ignore_ascii_case(self.policy.type_id()));
        let scopes = configuration
            .pointer("/settings/scope")
            .and_then(Value::as_array)
            .map_or(&[][..], Vec::as_slice);
        type_matches
            && scopes.iter().any(|scope| {
                let field = |name: &str| scope.get(name).and_then(Value::as_str);
                field("repositoryId") == Some(self.repository_id.as_str())
                    && field("refName") == Some(self.ref_name.as_str())
            })
    }
}

impl ResourceSpec for BranchPolicySpec {
    fn kind(&self) -> ResourceKind {
        ResourceKind::BranchPolicy
    }

    fn name(&self) -> String {
        format!("{} on {}", self.policy, self.ref_name)
    }

    fn desired(&self, _project: &ProjectRef) -> Value {
        let mut settings = self.settings.clone();
        if let Value::Object(map) = &mut settings {
            map.insert(
                "scope".to_string(),
                json!([{
                    "repositoryId": self.repository_id,
                    "refName": self.ref_name,
                    "matchKind": "exact",
                }]),
            );
        }
        json!({
            "isEnabled": true,
            "isBlocking": self.blocking,
            "type": { "id": self.policy.type_id() },
            "settings": settings,
        })
    }

    fn find(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
    ) -> Result<Option<Value>, ReconcileError> {
        let configurations =
            reconciler.list(&format!("{}/_apis/policy/configurations", project.id))?;
        Ok(configurations.into_iter().find(|c| self.matches(c)))
    }

    fn create(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
        desired: &Value,
    ) -> Result<Value, ReconcileError> {
        reconciler.write(
            Method::Post,
            &format!("{}/_apis/policy/configurations", project.id),
            desired,
        )
    }
}

/// A project-scoped security group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// Display name.
    pub name: String,
    /// Description used on creation.
    pub description: String,
}

impl From<&GroupConfig> for GroupSpec {
    fn from(config: &GroupConfig) -> Self {
        Self {
            name: config.name.clone(),
            description: config.description.clone(),
        }
    }
}

impl ResourceSpec for GroupSpec {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Group
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn desired(&self, _project: &ProjectRef) -> Value {
        json!({
            "displayName": self.name,
            "description": self.description,
        })
    }

    fn find(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
    ) -> Result<Option<Value>, ReconcileError> {
        reconciler.find_group(project, &self.name)
    }

    fn create(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
        desired: &Value,
    ) -> Result<Value, ReconcileError> {
        let scope = reconciler.project_scope_descriptor(project)?;
        let url = reconciler.client().graph_url(&format!(
            "_apis/graph/groups?scopeDescriptor={}&api-version={}",
            encode_component(&scope),
            reconciler.graph_api_version()?
        ));
        reconciler.write(Method::Post, &url, desired)
    }

    fn identify(&self, payload: &Value) -> Result<String, ReconcileError> {
        payload_id(ResourceKind::Group, payload, "descriptor")
    }
}

/// Membership of a subject in a group, both named by graph descriptor.
///
/// A `409 Conflict` on create counts as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSpec {
    /// Descriptor of the member.
    pub member: String,
    /// Descriptor of the containing group.
    pub container: String,
}

impl MembershipSpec {
    /// Creates a spec.
    #[must_use]
    pub fn new(member: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            container: container.into(),
        }
    }

    fn url(&self, reconciler: &Reconciler<'_>) -> Result<String, ReconcileError> {
        Ok(reconciler.client().graph_url(&format!(
            "_apis/graph/memberships/{}/{}?api-version={}",
            encode_component(&self.member),
            encode_component(&self.container),
            reconciler.graph_api_version()?
        )))
    }
}

impl ResourceSpec for MembershipSpec {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Membership
    }

    fn name(&self) -> String {
        format!("{} in {}", self.member, self.container)
    }

    fn desired(&self, _project: &ProjectRef) -> Value {
        json!({
            "memberDescriptor": self.member,
            "containerDescriptor": self.container,
        })
    }

    fn find(
        &self,
        reconciler: &Reconciler<'_>,
        _project: &ProjectRef,
    ) -> Result<Option<Value>, ReconcileError> {
        reconciler.get_optional(&self.url(reconciler)?)
    }

    fn create(
        &self,
        reconciler: &Reconciler<'_>,
        _project: &ProjectRef,
        desired: &Value,
    ) -> Result<Value, ReconcileError> {
        let url = self.url(reconciler)?;
        let created = reconciler
            .client()
            .send(Method::Put, &url, None, Side::Target)?
            .json_value()?;
        Ok(if created.is_null() {
            desired.clone()
        } else {
            created
        })
    }

    fn identify(&self, _payload: &Value) -> Result<String, ReconcileError> {
        Ok(format!("{}/{}", self.member, self.container))
    }
}

/// The project wiki.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiSpec {
    /// Wiki name.
    pub name: String,
}

impl WikiSpec {
    /// Creates a spec.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ResourceSpec for WikiSpec {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Wiki
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn desired(&self, project: &ProjectRef) -> Value {
        json!({
            "name": self.name,
            "projectId": project.id,
            "type": "projectWiki",
        })
    }

    fn find(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
    ) -> Result<Option<Value>, ReconcileError> {
        let wikis = reconciler.list(&format!("{}/_apis/wiki/wikis", project.id))?;
        Ok(wikis.into_iter().find(|wiki| {
            wiki.get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| same_name(n, &self.name))
        }))
    }

    fn create(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
        desired: &Value,
    ) -> Result<Value, ReconcileError> {
        reconciler.write(
            Method::Post,
            &format!("{}/_apis/wiki/wikis", project.id),
            desired,
        )
    }
}

/// A work-item template of a team.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSpec {
    /// Team owning the template.
    pub team: String,
    /// Template name.
    pub name: String,
    /// Work-item type, e.g. `Bug`.
    pub work_item_type: String,
    /// Description used on creation.
    pub description: String,
    /// Field reference name to default value.
    pub fields: BTreeMap<String, String>,
}

impl TemplateSpec {
    /// Builds a spec for `team` from configuration.
    #[must_use]
    pub fn from_config(team: impl Into<String>, config: &TemplateConfig) -> Self {
        Self {
            team: team.into(),
            name: config.name.clone(),
            work_item_type: config.work_item_type.clone(),
            description: config.description.clone(),
            fields: config.fields.clone(),
        }
    }

    fn endpoint(&self, project: &ProjectRef) -> String {
        format!(
            "{}/{}/_apis/wit/templates",
            project.id,
            encode_component(&self.team)
        )
    }
}

impl ResourceSpec for TemplateSpec {
    fn kind(&self) -> ResourceKind {
        ResourceKind::WorkItemTemplate
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn desired(&self, _project: &ProjectRef) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "workItemTypeName": self.work_item_type,
            "fields": self.fields,
        })
    }

    fn find(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
    ) -> Result<Option<Value>, ReconcileError> {
        let templates = reconciler.list(&format!(
            "{}?workitemtypename={}",
            self.endpoint(project),
            encode_component(&self.work_item_type)
        ))?;
        Ok(templates.into_iter().find(|template| {
            template
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| same_name(n, &self.name))
        }))
    }

    fn create(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
        desired: &Value,
    ) -> Result<Value, ReconcileError> {
        reconciler.write(Method::Post, &self.endpoint(project), desired)
    }
}
