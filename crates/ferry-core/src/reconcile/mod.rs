//! Idempotent reconciliation of target platform resources.
//!
//! Every resource kind is reconciled the same way:
//!
//! 1. Query the live state through the [`TransportClient`].
//! 2. Absent: create it with the desired state.
//! 3. Present and `allow_existing = false`: idempotent kinds return the
//!    existing resource, conflict-sensitive kinds (the repository) refuse.
//! 4. Present and `allow_existing = true`: return the existing resource
//!    marked [`Origin::Reused`]. Nothing is deleted, recreated or updated;
//!    only presence is reconciled.
//!
//! The live state is re-read on every call. Nothing here is persisted, and
//! concurrent edits by other writers are not defended against.

mod kinds;
mod security;


use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use kinds::{
    BranchPolicySpec, GroupSpec, MembershipSpec, PolicyType, RepositorySpec, TemplateSpec,
    WikiSpec,
};
pub use security::{DenyOutcome, GIT_SECURITY_NAMESPACE, GitPermission, repository_token};

use crate::transport::{Method, NormalizedError, Side, TransportClient, encode_component};

/// Errors raised while reconciling resources.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// A request failed.
    #[error(transparent)]
    Transport(#[from] NormalizedError),

    /// A conflict-sensitive resource exists and reuse was not requested.
    #[error("{kind} '{name}' already exists in project '{project}'")]
    AlreadyExists {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource name.
        name: String,
        /// Containing project.
        project: String,
    },

    /// The target project does not exist. Projects are never created here.
    #[error("target project '{name}' does not exist")]
    ProjectNotFound {
        /// Project name.
        name: String,
    },

    /// An identity could not be resolved.
    #[error("no identity found for subject descriptor '{descriptor}'")]
    IdentityNotFound {
        /// Subject descriptor that was looked up.
        descriptor: String,
    },

    /// The platform answered with a shape this crate does not understand.
    #[error("unexpected {kind} payload: {reason}")]
    UnexpectedPayload {
        /// Resource kind.
        kind: ResourceKind,
        /// What was missing or malformed.
        reason: String,
    },
}

/// The kinds of resource that are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Target project; looked up, never created.
    Project,
    /// Git repository.
    Repository,
    /// Branch policy configuration.
    BranchPolicy,
    /// Project-scoped security group.
    Group,
    /// Group membership.
    Membership,
    /// Project wiki.
    Wiki,
    /// Work-item template.
    WorkItemTemplate,
}

impl ResourceKind {
    /// Returns the snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Repository => "repository",
            Self::BranchPolicy => "branch_policy",
            Self::Group => "group",
            Self::Membership => "membership",
            Self::Wiki => "wiki",
            Self::WorkItemTemplate => "work_item_template",
        }
    }

    /// Whether an existing instance must be explicitly opted into.
    #[must_use]
    pub const fn is_conflict_sensitive(self) -> bool {
        matches!(self, Self::Repository)
    }

    /// Whether a `409 Conflict` on create means the resource is present.
    #[must_use]
    pub const fn conflict_means_present(self) -> bool {
        matches!(self, Self::Membership)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a reconciled resource came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Created by this call.
    Created,
    /// Already present; returned unchanged.
    Existing,
    /// Already present and explicitly reused.
    Reused,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Existing => "existing",
            Self::Reused => "reused",
        })
    }
}

/// A resource after reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Platform identifier (GUID, numeric id or descriptor).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether it was created, found or reused.
    pub origin: Origin,
    /// The platform's representation.
    pub payload: Value,
}

/// Desired versus live state of one resource, computed per call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Desired state.
    pub desired: Value,
    /// Live state, if present.
    pub existing: Option<Value>,
}

/// A target project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    /// Project GUID.
    pub id: String,
    /// Project name.
    pub name: String,
}

/// One reconcilable resource kind.
pub trait ResourceSpec {
    /// The kind reconciled.
    fn kind(&self) -> ResourceKind;

    /// Display name used in logs and errors.
    fn name(&self) -> String;

    /// Desired state inside `project`; also used as the creation body.
    fn desired(&self, project: &ProjectRef) -> Value;

    /// Reads the live state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails for a reason other than absence.
    fn find(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
    ) -> Result<Option<Value>, ReconcileError>;

    /// Creates the resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the create request fails.
    fn create(
        &self,
        reconciler: &Reconciler<'_>,
        project: &ProjectRef,
        desired: &Value,
    ) -> Result<Value, ReconcileError>;

    /// Extracts the identifier from a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload carries no identifier.
    fn identify(&self, payload: &Value) -> Result<String, ReconcileError> {
        payload_id(self.kind(), payload, "id")
    }
}

/// Reconciles resources through a [`TransportClient`].
#[derive(Debug, Clone, Copy)]
pub struct Reconciler<'a> {
    client: &'a TransportClient,
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler.
    #[must_use]
    pub const fn new(client: &'a TransportClient) -> Self {
        Self { client }
    }

    /// The underlying client.
    #[must_use]
    pub const fn client(&self) -> &'a TransportClient {
        self.client
    }

    /// Ensures a resource is present in `project`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::AlreadyExists`] for an existing
    /// conflict-sensitive resource without `allow_existing`, or the
    /// underlying lookup or create failure.
    pub fn ensure(
        &self,
        project: &ProjectRef,
        spec: &dyn ResourceSpec,
        allow_existing: bool,
    ) -> Result<Resource, ReconcileError> {
        let kind = spec.kind();
        let name = spec.name();
        let descriptor = ResourceDescriptor {
            kind,
            desired: spec.desired(project),
            existing: spec.find(self, project)?,
        };
        tracing::debug!(
            kind = %kind,
            name = %name,
            present = descriptor.existing.is_some(),
            "reconciling resource"
        );

        let (payload, origin) = match descriptor.existing {
            None => match spec.create(self, project, &descriptor.desired) {
                Ok(created) => (created, Origin::Created),
                Err(ReconcileError::Transport(e))
                    if e.is_conflict() && kind.conflict_means_present() =>
                {
                    tracing::debug!(
                        kind = %kind,
                        name = %name,
                        "create conflicted, already present"
                    );
                    (descriptor.desired, Origin::Existing)
                },
                Err(e) => return Err(e),
            },
            Some(existing) if allow_existing => (existing, Origin::Reused),
            Some(_) if kind.is_conflict_sensitive() => {
                return Err(ReconcileError::AlreadyExists {
                    kind,
                    name,
                    project: project.name.clone(),
                });
            },
            Some(existing) => (existing, Origin::Existing),
        };

        let id = spec.identify(&payload)?;
        tracing::info!(
            kind = %kind,
            name = %name,
            id = %id,
            origin = %origin,
            "resource reconciled"
        );
        Ok(Resource {
            kind,
            id,
            name,
            origin,
            payload,
        })
    }

    /// Looks up a project by name or id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails for a reason other than absence.
    pub fn find_project(&self, name: &str) -> Result<Option<ProjectRef>, ReconcileError> {
        let endpoint = format!("_apis/projects/{}", encode_component(name));
        let Some(payload) = self.get_optional(&endpoint)? else {
            return Ok(None);
        };
        serde_json::from_value(payload)
            .map(Some)
            .map_err(|e| ReconcileError::UnexpectedPayload {
                kind: ResourceKind::Project,
                reason: e.to_string(),
            })
    }

    /// Looks up a project that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ProjectNotFound`] if it does not.
    pub fn require_project(&self, name: &str) -> Result<ProjectRef, ReconcileError> {
        self.find_project(name)?
            .ok_or_else(|| ReconcileError::ProjectNotFound {
                name: name.to_string(),
            })
    }

    /// Looks up a repository by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails for a reason other than absence.
    pub fn find_repository(
        &self,
        project: &ProjectRef,
        name: &str,
    ) -> Result<Option<Value>, ReconcileError> {
        self.get_optional(&format!(
            "{}/_apis/git/repositories/{}",
            project.id,
            encode_component(name)
        ))
    }

    /// Looks up a project-scoped group by display name.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn find_group(
        &self,
        project: &ProjectRef,
        name: &str,
    ) -> Result<Option<Value>, ReconcileError> {
        let scope = self.project_scope_descriptor(project)?;
        let url = self.client.graph_url(&format!(
            "_apis/graph/groups?scopeDescriptor={}&api-version={}",
            encode_component(&scope),
            self.graph_api_version()?
        ));
        let groups = self.list(&url)?;
        Ok(groups.into_iter().find(|group| {
            group
                .get("displayName")
                .and_then(Value::as_str)
                .is_some_and(|n| same_name(n, name))
        }))
    }

    /// The project's graph scope descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails or the answer has no value.
    pub fn project_scope_descriptor(&self, project: &ProjectRef) -> Result<String, ReconcileError> {
        let url = self.client.graph_url(&format!(
            "_apis/graph/descriptors/{}?api-version={}",
            project.id,
            self.graph_api_version()?
        ));
        let payload = self
            .client
            .send(Method::Get, &url, None, Side::Target)?
            .json_value()?;
        payload
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ReconcileError::UnexpectedPayload {
                kind: ResourceKind::Project,
                reason: "descriptor response has no value".to_string(),
            })
    }

    /// API version for the preview-only graph endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the target API version cannot be resolved.
    pub fn graph_api_version(&self) -> Result<String, ReconcileError> {
        Ok(format!("{}-preview.1", self.client.api_version()?))
    }

    /// GET that maps `404 Not Found` to `None`.
    pub(crate) fn get_optional(&self, endpoint: &str) -> Result<Option<Value>, ReconcileError> {
        match self.client.send(Method::Get, endpoint, None, Side::Target) {
            Ok(response) => Ok(Some(response.json_value()?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// GET of a `{"count": n, "value": [...]}` collection.
    pub(crate) fn list(&self, endpoint: &str) -> Result<Vec<Value>, ReconcileError> {
        let payload = self
            .client
            .send(Method::Get, endpoint, None, Side::Target)?
            .json_value()?;
        Ok(match payload {
            Value::Object(mut map) => match map.remove("value") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            Value::Array(items) => items,
            _ => Vec::new(),
        })
    }

    /// Sends a write and decodes the answer.
    pub(crate) fn write(
        &self,
        method: Method,
        endpoint: &str,
        body: &Value,
    ) -> Result<Value, ReconcileError> {
        Ok(self
            .client
            .send(method, endpoint, Some(body.clone()), Side::Target)?
            .json_value()?)
    }
}

/// Case-insensitive name comparison.
pub(crate) fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Reads a string or numeric identifier field.
pub(crate) fn payload_id(
    kind: ResourceKind,
    payload: &Value,
    field: &str,
) -> Result<String, ReconcileError> {
    match payload.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ReconcileError::UnexpectedPayload {
            kind,
            reason: format!("missing '{field}'"),
        }),
    }
}
