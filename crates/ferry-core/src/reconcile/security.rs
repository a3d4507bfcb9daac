//! Deny-list reconciliation on the Git repositories security namespace.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ProjectRef, ReconcileError, Reconciler};
use crate::transport::{Method, Side, encode_component};

/// Security namespace of Git repositories.
pub const GIT_SECURITY_NAMESPACE: &str = "2e9eb7ed-3c0a-47d4-87c1-0ffdd275fd87";

/// Security token of one repository.
#[must_use]
pub fn repository_token(project_id: &str, repository_id: &str) -> String {
    format!("repoV2/{project_id}/{repository_id}")
}

/// Permission bits of the Git repositories namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitPermission {
    /// Push commits.
    GenericContribute,
    /// Rewrite history and delete branches.
    ForcePush,
    /// Create branches.
    CreateBranch,
    /// Create tags.
    CreateTag,
    /// Manage notes.
    ManageNotes,
    /// Bypass policies when pushing.
    PolicyExempt,
    /// Create repositories.
    CreateRepository,
    /// Delete the repository.
    DeleteRepository,
    /// Rename the repository.
    RenameRepository,
    /// Edit policies.
    EditPolicies,
    /// Remove other users' locks.
    RemoveOthersLocks,
    /// Manage permissions.
    ManagePermissions,
    /// Contribute to pull requests.
    PullRequestContribute,
    /// Bypass policies when completing pull requests.
    PullRequestBypassPolicy,
}

impl GitPermission {
    /// The permission bit.
    #[must_use]
    pub const fn bit(self) -> u32 {
        match self {
            Self::GenericContribute => 4,
            Self::ForcePush => 8,
            Self::CreateBranch => 16,
            Self::CreateTag => 32,
            Self::ManageNotes => 64,
            Self::PolicyExempt => 128,
            Self::CreateRepository => 256,
            Self::DeleteRepository => 512,
            Self::RenameRepository => 1024,
            Self::EditPolicies => 2048,
            Self::RemoveOthersLocks => 4096,
            Self::ManagePermissions => 8192,
            Self::PullRequestContribute => 16384,
            Self::PullRequestBypassPolicy => 32768,
        }
    }

    /// Combined mask of several permissions.
    #[must_use]
    pub fn mask(permissions: &[Self]) -> u32 {
        permissions.iter().fold(0, |mask, p| mask | p.bit())
    }
}

/// Result of a deny-list reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyOutcome {
    /// Security token written.
    pub token: String,
    /// Identity descriptor the entry applies to.
    pub descriptor: String,
    /// Deny bits written.
    pub deny: u32,
    /// Deny bits present before the write, when the read succeeded.
    pub previous_deny: Option<u32>,
}

impl Reconciler<'_> {
    /// Resolves a graph subject descriptor to the identity descriptor used
    /// by access control entries.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::IdentityNotFound`] if no identity matches.
    pub fn identity_descriptor(&self, subject_descriptor: &str) -> Result<String, ReconcileError> {
        let url = self.client().graph_url(&format!(
            "_apis/identities?subjectDescriptors={}&queryMembership=None",
            encode_component(subject_descriptor)
        ));
        let identities = self.list(&url)?;
        identities
            .first()
            .and_then(|identity| identity.get("descriptor"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ReconcileError::IdentityNotFound {
                descriptor: subject_descriptor.to_string(),
            })
    }

    /// Denies `permissions` to an identity on one repository.
    ///
    /// The current entry is read first on a best-effort basis; a failed
    /// read is logged and ignored. The write merges into the existing entry
    /// and only sets deny bits.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn deny_permissions(
        &self,
        project: &ProjectRef,
        repository_id: &str,
        identity_descriptor: &str,
        permissions: &[GitPermission],
    ) -> Result<DenyOutcome, ReconcileError> {
        let token = repository_token(&project.id, repository_id);
        let deny = GitPermission::mask(permissions);

        let previous_deny = match self.current_deny(&token, identity_descriptor) {
            Ok(bits) => bits,
            Err(e) => {
                tracing::warn!(
                    token = %token,
                    error = %e,
                    "could not read current access control entries; continuing"
                );
                None
            },
        };
        if previous_deny.is_some_and(|bits| bits & deny == deny) {
            tracing::debug!(token = %token, deny, "deny bits already present");
        }

        let body = json!({
            "token": token,
            "merge": true,
            "accessControlEntries": [{
                "descriptor": identity_descriptor,
                "allow": 0,
                "deny": deny,
                "extendedInfo": {},
            }],
        });
        self.write(
            Method::Post,
            &format!("_apis/accesscontrolentries/{GIT_SECURITY_NAMESPACE}"),
            &body,
        )?;
        tracing::info!(token = %token, deny, "repository permissions restricted");

        Ok(DenyOutcome {
            token,
            descriptor: identity_descriptor.to_string(),
            deny,
            previous_deny,
        })
    }

    fn current_deny(&self, token: &str, descriptor: &str) -> Result<Option<u32>, ReconcileError> {
        let endpoint = format!(
            "_apis/accesscontrollists/{GIT_SECURITY_NAMESPACE}?token={}&descriptors={}&includeExtendedInfo=false",
            encode_component(token),
            encode_component(descriptor)
        );
        let payload = self
            .client()
            .send(Method::Get, &endpoint, None, Side::Target)?
            .json_value()?;
        let deny = payload
            .get("value")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|acl| acl.pointer("/acesDictionary"))
            .filter_map(Value::as_object)
            .flat_map(|aces| aces.values())
            .filter(|ace| ace.get("descriptor").and_then(Value::as_str) == Some(descriptor))
            .filter_map(|ace| ace.get("deny").and_then(Value::as_u64))
            .filter_map(|bits| u32::try_from(bits).ok())
            .reduce(|a, b| a | b);
        Ok(deny)
    }
}
