//! Project scaffolding: groups, memberships, the wiki and work-item
//! templates that accompany migrated repositories.
//!
//! The project itself must already exist; scaffolding never creates it.

use serde::{Deserialize, Serialize};

use crate::config::ScaffoldConfig;
use crate::reconcile::{
    GroupSpec, MembershipSpec, Origin, ReconcileError, Reconciler, Resource, ResourceKind,
    TemplateSpec, WikiSpec,
};

/// One reconciled scaffolding resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaffoldEntry {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Display name.
    pub name: String,
    /// Platform identifier.
    pub id: String,
    /// Whether it was created or already present.
    pub origin: Origin,
}

/// Outcome of a scaffolding run, in reconciliation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaffoldReport {
    /// Project name.
    pub project: String,
    /// Reconciled resources.
    pub entries: Vec<ScaffoldEntry>,
}

impl ScaffoldReport {
    /// Number of resources created by this run.
    #[must_use]
    pub fn created(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.origin == Origin::Created)
            .count()
    }
}

/// Applies a [`ScaffoldConfig`] to a project.
#[derive(Debug, Clone, Copy)]
pub struct Scaffolder<'a> {
    reconciler: Reconciler<'a>,
}

impl<'a> Scaffolder<'a> {
    /// Creates a scaffolder.
    #[must_use]
    pub const fn new(reconciler: Reconciler<'a>) -> Self {
        Self { reconciler }
    }

    /// Ensures every configured resource exists in `project_name`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::ProjectNotFound`] if the project does not
    /// exist, or the first reconciliation failure.
    pub fn apply(
        &self,
        project_name: &str,
        config: &ScaffoldConfig,
    ) -> Result<ScaffoldReport, ReconcileError> {
        let project = self.reconciler.require_project(project_name)?;
        let mut entries = Vec::new();

        for group in &config.groups {
            let resource = self
                .reconciler
                .ensure(&project, &GroupSpec::from(group), false)?;
            let container = resource.id.clone();
            entries.push(ScaffoldEntry::from(resource));
            for member in &group.members {
                let membership = self.reconciler.ensure(
                    &project,
                    &MembershipSpec::new(member.as_str(), container.as_str()),
                    false,
                )?;
                entries.push(ScaffoldEntry::from(membership));
            }
        }

        if let Some(wiki) = &config.wiki {
            let resource = self
                .reconciler
                .ensure(&project, &WikiSpec::new(wiki.as_str()), false)?;
            entries.push(ScaffoldEntry::from(resource));
        }

        let team = config
            .team
            .clone()
            .unwrap_or_else(|| format!("{} Team", project.name));
        for template in &config.templates {
            let resource = self.reconciler.ensure(
                &project,
                &TemplateSpec::from_config(team.as_str(), template),
                false,
            )?;
            entries.push(ScaffoldEntry::from(resource));
        }

        let report = ScaffoldReport {
            project: project.name,
            entries,
        };
        tracing::info!(
            project = %report.project,
            resources = report.entries.len(),
            created = report.created(),
            "project scaffolding reconciled"
        );
        Ok(report)
    }
}

impl From<Resource> for ScaffoldEntry {
    fn from(resource: Resource) -> Self {
        Self {
            kind: resource.kind,
            name: resource.name,
            id: resource.id,
            origin: resource.origin,
        }
    }
}
