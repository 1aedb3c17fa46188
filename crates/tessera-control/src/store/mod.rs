//! Persistence for organizations, projects and deployments.
//!
//! The primary implementation uses PostgreSQL; an in-memory implementation is
//! provided for tests and local development. Lookups of missing records fail
//! with [`ControlError::NotFound`](crate::error::ControlError::NotFound).

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{
    Deployment, DeploymentId, DeploymentStatus, Organization, OrganizationId, Project, ProjectId,
    ProjectMember, UpdateProjectOptions,
};

/// Position in a project listing.
///
/// Names are only unique within an organization, so the id breaks ties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectCursor {
    pub name: String,
    pub id: ProjectId,
}

impl ProjectCursor {
    /// Cursor that resumes right after `project`.
    #[must_use]
    pub fn after(project: &Project) -> Self {
        Self {
            name: project.name.clone(),
            id: project.id.clone(),
        }
    }
}

/// Storage backend for control plane records.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_organization(&self, org: &Organization) -> ControlResult<()>;

    async fn find_organization(&self, id: &OrganizationId) -> ControlResult<Organization>;

    async fn delete_organization(&self, id: &OrganizationId) -> ControlResult<()>;

    /// Insert a project together with its initial members.
    ///
    /// Either everything is written or nothing is.
    async fn create_project(&self, project: &Project, members: &[ProjectMember])
        -> ControlResult<()>;

    async fn find_project(&self, id: &ProjectId) -> ControlResult<Project>;

    /// List projects ordered by name then id, starting after `after`.
    async fn list_projects(
        &self,
        after: Option<&ProjectCursor>,
        limit: u32,
    ) -> ControlResult<Vec<Project>>;

    /// Apply `opts` to a project, bumping `updated_on`.
    ///
    /// The production pointer is left alone.
    async fn update_project(
        &self,
        id: &ProjectId,
        opts: &UpdateProjectOptions,
    ) -> ControlResult<Project>;

    async fn find_projects_for_organization(
        &self,
        org: &OrganizationId,
    ) -> ControlResult<Vec<Project>>;

    async fn find_project_members(&self, id: &ProjectId) -> ControlResult<Vec<ProjectMember>>;

    /// Compare-and-swap the project's production deployment.
    ///
    /// Succeeds only when the current value equals `expected`. A new value
    /// must reference a deployment of the same project. Fails with
    /// [`ControlError::ProdDeploymentConflict`](crate::error::ControlError::ProdDeploymentConflict)
    /// otherwise.
    async fn swap_prod_deployment(
        &self,
        project: &ProjectId,
        expected: Option<&DeploymentId>,
        new: Option<&DeploymentId>,
    ) -> ControlResult<Project>;

    /// Delete a project and its members.
    async fn delete_project(&self, id: &ProjectId) -> ControlResult<()>;

    async fn insert_deployment(&self, deployment: &Deployment) -> ControlResult<()>;

    async fn find_deployment(&self, id: &DeploymentId) -> ControlResult<Deployment>;

    async fn find_deployments_for_project(&self, id: &ProjectId)
        -> ControlResult<Vec<Deployment>>;

    /// Set the status and logs of a deployment, bumping `updated_on`.
    async fn update_deployment_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        logs: &str,
    ) -> ControlResult<Deployment>;

    async fn update_deployment_branch(
        &self,
        id: &DeploymentId,
        branch: &str,
    ) -> ControlResult<Deployment>;

    /// Record that a deployment was just used.
    async fn mark_deployment_used(&self, id: &DeploymentId) -> ControlResult<Deployment>;

    /// Atomically move a deployment into `Reconciling`.
    ///
    /// The claim succeeds when the deployment is not reconciling, or when its
    /// last update is older than `stale_after`. Returns `None` when another
    /// reconcile holds the deployment.
    async fn try_start_reconcile(
        &self,
        id: &DeploymentId,
        stale_after: Duration,
    ) -> ControlResult<Option<Deployment>>;

    /// Delete a deployment, clearing any production reference to it.
    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()>;

    /// Slots used by deployments, keyed by runtime host.
    async fn runtime_slots_used(&self) -> ControlResult<HashMap<String, u32>>;
}

fn stale_after(stale_after: Duration) -> chrono::Duration {
    chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX)
}
