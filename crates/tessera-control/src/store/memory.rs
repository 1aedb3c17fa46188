//! In-memory store for testing.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult};
use crate::types::{
    Deployment, DeploymentId, DeploymentStatus, Organization, OrganizationId, Project, ProjectId,
    ProjectMember, UpdateProjectOptions,
};

use super::{ProjectCursor, Store};

#[derive(Debug, Default)]
struct Tables {
    organizations: HashMap<OrganizationId, Organization>,
    projects: HashMap<ProjectId, Project>,
    members: HashMap<ProjectId, Vec<ProjectMember>>,
    deployments: HashMap<DeploymentId, Deployment>,
}

/// In-memory store for testing.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits. All tables share one lock so multi-record
/// operations are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ControlResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    /// Overwrite a deployment's `updated_on`. Test hook for staleness.
    pub fn set_deployment_updated_on(
        &self,
        id: &DeploymentId,
        updated_on: DateTime<Utc>,
    ) -> ControlResult<()> {
        let mut tables = self.write()?;
        let deployment = tables
            .deployments
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found("deployment", id))?;
        deployment.updated_on = updated_on;
        Ok(())
    }

    /// Overwrite a deployment's `used_on`. Test hook for idle expiry.
    pub fn set_deployment_used_on(
        &self,
        id: &DeploymentId,
        used_on: DateTime<Utc>,
    ) -> ControlResult<()> {
        let mut tables = self.write()?;
        let deployment = tables
            .deployments
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found("deployment", id))?;
        deployment.used_on = used_on;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_organization(&self, org: &Organization) -> ControlResult<()> {
        let mut tables = self.write()?;
        if tables.organizations.values().any(|o| o.name == org.name) {
            return Err(ControlError::internal(format!(
                "organization {} already exists",
                org.name
            )));
        }
        tables.organizations.insert(org.id.clone(), org.clone());
        Ok(())
    }

    async fn find_organization(&self, id: &OrganizationId) -> ControlResult<Organization> {
        self.read()?
            .organizations
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::not_found("organization", id))
    }

    async fn delete_organization(&self, id: &OrganizationId) -> ControlResult<()> {
        let mut tables = self.write()?;
        if tables.projects.values().any(|p| &p.organization_id == id) {
            return Err(ControlError::internal(format!(
                "organization {id} still has projects"
            )));
        }
        tables
            .organizations
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ControlError::not_found("organization", id))
    }

    async fn create_project(
        &self,
        project: &Project,
        members: &[ProjectMember],
    ) -> ControlResult<()> {
        let mut tables = self.write()?;
        if !tables.organizations.contains_key(&project.organization_id) {
            return Err(ControlError::not_found(
                "organization",
                &project.organization_id,
            ));
        }
        if tables.projects.values().any(|p| {
            p.organization_id == project.organization_id && p.name == project.name
        }) {
            return Err(ControlError::internal(format!(
                "project {} already exists",
                project.name
            )));
        }
        tables.projects.insert(project.id.clone(), project.clone());
        tables.members.insert(project.id.clone(), members.to_vec());
        Ok(())
    }

    async fn find_project(&self, id: &ProjectId) -> ControlResult<Project> {
        self.read()?
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::not_found("project", id))
    }

    async fn list_projects(
        &self,
        after: Option<&ProjectCursor>,
        limit: u32,
    ) -> ControlResult<Vec<Project>> {
        let tables = self.read()?;
        let mut projects: Vec<_> = tables
            .projects
            .values()
            .filter(|p| {
                after.map_or(true, |c| (p.name.as_str(), &p.id) > (c.name.as_str(), &c.id))
            })
            .cloned()
            .collect();
        projects.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));

        #[allow(clippy::as_conversions)]
        projects.truncate(limit as usize);
        Ok(projects)
    }

    async fn update_project(
        &self,
        id: &ProjectId,
        opts: &UpdateProjectOptions,
    ) -> ControlResult<Project> {
        let mut tables = self.write()?;
        let org = tables
            .projects
            .get(id)
            .map(|p| p.organization_id.clone())
            .ok_or_else(|| ControlError::not_found("project", id))?;
        if tables
            .projects
            .values()
            .any(|p| p.organization_id == org && p.name == opts.name && &p.id != id)
        {
            return Err(ControlError::internal(format!(
                "project {} already exists",
                opts.name
            )));
        }

        let record = tables
            .projects
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found("project", id))?;
        opts.name.clone_into(&mut record.name);
        record.git_url.clone_from(&opts.git_url);
        opts.prod_branch.clone_into(&mut record.prod_branch);
        record.prod_ttl_seconds = opts.prod_ttl_seconds;
        record.updated_on = Utc::now();
        Ok(record.clone())
    }

    async fn find_projects_for_organization(
        &self,
        org: &OrganizationId,
    ) -> ControlResult<Vec<Project>> {
        let tables = self.read()?;
        let mut projects: Vec<_> = tables
            .projects
            .values()
            .filter(|p| &p.organization_id == org)
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn find_project_members(&self, id: &ProjectId) -> ControlResult<Vec<ProjectMember>> {
        Ok(self.read()?.members.get(id).cloned().unwrap_or_default())
    }

    async fn swap_prod_deployment(
        &self,
        project: &ProjectId,
        expected: Option<&DeploymentId>,
        new: Option<&DeploymentId>,
    ) -> ControlResult<Project> {
        let mut tables = self.write()?;

        if let Some(new) = new {
            let deployment = tables
                .deployments
                .get(new)
                .ok_or_else(|| ControlError::not_found("deployment", new))?;
            if &deployment.project_id != project {
                return Err(ControlError::internal(format!(
                    "deployment {new} does not belong to project {project}"
                )));
            }
        }

        let record = tables
            .projects
            .get_mut(project)
            .ok_or_else(|| ControlError::not_found("project", project))?;
        if record.prod_deployment_id.as_ref() != expected {
            return Err(ControlError::ProdDeploymentConflict {
                project: project.to_string(),
            });
        }

        record.prod_deployment_id = new.cloned();
        record.updated_on = Utc::now();
        Ok(record.clone())
    }

    async fn delete_project(&self, id: &ProjectId) -> ControlResult<()> {
        let mut tables = self.write()?;
        if tables.projects.remove(id).is_none() {
            return Err(ControlError::not_found("project", id));
        }
        tables.members.remove(id);
        tables.deployments.retain(|_, d| &d.project_id != id);
        Ok(())
    }

    async fn insert_deployment(&self, deployment: &Deployment) -> ControlResult<()> {
        let mut tables = self.write()?;
        if !tables.projects.contains_key(&deployment.project_id) {
            return Err(ControlError::not_found("project", &deployment.project_id));
        }
        if tables.deployments.contains_key(&deployment.id) {
            return Err(ControlError::internal(format!(
                "deployment {} already exists",
                deployment.id
            )));
        }
        tables
            .deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn find_deployment(&self, id: &DeploymentId) -> ControlResult<Deployment> {
        self.read()?
            .deployments
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::not_found("deployment", id))
    }

    async fn find_deployments_for_project(
        &self,
        id: &ProjectId,
    ) -> ControlResult<Vec<Deployment>> {
        let tables = self.read()?;
        let mut deployments: Vec<_> = tables
            .deployments
            .values()
            .filter(|d| &d.project_id == id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| a.created_on.cmp(&b.created_on));
        Ok(deployments)
    }

    async fn update_deployment_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        logs: &str,
    ) -> ControlResult<Deployment> {
        let mut tables = self.write()?;
        let deployment = tables
            .deployments
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found("deployment", id))?;

        deployment.status = status;
        logs.clone_into(&mut deployment.status_message);
        deployment.updated_on = Utc::now();
        Ok(deployment.clone())
    }

    async fn update_deployment_branch(
        &self,
        id: &DeploymentId,
        branch: &str,
    ) -> ControlResult<Deployment> {
        let mut tables = self.write()?;
        let deployment = tables
            .deployments
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found("deployment", id))?;

        branch.clone_into(&mut deployment.branch);
        deployment.updated_on = Utc::now();
        Ok(deployment.clone())
    }

    async fn mark_deployment_used(&self, id: &DeploymentId) -> ControlResult<Deployment> {
        let mut tables = self.write()?;
        let deployment = tables
            .deployments
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found("deployment", id))?;

        deployment.used_on = Utc::now();
        Ok(deployment.clone())
    }

    async fn try_start_reconcile(
        &self,
        id: &DeploymentId,
        stale_after: Duration,
    ) -> ControlResult<Option<Deployment>> {
        let now = Utc::now();
        let cutoff = now
            .checked_sub_signed(super::stale_after(stale_after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut tables = self.write()?;
        let deployment = tables
            .deployments
            .get_mut(id)
            .ok_or_else(|| ControlError::not_found("deployment", id))?;

        if deployment.status == DeploymentStatus::Reconciling && deployment.updated_on >= cutoff {
            return Ok(None);
        }

        deployment.status = DeploymentStatus::Reconciling;
        deployment.updated_on = now;
        Ok(Some(deployment.clone()))
    }

    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()> {
        let mut tables = self.write()?;
        if tables.deployments.remove(id).is_none() {
            return Err(ControlError::not_found("deployment", id));
        }
        for project in tables.projects.values_mut() {
            if project.prod_deployment_id.as_ref() == Some(id) {
                project.prod_deployment_id = None;
            }
        }
        Ok(())
    }

    async fn runtime_slots_used(&self) -> ControlResult<HashMap<String, u32>> {
        let tables = self.read()?;
        let mut used: HashMap<String, u32> = HashMap::new();
        for deployment in tables.deployments.values() {
            *used.entry(deployment.runtime.host.clone()).or_default() += deployment.slots;
        }
        Ok(used)
    }
}
