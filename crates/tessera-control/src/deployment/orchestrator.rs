//! Project and deployment lifecycle sagas.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::OrchestratorConfig;
use crate::error::{ControlError, ControlResult};
use crate::provisioner::{ProvisionOptions, ProvisionerSet};
use crate::runtime::RuntimeClientFactory;
use crate::store::{ProjectCursor, Store};
use crate::types::{
    CreateProjectOptions, Deployment, DeploymentId, Organization, OrganizationId, Project,
    ProjectMember, ProjectRole, RuntimeEndpoint, UpdateProjectOptions, UserId,
};

use super::reconcile::{ReconcileScope, Reconciler};

/// Page size when walking every project.
const PROJECT_PAGE_SIZE: u32 = 100;

/// Orchestrates project and deployment lifecycle operations.
///
/// Every multi-step operation compensates completed steps in reverse order
/// when a later step fails. Reconciles run in the background on tasks that
/// stop when the shutdown token is cancelled.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    provisioners: ProvisionerSet,
    runtime: Arc<dyn RuntimeClientFactory>,
    reconciler: Reconciler,
    config: OrchestratorConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(
        store: Arc<dyn Store>,
        provisioners: ProvisionerSet,
        runtime: Arc<dyn RuntimeClientFactory>,
        config: OrchestratorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&runtime),
            config.reconcile_stale_after(),
        );
        Self {
            store,
            provisioners,
            runtime,
            reconciler,
            config,
            shutdown,
            tasks: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn provisioners(&self) -> &ProvisionerSet {
        &self.provisioners
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn RuntimeClientFactory> {
        &self.runtime
    }

    #[must_use]
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Create a project with a running production deployment.
    ///
    /// 1. Insert the project and seed its members (creator as admin, the
    ///    organization's all-users group as viewer)
    /// 2. Provision a deployment
    /// 3. Point the project at it
    /// 4. Trigger a reconcile in the background
    pub async fn create_project(
        &self,
        org: &Organization,
        creator: &UserId,
        opts: CreateProjectOptions,
    ) -> ControlResult<Project> {
        let provisioner = opts
            .provisioner
            .clone()
            .unwrap_or_else(|| self.config.default_provisioner.clone());
        self.provisioners.get(&provisioner)?;

        let project = Project::new(org.id.clone(), opts, provisioner);
        let mut members = vec![ProjectMember::user(creator.clone(), ProjectRole::Admin)];
        if let Some(group) = &org.all_usergroup_id {
            members.push(ProjectMember::usergroup(group.clone(), ProjectRole::Viewer));
        }

        info!(project_id = %project.id, org = %org.name, name = %project.name, "creating project");
        self.store.create_project(&project, &members).await?;

        let deployment = match self.create_deployment(&project).await {
            Ok(deployment) => deployment,
            Err(e) => {
                let cleanup = self.store.delete_project(&project.id).await;
                return Err(e.compensated([cleanup]));
            }
        };

        let project = match self
            .store
            .swap_prod_deployment(&project.id, None, Some(&deployment.id))
            .await
        {
            Ok(project) => project,
            Err(e) => {
                let teardown = self.teardown_deployment(&deployment).await;
                let cleanup = self.store.delete_project(&project.id).await;
                return Err(e
                    .context("failed to set production deployment")
                    .compensated([teardown, cleanup]));
            }
        };

        self.trigger_reconcile(&deployment);
        Ok(project)
    }

    /// Replace `prev` with a freshly provisioned deployment.
    ///
    /// The production pointer only moves if it still holds the value `project`
    /// was read with. A failed teardown of `prev` is logged, not returned.
    pub async fn trigger_redeploy(
        &self,
        project: &Project,
        prev: &Deployment,
    ) -> ControlResult<Deployment> {
        if prev.project_id != project.id {
            return Err(ControlError::internal(format!(
                "deployment {} does not belong to project {}",
                prev.id, project.id
            )));
        }

        info!(project_id = %project.id, prev = %prev.id, "redeploying project");
        let deployment = self.create_deployment(project).await?;

        if let Err(e) = self
            .store
            .swap_prod_deployment(
                &project.id,
                project.prod_deployment_id.as_ref(),
                Some(&deployment.id),
            )
            .await
        {
            let teardown = self.teardown_deployment(&deployment).await;
            return Err(e.compensated([teardown]));
        }

        if let Err(e) = self.teardown_deployment(prev).await {
            error!(
                project_id = %project.id,
                deployment_id = %prev.id,
                error = %e,
                "could not tear down previous deployment"
            );
        }

        self.trigger_reconcile(&deployment);
        Ok(deployment)
    }

    /// Tear down every deployment of a project, then delete it.
    ///
    /// Stops at the first failed deployment; the project is kept so the
    /// teardown can be retried.
    pub async fn teardown_project(&self, project: &Project) -> ControlResult<()> {
        info!(project_id = %project.id, "tearing down project");
        for deployment in self.store.find_deployments_for_project(&project.id).await? {
            self.teardown_deployment(&deployment).await?;
        }
        self.store.delete_project(&project.id).await
    }

    /// Tear down the production deployment and clear the pointer.
    ///
    /// The pointer goes with the deployment record, so a failed deprovision
    /// leaves the project pointing at the still-running deployment.
    pub async fn hibernate_project(&self, project: &Project) -> ControlResult<Project> {
        let Some(id) = &project.prod_deployment_id else {
            return Ok(project.clone());
        };

        info!(project_id = %project.id, deployment_id = %id, "hibernating project");
        let deployment = self.store.find_deployment(id).await?;
        self.teardown_deployment(&deployment).await?;
        self.store.find_project(&project.id).await
    }

    /// Apply `opts` to a project and every deployment it affects.
    ///
    /// Branch changes are recorded on each deployment and a new runtime
    /// version is rolled out through the provisioner. No reconcile is
    /// started. Deployments are updated before the project, so a failure
    /// leaves the project as it was and the update can be retried.
    pub async fn update_project(
        &self,
        project: &Project,
        opts: UpdateProjectOptions,
    ) -> ControlResult<Project> {
        info!(project_id = %project.id, "updating project");
        if opts.impacts_deployments(project) {
            for deployment in self.store.find_deployments_for_project(&project.id).await? {
                self.update_deployment(&deployment, &opts).await?;
            }
        }
        self.store.update_project(&project.id, &opts).await
    }

    /// Record use of a deployment, postponing its hibernation.
    pub async fn mark_used(&self, deployment: &DeploymentId) -> ControlResult<Deployment> {
        self.store.mark_deployment_used(deployment).await
    }

    /// Tear down every project of an organization, then delete it.
    pub async fn purge_organization(&self, org: &OrganizationId) -> ControlResult<()> {
        info!(org_id = %org, "purging organization");
        for project in self.store.find_projects_for_organization(org).await? {
            self.teardown_project(&project).await?;
        }
        self.store.delete_organization(org).await
    }

    /// Redeploy every deployment whose provisioner is still configured.
    ///
    /// Failures are logged per project and do not stop the sweep.
    pub async fn redeploy_all(&self) -> ControlResult<()> {
        for project in self.all_projects().await? {
            let deployments = match self.store.find_deployments_for_project(&project.id).await {
                Ok(deployments) => deployments,
                Err(e) => {
                    error!(project_id = %project.id, error = %e, "could not list deployments");
                    continue;
                }
            };

            for deployment in deployments {
                if !self.provisioners.contains(&deployment.provisioner) {
                    warn!(
                        deployment_id = %deployment.id,
                        provisioner = %deployment.provisioner,
                        "skipping deployment with unknown provisioner"
                    );
                    continue;
                }

                // The pointer moves with every redeploy.
                let result = match self.store.find_project(&project.id).await {
                    Ok(current) => self.trigger_redeploy(&current, &deployment).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    error!(
                        project_id = %project.id,
                        deployment_id = %deployment.id,
                        error = %e,
                        "redeploy failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Every project, in name order.
    pub async fn all_projects(&self) -> ControlResult<Vec<Project>> {
        let mut projects = Vec::new();
        let mut after: Option<ProjectCursor> = None;
        loop {
            let page = self
                .store
                .list_projects(after.as_ref(), PROJECT_PAGE_SIZE)
                .await?;
            let Some(last) = page.last() else { break };
            after = Some(ProjectCursor::after(last));

            #[allow(clippy::as_conversions)]
            let full = page.len() == PROJECT_PAGE_SIZE as usize;
            projects.extend(page);
            if !full {
                break;
            }
        }
        Ok(projects)
    }

    /// Reconcile a deployment in the background.
    pub fn trigger_reconcile(&self, deployment: &Deployment) {
        self.spawn_reconcile(deployment, ReconcileScope::All);
    }

    /// Re-ingest the named sources of a deployment in the background.
    ///
    /// An empty list refreshes every source.
    pub fn trigger_refresh_sources(&self, deployment: &Deployment, sources: Vec<String>) {
        self.spawn_reconcile(deployment, ReconcileScope::Sources(sources));
    }

    fn spawn_reconcile(&self, deployment: &Deployment, scope: ReconcileScope) {
        let reconciler = self.reconciler.clone();
        let shutdown = self.shutdown.clone();
        let deployment = deployment.clone();
        let span = info_span!("reconcile", deployment_id = %deployment.id);

        self.tasks.spawn(
            async move {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        warn!("reconcile interrupted by shutdown");
                    }
                    result = reconciler.run(&deployment, scope) => {
                        match result {
                            Ok(outcome) => info!(?outcome, "reconcile finished"),
                            Err(e @ ControlError::ReconcileInProgress(_)) => info!("{e}"),
                            Err(e) => error!(error = %e, "reconcile failed"),
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Wait for background reconciles to finish.
    pub async fn wait_background(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Provision, wait for and record a new deployment of `project`.
    ///
    /// The deployment id doubles as the provision id. Infrastructure is
    /// released again if a later step fails.
    async fn create_deployment(&self, project: &Project) -> ControlResult<Deployment> {
        let provisioner = self.provisioners.get(&project.provisioner)?;
        let id = DeploymentId::generate();
        let opts = ProvisionOptions {
            provision_id: id.to_string(),
            runtime_version: self.config.runtime_version.clone(),
            olap_driver: project.prod_olap_driver.clone(),
            slots: project.prod_slots,
            annotations: project.annotations.clone(),
        };

        info!(
            deployment_id = %id,
            project_id = %project.id,
            provisioner = %project.provisioner,
            slots = project.prod_slots,
            "provisioning deployment"
        );
        let allocation = provisioner
            .provision(&opts)
            .await
            .map_err(|e| e.context("failed to provision deployment"))?;

        if let Err(e) = provisioner.await_ready(id.as_str()).await {
            let rollback = provisioner.deprovision(id.as_str()).await;
            return Err(e
                .context("deployment did not become ready")
                .compensated([rollback]));
        }

        let deployment = Deployment::pending(
            id,
            project,
            RuntimeEndpoint {
                host: allocation.host,
                instance_id: DeploymentId::generate().to_string(),
                audience: allocation.audience,
            },
        );

        if let Err(e) = self.store.insert_deployment(&deployment).await {
            let rollback = provisioner.deprovision(deployment.id.as_str()).await;
            return Err(e.compensated([rollback]));
        }

        info!(deployment_id = %deployment.id, host = %deployment.runtime.host, "deployment provisioned");
        Ok(deployment)
    }

    async fn update_deployment(
        &self,
        deployment: &Deployment,
        opts: &UpdateProjectOptions,
    ) -> ControlResult<()> {
        if let Some(version) = &opts.runtime_version {
            let provisioner = self.provisioners.get(&deployment.provisioner)?;
            provisioner
                .update(deployment.id.as_str(), version)
                .await
                .map_err(|e| e.context(format!("failed to update {}", deployment.id)))?;
            info!(deployment_id = %deployment.id, %version, "runtime version updated");
        }

        if deployment.branch != opts.prod_branch {
            self.store
                .update_deployment_branch(&deployment.id, &opts.prod_branch)
                .await?;
        }
        Ok(())
    }

    /// Release a deployment's infrastructure and delete its record.
    async fn teardown_deployment(&self, deployment: &Deployment) -> ControlResult<()> {
        let provisioner = self.provisioners.get(&deployment.provisioner)?;
        provisioner
            .deprovision(deployment.id.as_str())
            .await
            .map_err(|e| e.context(format!("failed to deprovision {}", deployment.id)))?;
        self.store.delete_deployment(&deployment.id).await?;
        info!(deployment_id = %deployment.id, "deployment torn down");
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provisioners", &self.provisioners)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
