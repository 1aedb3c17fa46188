//! Fakes for the orchestrator's collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tessera_control::error::{ControlError, ControlResult};
use tessera_control::runtime::{
    CatalogEntry, CatalogObjectType, ReconcileRequest, ReconcileResponse, RuntimeClient,
    RuntimeClientFactory,
};
use tessera_control::store::{MemoryStore, ProjectCursor, Store};
use tessera_control::types::{
    Deployment, DeploymentId, DeploymentStatus, Organization, OrganizationId, Project, ProjectId,
    ProjectMember, UpdateProjectOptions,
};
use tessera_control::{Allocation, ProvisionOptions, Provisioner};

/// A call made to a [`RecordingProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Provision { id: String, slots: u32 },
    AwaitReady(String),
    Deprovision(String),
    Update { id: String, version: String },
    CheckCapacity,
    Validate(String),
}

/// Provisioner that records every call and fails on request.
#[derive(Debug, Default)]
pub struct RecordingProvisioner {
    calls: Mutex<Vec<Call>>,
    allocations: Mutex<Vec<Allocation>>,
    pub fail_provision: AtomicBool,
    pub fail_await_ready: AtomicBool,
    pub fail_capacity: AtomicBool,
    pub fail_update: AtomicBool,
    /// Provision ids whose deprovision fails.
    fail_deprovision: Mutex<HashSet<String>>,
    /// Provision ids reported as drifted by `validate_config`.
    drifted: Mutex<HashSet<String>>,
}

impl RecordingProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    pub fn allocations(&self) -> Vec<Allocation> {
        self.allocations.lock().expect("lock poisoned").clone()
    }

    pub fn deprovisioned(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Deprovision(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Provision { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn fail_deprovision_of(&self, id: &DeploymentId) {
        self.fail_deprovision
            .lock()
            .expect("lock poisoned")
            .insert(id.to_string());
    }

    pub fn mark_drifted(&self, id: &DeploymentId) {
        self.drifted
            .lock()
            .expect("lock poisoned")
            .insert(id.to_string());
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("lock poisoned").push(call);
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    fn kind(&self) -> &'static str {
        "recording"
    }

    async fn provision(&self, opts: &ProvisionOptions) -> ControlResult<Allocation> {
        self.record(Call::Provision {
            id: opts.provision_id.clone(),
            slots: opts.slots,
        });
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(ControlError::provisioning("provision refused"));
        }
        let allocation = Allocation::for_slots(
            format!("http://{}.runtime.test", opts.provision_id),
            "runtime.test",
            opts.slots,
        );
        self.allocations
            .lock()
            .expect("lock poisoned")
            .push(allocation.clone());
        Ok(allocation)
    }

    async fn deprovision(&self, provision_id: &str) -> ControlResult<()> {
        self.record(Call::Deprovision(provision_id.to_owned()));
        if self
            .fail_deprovision
            .lock()
            .expect("lock poisoned")
            .contains(provision_id)
        {
            return Err(ControlError::provisioning(format!(
                "deprovision of {provision_id} refused"
            )));
        }
        Ok(())
    }

    async fn await_ready(&self, provision_id: &str) -> ControlResult<()> {
        self.record(Call::AwaitReady(provision_id.to_owned()));
        if self.fail_await_ready.load(Ordering::SeqCst) {
            return Err(ControlError::provisioning("runtime never became ready"));
        }
        Ok(())
    }

    async fn update(&self, provision_id: &str, runtime_version: &str) -> ControlResult<()> {
        self.record(Call::Update {
            id: provision_id.to_owned(),
            version: runtime_version.to_owned(),
        });
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(ControlError::provisioning("update refused"));
        }
        Ok(())
    }

    async fn check_capacity(&self) -> ControlResult<()> {
        self.record(Call::CheckCapacity);
        if self.fail_capacity.load(Ordering::SeqCst) {
            return Err(ControlError::provisioning("no capacity left"));
        }
        Ok(())
    }

    async fn validate_config(&self, provision_id: &str) -> ControlResult<bool> {
        self.record(Call::Validate(provision_id.to_owned()));
        Ok(!self
            .drifted
            .lock()
            .expect("lock poisoned")
            .contains(provision_id))
    }
}

/// Store operations that [`FailingStore`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreateProject,
    SwapProd,
    DeleteProject,
    UpdateProject,
    InsertDeployment,
    UpdateDeployment,
    DeleteDeployment,
}

/// [`MemoryStore`] wrapper that fails selected operations.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: Mutex<HashSet<Op>>,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail(&self, op: Op) {
        self.failing.lock().expect("lock poisoned").insert(op);
    }

    pub fn heal(&self, op: Op) {
        self.failing.lock().expect("lock poisoned").remove(&op);
    }

    fn check(&self, op: Op) -> ControlResult<()> {
        if self.failing.lock().expect("lock poisoned").contains(&op) {
            return Err(ControlError::internal(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn insert_organization(&self, org: &Organization) -> ControlResult<()> {
        self.inner.insert_organization(org).await
    }

    async fn find_organization(&self, id: &OrganizationId) -> ControlResult<Organization> {
        self.inner.find_organization(id).await
    }

    async fn delete_organization(&self, id: &OrganizationId) -> ControlResult<()> {
        self.inner.delete_organization(id).await
    }

    async fn create_project(
        &self,
        project: &Project,
        members: &[ProjectMember],
    ) -> ControlResult<()> {
        self.check(Op::CreateProject)?;
        self.inner.create_project(project, members).await
    }

    async fn find_project(&self, id: &ProjectId) -> ControlResult<Project> {
        self.inner.find_project(id).await
    }

    async fn list_projects(
        &self,
        after: Option<&ProjectCursor>,
        limit: u32,
    ) -> ControlResult<Vec<Project>> {
        self.inner.list_projects(after, limit).await
    }

    async fn update_project(
        &self,
        id: &ProjectId,
        opts: &UpdateProjectOptions,
    ) -> ControlResult<Project> {
        self.check(Op::UpdateProject)?;
        self.inner.update_project(id, opts).await
    }

    async fn find_projects_for_organization(
        &self,
        org: &OrganizationId,
    ) -> ControlResult<Vec<Project>> {
        self.inner.find_projects_for_organization(org).await
    }

    async fn find_project_members(&self, id: &ProjectId) -> ControlResult<Vec<ProjectMember>> {
        self.inner.find_project_members(id).await
    }

    async fn swap_prod_deployment(
        &self,
        project: &ProjectId,
        expected: Option<&DeploymentId>,
        new: Option<&DeploymentId>,
    ) -> ControlResult<Project> {
        self.check(Op::SwapProd)?;
        self.inner.swap_prod_deployment(project, expected, new).await
    }

    async fn delete_project(&self, id: &ProjectId) -> ControlResult<()> {
        self.check(Op::DeleteProject)?;
        self.inner.delete_project(id).await
    }

    async fn insert_deployment(&self, deployment: &Deployment) -> ControlResult<()> {
        self.check(Op::InsertDeployment)?;
        self.inner.insert_deployment(deployment).await
    }

    async fn find_deployment(&self, id: &DeploymentId) -> ControlResult<Deployment> {
        self.inner.find_deployment(id).await
    }

    async fn find_deployments_for_project(
        &self,
        id: &ProjectId,
    ) -> ControlResult<Vec<Deployment>> {
        self.inner.find_deployments_for_project(id).await
    }

    async fn update_deployment_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        logs: &str,
    ) -> ControlResult<Deployment> {
        self.inner.update_deployment_status(id, status, logs).await
    }

    async fn update_deployment_branch(
        &self,
        id: &DeploymentId,
        branch: &str,
    ) -> ControlResult<Deployment> {
        self.check(Op::UpdateDeployment)?;
        self.inner.update_deployment_branch(id, branch).await
    }

    async fn mark_deployment_used(&self, id: &DeploymentId) -> ControlResult<Deployment> {
        self.inner.mark_deployment_used(id).await
    }

    async fn try_start_reconcile(
        &self,
        id: &DeploymentId,
        stale_after: Duration,
    ) -> ControlResult<Option<Deployment>> {
        self.inner.try_start_reconcile(id, stale_after).await
    }

    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()> {
        self.check(Op::DeleteDeployment)?;
        self.inner.delete_deployment(id).await
    }

    async fn runtime_slots_used(&self) -> ControlResult<HashMap<String, u32>> {
        self.inner.runtime_slots_used().await
    }
}

/// How the next reconcile call answers.
#[derive(Debug, Clone)]
pub enum Reply {
    Response(ReconcileResponse),
    TransportError(String),
}

#[derive(Debug, Default)]
struct RuntimeState {
    replies: VecDeque<Reply>,
    requests: Vec<ReconcileRequest>,
    catalog: Vec<CatalogEntry>,
    catalog_error: Option<String>,
    unreachable: HashSet<String>,
    pings: Vec<String>,
    held: Option<Arc<Notify>>,
}

/// Runtime factory whose clients answer from a script.
///
/// Reconciles without a scripted reply succeed with an empty response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRuntime {
    state: Arc<Mutex<RuntimeState>>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_reply(&self, reply: Reply) {
        self.lock().replies.push_back(reply);
    }

    pub fn set_catalog(&self, entries: Vec<CatalogEntry>) {
        self.lock().catalog = entries;
    }

    pub fn fail_catalog(&self, message: &str) {
        self.lock().catalog_error = Some(message.to_owned());
    }

    pub fn mark_unreachable(&self, host: &str) {
        self.lock().unreachable.insert(host.to_owned());
    }

    /// Make reconciles wait after recording their request until the
    /// returned gate is notified once per held call.
    pub fn hold_reconciles(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().held = Some(Arc::clone(&gate));
        gate
    }

    pub fn requests(&self) -> Vec<ReconcileRequest> {
        self.lock().requests.clone()
    }

    pub fn pings(&self) -> Vec<String> {
        self.lock().pings.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl RuntimeClientFactory for ScriptedRuntime {
    async fn open(&self, deployment: &Deployment) -> ControlResult<Box<dyn RuntimeClient>> {
        Ok(Box::new(ScriptedClient {
            runtime: self.clone(),
            host: deployment.runtime.host.clone(),
        }))
    }
}

struct ScriptedClient {
    runtime: ScriptedRuntime,
    host: String,
}

#[async_trait]
impl RuntimeClient for ScriptedClient {
    async fn reconcile(&self, request: ReconcileRequest) -> ControlResult<ReconcileResponse> {
        let (reply, held) = {
            let mut state = self.runtime.lock();
            state.requests.push(request);
            (state.replies.pop_front(), state.held.clone())
        };
        if let Some(gate) = held {
            gate.notified().await;
        }
        match reply {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::TransportError(message)) => Err(ControlError::runtime(message)),
            None => Ok(ReconcileResponse::default()),
        }
    }

    async fn list_catalog_entries(
        &self,
        _instance_id: &str,
        kind: Option<CatalogObjectType>,
    ) -> ControlResult<Vec<CatalogEntry>> {
        let state = self.runtime.lock();
        if let Some(message) = &state.catalog_error {
            return Err(ControlError::runtime(message.clone()));
        }
        Ok(state
            .catalog
            .iter()
            .filter(|entry| kind.map_or(true, |kind| entry.kind == kind))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> ControlResult<()> {
        let mut state = self.runtime.lock();
        state.pings.push(self.host.clone());
        if state.unreachable.contains(&self.host) {
            return Err(ControlError::runtime(format!("{} unreachable", self.host)));
        }
        Ok(())
    }
}
