//! Common test utilities for control plane integration tests.

#![allow(dead_code)]

pub mod fakes;

use std::sync::Arc;

use tessera_control::config::OrchestratorConfig;
use tessera_control::store::Store;
use tessera_control::types::{CreateProjectOptions, Organization, UserId, UsergroupId};
use tessera_control::{Orchestrator, Project, ProvisionerSet};
use tokio_util::sync::CancellationToken;

use fakes::{FailingStore, RecordingProvisioner, ScriptedRuntime};

/// Name the recording provisioner is registered under.
pub const PROVISIONER: &str = "default";

/// Orchestrator wired to fakes.
pub struct TestControl {
    pub store: Arc<FailingStore>,
    pub provisioner: Arc<RecordingProvisioner>,
    pub runtime: Arc<ScriptedRuntime>,
    pub shutdown: CancellationToken,
    pub orchestrator: Arc<Orchestrator>,
    pub org: Organization,
    pub creator: UserId,
}

impl TestControl {
    pub async fn new() -> Self {
        let store = FailingStore::new();
        let provisioner = RecordingProvisioner::new();
        let runtime = ScriptedRuntime::new();
        let shutdown = CancellationToken::new();

        let mut provisioners = ProvisionerSet::new();
        provisioners.insert(PROVISIONER, provisioner.clone());

        let store_dyn: Arc<dyn Store> = store.clone();
        let orchestrator = Arc::new(Orchestrator::new(
            store_dyn,
            provisioners,
            runtime.clone(),
            OrchestratorConfig::default(),
            shutdown.clone(),
        ));

        let org = Organization::new("acme", Some(UsergroupId::new("acme-all")));
        store
            .insert_organization(&org)
            .await
            .expect("insert organization failed");

        Self {
            store,
            provisioner,
            runtime,
            shutdown,
            orchestrator,
            org,
            creator: UserId::new("user-1"),
        }
    }

    /// Create a project and wait for its first reconcile.
    pub async fn project(&self, name: &str, slots: u32) -> Project {
        let project = self
            .orchestrator
            .create_project(&self.org, &self.creator, options(name, slots))
            .await
            .expect("create project failed");
        self.orchestrator.wait_background().await;
        project
    }
}

pub fn options(name: &str, slots: u32) -> CreateProjectOptions {
    CreateProjectOptions {
        name: name.to_owned(),
        prod_branch: "main".to_owned(),
        prod_slots: slots,
        prod_olap_driver: "duckdb".to_owned(),
        ..CreateProjectOptions::default()
    }
}
