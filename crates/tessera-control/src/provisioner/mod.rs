//! Runtime provisioners.
//!
//! A provisioner allocates and deallocates the infrastructure serving one
//! deployment. Two implementations exist: a templated Kubernetes provisioner
//! and a static provisioner handing out slots on a fixed pool of runtimes.
//! Projects select a provisioner by name from the configured
//! [`ProvisionerSet`].

mod cluster;
mod kubernetes;
mod probe;
mod static_pool;
mod templates;

pub use cluster::{ClusterApi, ClusterError, KubeHttpClient, ResourceKind};
pub use kubernetes::{KubernetesProvisioner, KubernetesSpec, TemplatePaths};
pub use probe::{await_reachable, ProbeConfig, HEALTH_PATH};
pub use static_pool::{StaticProvisioner, StaticRuntime, StaticSpec};
pub use templates::{TemplateData, Templates};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};
use crate::store::Store;

/// Bytes of storage granted per slot.
const STORAGE_BYTES_PER_SLOT: u64 = 40_000_000_000;

/// Input to [`Provisioner::provision`].
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    /// Identifier all created resources are derived from.
    pub provision_id: String,
    /// Runtime image tag.
    pub runtime_version: String,
    pub olap_driver: String,
    pub slots: u32,
    pub annotations: BTreeMap<String, String>,
}

/// Resources granted to a deployment.
///
/// Copied into the deployment record; never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    /// Base URL of the runtime.
    pub host: String,
    /// Audience for tokens presented to the runtime.
    pub audience: String,
    pub cpu: u32,
    pub memory_gb: u32,
    pub storage_bytes: u64,
}

impl Allocation {
    /// Size an allocation for the requested number of slots.
    #[must_use]
    pub fn for_slots(host: impl Into<String>, audience: impl Into<String>, slots: u32) -> Self {
        Self {
            host: host.into(),
            audience: audience.into(),
            cpu: slots,
            memory_gb: slots.saturating_mul(2),
            storage_bytes: u64::from(slots).saturating_mul(STORAGE_BYTES_PER_SLOT),
        }
    }
}

/// Deterministic names of the resources created for one provision id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceNames {
    /// Compute workload.
    pub deployment: String,
    pub service: String,
    pub http_ingress: String,
    pub grpc_ingress: String,
}

impl ResourceNames {
    /// Derive resource names from a provision id.
    #[must_use]
    pub fn for_id(provision_id: &str) -> Self {
        Self {
            deployment: format!("runtime-{provision_id}"),
            service: format!("runtime-{provision_id}"),
            http_ingress: format!("http-runtime-{provision_id}"),
            grpc_ingress: format!("grpc-runtime-{provision_id}"),
        }
    }
}

/// Trait for runtime provisioning implementations.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Short name of the implementation, used in logs.
    fn kind(&self) -> &'static str;

    /// Allocate infrastructure for `opts.provision_id`.
    ///
    /// Idempotent: anything left over from an earlier attempt with the same
    /// id is removed first. On failure, everything created is rolled back.
    async fn provision(&self, opts: &ProvisionOptions) -> ControlResult<Allocation>;

    /// Remove all infrastructure for a provision id. Missing resources are
    /// not an error.
    async fn deprovision(&self, provision_id: &str) -> ControlResult<()>;

    /// Wait until the runtime is scheduled and answers health probes.
    async fn await_ready(&self, provision_id: &str) -> ControlResult<()>;

    /// Roll the runtime to a different image version.
    async fn update(&self, provision_id: &str, runtime_version: &str) -> ControlResult<()>;

    /// Fail when the backend is out of headroom.
    async fn check_capacity(&self) -> ControlResult<()>;

    /// Whether the running resources still match the current configuration.
    async fn validate_config(&self, provision_id: &str) -> ControlResult<bool>;
}

/// Configuration of one named provisioner.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "spec", rename_all = "snake_case")]
pub enum ProvisionerSpec {
    Kubernetes(KubernetesSpec),
    Static(StaticSpec),
}

/// The provisioners available to projects, keyed by name.
#[derive(Clone, Default)]
pub struct ProvisionerSet {
    provisioners: HashMap<String, Arc<dyn Provisioner>>,
}

impl ProvisionerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provisioner.
    ///
    /// The static provisioner reads slot usage from `store`.
    pub fn from_specs(
        specs: &HashMap<String, ProvisionerSpec>,
        store: &Arc<dyn Store>,
    ) -> ControlResult<Self> {
        let mut set = Self::new();
        for (name, spec) in specs {
            let provisioner: Arc<dyn Provisioner> = match spec {
                ProvisionerSpec::Kubernetes(spec) => {
                    let cluster = KubeHttpClient::from_spec(spec)?;
                    Arc::new(KubernetesProvisioner::new(spec.clone(), Arc::new(cluster))?)
                }
                ProvisionerSpec::Static(spec) => {
                    Arc::new(StaticProvisioner::new(spec.clone(), Arc::clone(store))?)
                }
            };
            set.insert(name.clone(), provisioner);
        }
        Ok(set)
    }

    /// Register a provisioner under a name, replacing any previous one.
    pub fn insert(&mut self, name: impl Into<String>, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.insert(name.into(), provisioner);
    }

    /// Look up a provisioner by name.
    pub fn get(&self, name: &str) -> ControlResult<&Arc<dyn Provisioner>> {
        self.provisioners
            .get(name)
            .ok_or_else(|| ControlError::ProvisionerNotFound(name.to_owned()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.provisioners.contains_key(name)
    }

    /// Iterate over `(name, provisioner)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Provisioner>)> {
        self.provisioners.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.provisioners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.provisioners.is_empty()
    }
}

impl std::fmt::Debug for ProvisionerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.provisioners.keys().collect();
        names.sort();
        f.debug_struct("ProvisionerSet")
            .field("provisioners", &names)
            .finish()
    }
}
