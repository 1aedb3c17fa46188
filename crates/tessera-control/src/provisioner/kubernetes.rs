//! Templated Kubernetes provisioner.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};

use super::cluster::{ClusterApi, ClusterError, ResourceKind};
use super::probe::{await_reachable, ProbeConfig};
use super::templates::{checksum_of, TemplateData, Templates};
use super::{Allocation, ProvisionOptions, Provisioner, ResourceNames};

/// Interval between workload status polls in `await_ready`.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts of the read-modify-write in `update` before giving up.
const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Configuration of a Kubernetes provisioner.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesSpec {
    /// Public runtime URL; `*` is replaced by the provision id.
    pub host: String,

    /// Runtime image repository, without tag.
    pub image: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Upper bound for the workload to become ready, in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "default_api_server")]
    pub api_server: String,

    /// Bearer token file. Defaults to the mounted service account token.
    #[serde(default = "default_token_path")]
    pub token_path: Option<PathBuf>,

    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: Option<PathBuf>,

    /// Overrides for the bundled manifest templates.
    #[serde(default)]
    pub templates: TemplatePaths,

    #[serde(default)]
    pub probe: ProbeConfig,
}

fn default_namespace() -> String {
    "default".to_owned()
}

const fn default_timeout_seconds() -> u64 {
    600
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_owned()
}

#[allow(clippy::unnecessary_wraps)]
fn default_token_path() -> Option<PathBuf> {
    Some(PathBuf::from(
        "/var/run/secrets/kubernetes.io/serviceaccount/token",
    ))
}

#[allow(clippy::unnecessary_wraps)]
fn default_ca_cert_path() -> Option<PathBuf> {
    Some(PathBuf::from(
        "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
    ))
}

/// Paths to custom manifest templates.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplatePaths {
    pub deployment: Option<PathBuf>,
    pub service: Option<PathBuf>,
    pub http_ingress: Option<PathBuf>,
    pub grpc_ingress: Option<PathBuf>,
}

/// Rollout state read from a workload manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkloadStatus {
    generation: i64,
    observed_generation: i64,
    replicas: i64,
    ready_replicas: i64,
}

impl WorkloadStatus {
    fn from_manifest(manifest: &Value) -> Self {
        let int = |pointer: &str, default: i64| {
            manifest
                .pointer(pointer)
                .and_then(Value::as_i64)
                .unwrap_or(default)
        };
        Self {
            generation: int("/metadata/generation", 0),
            observed_generation: int("/status/observedGeneration", -1),
            replicas: int("/spec/replicas", 1),
            ready_replicas: int("/status/readyReplicas", 0),
        }
    }

    const fn is_ready(self) -> bool {
        self.observed_generation == self.generation && self.ready_replicas == self.replicas
    }
}

/// Provisioner creating one workload, service and two ingresses per runtime.
pub struct KubernetesProvisioner {
    spec: KubernetesSpec,
    cluster: Arc<dyn ClusterApi>,
    templates: Templates,
    http: reqwest::Client,
}

impl KubernetesProvisioner {
    /// Create a provisioner talking to `cluster`.
    pub fn new(spec: KubernetesSpec, cluster: Arc<dyn ClusterApi>) -> ControlResult<Self> {
        let templates = Templates::load(&spec.templates)?;
        Ok(Self {
            spec,
            cluster,
            templates,
            http: reqwest::Client::new(),
        })
    }

    /// Public URL of the runtime for a provision id.
    #[must_use]
    pub fn host_for(&self, provision_id: &str) -> String {
        self.spec.host.replace('*', provision_id)
    }

    /// Checksum stamped on every resource this provisioner creates.
    #[must_use]
    pub fn templates_checksum(&self) -> &str {
        self.templates.checksum()
    }

    async fn wait_for_rollout(&self, name: &str) {
        loop {
            match self.cluster.get(ResourceKind::Deployment, name).await {
                Ok(manifest) => {
                    let status = WorkloadStatus::from_manifest(&manifest);
                    if status.is_ready() {
                        return;
                    }
                    debug!(name, ?status, "runtime not ready yet");
                }
                Err(e) => debug!(name, error = %e, "failed to read runtime status"),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

impl std::fmt::Debug for KubernetesProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesProvisioner")
            .field("namespace", &self.spec.namespace)
            .field("host", &self.spec.host)
            .finish_non_exhaustive()
    }
}

fn set_image(manifest: &mut Value, repository: &str, image: &str) -> ControlResult<()> {
    let containers = manifest
        .pointer_mut("/spec/template/spec/containers")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| ControlError::provisioning("runtime workload has no containers"))?;

    let mut updated = false;
    for container in containers {
        let matches = container
            .get("image")
            .and_then(Value::as_str)
            .is_some_and(|current| {
                current.rsplit_once(':').map_or(current, |(repo, _)| repo) == repository
            });
        if matches {
            container["image"] = Value::String(image.to_owned());
            updated = true;
        }
    }

    if updated {
        Ok(())
    } else {
        Err(ControlError::provisioning(format!(
            "no container runs image {repository}"
        )))
    }
}

#[async_trait]
impl Provisioner for KubernetesProvisioner {
    fn kind(&self) -> &'static str {
        "kubernetes"
    }

    async fn provision(&self, opts: &ProvisionOptions) -> ControlResult<Allocation> {
        let id = opts.provision_id.as_str();

        // Clear out anything left by an earlier attempt with the same id.
        self.deprovision(id).await?;

        let host = self.host_for(id);
        let allocation = Allocation::for_slots(host.clone(), host, opts.slots);
        let data = TemplateData::new(&self.spec.image, opts, &allocation);
        let resources = self.templates.render(&data)?;

        info!(provision_id = id, slots = opts.slots, "provisioning runtime");

        for resource in &resources {
            if let Err(e) = self
                .cluster
                .apply(resource.kind, &resource.name, &resource.manifest)
                .await
            {
                warn!(provision_id = id, kind = %resource.kind, error = %e, "rolling back partial provision");
                let rollback = self.deprovision(id).await;
                return Err(ControlError::from(e).compensated([rollback]));
            }
        }

        Ok(allocation)
    }

    async fn deprovision(&self, provision_id: &str) -> ControlResult<()> {
        let names = ResourceNames::for_id(provision_id);
        let resources = [
            (ResourceKind::Ingress, &names.grpc_ingress),
            (ResourceKind::Ingress, &names.http_ingress),
            (ResourceKind::Service, &names.service),
            (ResourceKind::Deployment, &names.deployment),
        ];

        let mut errors = Vec::new();
        for (kind, name) in resources {
            match self.cluster.delete(kind, name).await {
                Ok(()) => debug!(%kind, name = %name, "deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => errors.push(ControlError::from(e)),
            }
        }
        ControlError::collect(errors)
    }

    async fn await_ready(&self, provision_id: &str) -> ControlResult<()> {
        let names = ResourceNames::for_id(provision_id);
        let timeout = Duration::from_secs(self.spec.timeout_seconds);

        tokio::time::timeout(timeout, self.wait_for_rollout(&names.deployment))
            .await
            .map_err(|_| {
                ControlError::provisioning(format!(
                    "runtime {} not ready after {}s",
                    names.deployment, self.spec.timeout_seconds
                ))
            })?;

        await_reachable(&self.http, &self.host_for(provision_id), &self.spec.probe).await
    }

    async fn update(&self, provision_id: &str, runtime_version: &str) -> ControlResult<()> {
        let name = ResourceNames::for_id(provision_id).deployment;
        let image = format!("{}:{runtime_version}", self.spec.image);

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut manifest = self.cluster.get(ResourceKind::Deployment, &name).await?;
            set_image(&mut manifest, &self.spec.image, &image)?;

            match self
                .cluster
                .replace(ResourceKind::Deployment, &name, &manifest)
                .await
            {
                Ok(()) => {
                    info!(provision_id, %image, "runtime image updated");
                    return Ok(());
                }
                Err(ClusterError::Conflict { .. }) => {
                    debug!(provision_id, attempt, "conflict updating runtime, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ControlError::provisioning(format!(
            "gave up updating {name} after {MAX_UPDATE_ATTEMPTS} conflicting writes"
        )))
    }

    async fn check_capacity(&self) -> ControlResult<()> {
        Ok(())
    }

    async fn validate_config(&self, provision_id: &str) -> ControlResult<bool> {
        let name = ResourceNames::for_id(provision_id).deployment;
        let manifest = self.cluster.get(ResourceKind::Deployment, &name).await?;
        Ok(checksum_of(&manifest) == Some(self.templates.checksum()))
    }
}
