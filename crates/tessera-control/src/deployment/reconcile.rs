//! Driving a deployment through one reconcile.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::runtime::{
    CatalogEntry, CatalogObjectType, ReconcileRequest, ReconcileResponse, RuntimeClientFactory,
};
use crate::store::Store;
use crate::types::{Deployment, DeploymentStatus};

/// What a reconcile covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileScope {
    /// Every project file.
    All,
    /// Re-ingest the named sources. An empty list means every source.
    Sources(Vec<String>),
}

/// How a reconcile that reached the runtime ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Recorded as `Ok`.
    Succeeded,
    /// The runtime reported errors; recorded as `Error` with the response.
    Failed { errors: usize },
}

/// Claims a deployment, calls the runtime and records the result.
///
/// Cheap to clone; reconciles run on spawned tasks.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    runtime: Arc<dyn RuntimeClientFactory>,
    stale_after: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn RuntimeClientFactory>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            stale_after,
        }
    }

    /// Run one reconcile of `deployment`.
    ///
    /// Fails with [`ControlError::ReconcileInProgress`] without touching the
    /// deployment when another reconcile holds it. Transport failures are
    /// recorded on the deployment and returned.
    pub async fn run(
        &self,
        deployment: &Deployment,
        scope: ReconcileScope,
    ) -> ControlResult<ReconcileOutcome> {
        let claimed = self
            .store
            .try_start_reconcile(&deployment.id, self.stale_after)
            .await
            .map_err(|e| e.context("could not update deployment status"))?
            .ok_or_else(|| ControlError::ReconcileInProgress(deployment.id.clone()))?;

        let result = self.call_runtime(&claimed, scope).await;
        self.finish(&claimed, result).await
    }

    async fn call_runtime(
        &self,
        deployment: &Deployment,
        scope: ReconcileScope,
    ) -> ControlResult<Option<ReconcileResponse>> {
        let client = self.runtime.open(deployment).await?;
        let instance_id = deployment.runtime.instance_id.clone();

        let request = match scope {
            ReconcileScope::All => ReconcileRequest::full(instance_id),
            ReconcileScope::Sources(names) => {
                let entries = client
                    .list_catalog_entries(&instance_id, Some(CatalogObjectType::Source))
                    .await?;
                let paths = source_paths(&entries, &names);
                if paths.is_empty() {
                    debug!(deployment_id = %deployment.id, "no matching sources to refresh");
                    return Ok(None);
                }
                ReconcileRequest::refresh(instance_id, paths)
            }
        };

        client.reconcile(request).await.map(Some)
    }

    async fn finish(
        &self,
        deployment: &Deployment,
        result: ControlResult<Option<ReconcileResponse>>,
    ) -> ControlResult<ReconcileOutcome> {
        let id = &deployment.id;
        match result {
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "reconcile failed");
                counter!("tessera.deployments.reconciles", "outcome" => "transport_error")
                    .increment(1);
                let recorded = self
                    .store
                    .update_deployment_status(id, DeploymentStatus::Error, &e.to_string())
                    .await
                    .map(|_| ());
                Err(e.compensated([recorded]))
            }
            Ok(Some(response)) if !response.errors.is_empty() => {
                let errors = response.errors.len();
                info!(deployment_id = %id, errors, "reconcile reported errors");
                counter!("tessera.deployments.reconciles", "outcome" => "failed").increment(1);
                let logs = serde_json::to_string(&response).map_err(|e| {
                    ControlError::Serialisation(format!("failed to serialise reconcile response: {e}"))
                })?;
                self.store
                    .update_deployment_status(id, DeploymentStatus::Error, &logs)
                    .await?;
                Ok(ReconcileOutcome::Failed { errors })
            }
            Ok(_) => {
                info!(deployment_id = %id, "reconcile succeeded");
                counter!("tessera.deployments.reconciles", "outcome" => "ok").increment(1);
                self.store
                    .update_deployment_status(id, DeploymentStatus::Ok, "")
                    .await?;
                Ok(ReconcileOutcome::Succeeded)
            }
        }
    }
}

/// Paths of the catalog entries named in `names`, or of every entry when
/// `names` is empty.
fn source_paths(entries: &[CatalogEntry], names: &[String]) -> Vec<String> {
    let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
    entries
        .iter()
        .filter(|entry| wanted.is_empty() || wanted.contains(entry.name.as_str()))
        .map(|entry| entry.path.clone())
        .collect()
}
