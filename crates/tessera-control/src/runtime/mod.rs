//! Client side of the runtime service.
//!
//! The orchestrator opens a [`RuntimeClient`] per deployment to drive
//! reconciles and read catalog state.

mod http;

pub use http::{HttpRuntimeClient, HttpRuntimeClientFactory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ControlResult;
use crate::types::Deployment;

/// Request to reconcile an instance's project files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub instance_id: String,
    /// Paths known to have changed. Empty means everything.
    pub changed_paths: Vec<String>,
    /// Paths to re-run even when unchanged.
    pub forced_paths: Vec<String>,
    pub dry: bool,
    pub strict: bool,
}

impl ReconcileRequest {
    /// Reconcile everything.
    #[must_use]
    pub fn full(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    /// Re-ingest the given paths strictly.
    #[must_use]
    pub fn refresh(instance_id: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            changed_paths: paths.clone(),
            forced_paths: paths,
            dry: false,
            strict: true,
        }
    }
}

/// A single problem reported by a reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileError {
    #[serde(default)]
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub file_path: String,
}

/// Outcome of a reconcile call that reached the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    #[serde(default)]
    pub errors: Vec<ReconcileError>,
    #[serde(default)]
    pub affected_paths: Vec<String>,
}

/// Kinds of catalog objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogObjectType {
    Source,
    Model,
    MetricsView,
    #[serde(other)]
    Unspecified,
}

impl CatalogObjectType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Model => "model",
            Self::MetricsView => "metrics_view",
            Self::Unspecified => "unspecified",
        }
    }
}

/// An object in an instance's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: CatalogObjectType,
}

/// Connection to the runtime serving one deployment.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn reconcile(&self, request: ReconcileRequest) -> ControlResult<ReconcileResponse>;

    async fn list_catalog_entries(
        &self,
        instance_id: &str,
        kind: Option<CatalogObjectType>,
    ) -> ControlResult<Vec<CatalogEntry>>;

    /// Cheap liveness check.
    async fn ping(&self) -> ControlResult<()>;
}

/// Opens runtime clients for deployments.
#[async_trait]
pub trait RuntimeClientFactory: Send + Sync {
    async fn open(&self, deployment: &Deployment) -> ControlResult<Box<dyn RuntimeClient>>;
}
