//! Minimal Kubernetes API access for the runtime provisioner.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ControlError, ControlResult};

use super::KubernetesSpec;

/// Field manager recorded on server-side applies.
const FIELD_MANAGER: &str = "tessera-control";

/// Resource kinds the provisioner manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Deployment,
    Service,
    Ingress,
}

impl ResourceKind {
    fn collection_path(self, namespace: &str) -> String {
        match self {
            Self::Deployment => format!("/apis/apps/v1/namespaces/{namespace}/deployments"),
            Self::Service => format!("/api/v1/namespaces/{namespace}/services"),
            Self::Ingress => {
                format!("/apis/networking.k8s.io/v1/namespaces/{namespace}/ingresses")
            }
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::Ingress => "ingress",
        };
        f.write_str(name)
    }
}

/// Errors returned by the Kubernetes API.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("conflicting update to {kind} {name}")]
    Conflict { kind: ResourceKind, name: String },

    #[error("kubernetes API returned {status} for {kind} {name}: {message}")]
    Api {
        kind: ResourceKind,
        name: String,
        status: u16,
        message: String,
    },

    #[error("kubernetes transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ClusterError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Operations the provisioner needs from a cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create or overwrite a resource.
    async fn apply(&self, kind: ResourceKind, name: &str, manifest: &Value)
        -> Result<(), ClusterError>;

    /// Delete a resource and everything it owns.
    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError>;

    /// Read a resource, including its status.
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Value, ClusterError>;

    /// Replace a resource previously read with [`ClusterApi::get`].
    ///
    /// Fails with [`ClusterError::Conflict`] when the resource changed since.
    async fn replace(&self, kind: ResourceKind, name: &str, manifest: &Value)
        -> Result<(), ClusterError>;
}

/// [`ClusterApi`] over the Kubernetes REST API.
#[derive(Debug, Clone)]
pub struct KubeHttpClient {
    client: reqwest::Client,
    api_server: String,
    namespace: String,
    token: Option<String>,
}

impl KubeHttpClient {
    /// Connect using the service account mounted into the pod.
    pub fn from_spec(spec: &KubernetesSpec) -> ControlResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));

        if let Some(path) = &spec.ca_cert_path {
            if path.exists() {
                let pem = std::fs::read(path).map_err(|e| {
                    ControlError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem)?;
                builder = builder.add_root_certificate(cert);
            }
        }

        let token = match &spec.token_path {
            Some(path) if path.exists() => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| {
                        ControlError::Config(format!("failed to read {}: {e}", path.display()))
                    })?
                    .trim()
                    .to_owned(),
            ),
            _ => None,
        };

        Ok(Self {
            client: builder.build()?,
            api_server: spec.api_server.trim_end_matches('/').to_owned(),
            namespace: spec.namespace.clone(),
            token,
        })
    }

    fn url(&self, kind: ResourceKind, name: &str) -> String {
        format!(
            "{}{}/{name}",
            self.api_server,
            kind.collection_path(&self.namespace)
        )
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }
}

async fn check(response: Response, kind: ResourceKind, name: &str) -> Result<Response, ClusterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let name = name.to_owned();
    match status {
        StatusCode::NOT_FOUND => Err(ClusterError::NotFound { kind, name }),
        StatusCode::CONFLICT => Err(ClusterError::Conflict { kind, name }),
        _ => {
            let message = response.text().await.unwrap_or_default();
            Err(ClusterError::Api {
                kind,
                name,
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl ClusterApi for KubeHttpClient {
    async fn apply(
        &self,
        kind: ResourceKind,
        name: &str,
        manifest: &Value,
    ) -> Result<(), ClusterError> {
        debug!(%kind, name, "applying resource");
        let url = format!(
            "{}?fieldManager={FIELD_MANAGER}&force=true",
            self.url(kind, name)
        );
        // JSON is valid YAML, so the manifest is sent as an apply patch as-is.
        let response = self
            .request(reqwest::Method::PATCH, url)
            .header(CONTENT_TYPE, "application/apply-patch+yaml")
            .body(manifest.to_string())
            .send()
            .await?;
        check(response, kind, name).await?;
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        debug!(%kind, name, "deleting resource");
        let response = self
            .request(reqwest::Method::DELETE, self.url(kind, name))
            .json(&json!({ "propagationPolicy": "Foreground" }))
            .send()
            .await?;
        check(response, kind, name).await?;
        Ok(())
    }

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Value, ClusterError> {
        let response = self
            .request(reqwest::Method::GET, self.url(kind, name))
            .send()
            .await?;
        Ok(check(response, kind, name).await?.json().await?)
    }

    async fn replace(
        &self,
        kind: ResourceKind,
        name: &str,
        manifest: &Value,
    ) -> Result<(), ClusterError> {
        let response = self
            .request(reqwest::Method::PUT, self.url(kind, name))
            .json(manifest)
            .send()
            .await?;
        check(response, kind, name).await?;
        Ok(())
    }
}
