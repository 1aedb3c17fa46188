//! HTTP implementation of the runtime client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::RuntimeConfig;
use crate::error::{ControlError, ControlResult};
use crate::provisioner::HEALTH_PATH;
use crate::types::Deployment;

use super::{
    CatalogEntry, CatalogObjectType, ReconcileRequest, ReconcileResponse, RuntimeClient,
    RuntimeClientFactory,
};

/// HTTP client for one runtime.
#[derive(Debug, Clone)]
pub struct HttpRuntimeClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    entries: Vec<CatalogEntry>,
}

impl HttpRuntimeClient {
    /// Create a client for a runtime base URL.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    async fn check(response: reqwest::Response) -> ControlResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ControlError::runtime(format!("runtime returned {status}: {body}")))
    }
}

#[async_trait]
impl RuntimeClient for HttpRuntimeClient {
    async fn reconcile(&self, request: ReconcileRequest) -> ControlResult<ReconcileResponse> {
        let url = format!(
            "{}/v1/instances/{}/reconcile",
            self.base_url, request.instance_id
        );
        let response = self.client.post(url).json(&request).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_catalog_entries(
        &self,
        instance_id: &str,
        kind: Option<CatalogObjectType>,
    ) -> ControlResult<Vec<CatalogEntry>> {
        let url = format!("{}/v1/instances/{instance_id}/catalog", self.base_url);
        let mut request = self.client.get(url);
        if let Some(kind) = kind {
            request = request.query(&[("type", kind.as_str())]);
        }
        let response = request.send().await?;
        let catalog: CatalogResponse = Self::check(response).await?.json().await?;
        Ok(catalog.entries)
    }

    async fn ping(&self) -> ControlResult<()> {
        let response = self
            .client
            .get(format!("{}{HEALTH_PATH}", self.base_url))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Opens [`HttpRuntimeClient`]s sharing one connection pool.
#[derive(Debug, Clone)]
pub struct HttpRuntimeClientFactory {
    client: reqwest::Client,
}

impl HttpRuntimeClientFactory {
    /// Create a factory from configuration.
    pub fn new(config: &RuntimeConfig) -> ControlResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RuntimeClientFactory for HttpRuntimeClientFactory {
    async fn open(&self, deployment: &Deployment) -> ControlResult<Box<dyn RuntimeClient>> {
        Ok(Box::new(HttpRuntimeClient::new(
            self.client.clone(),
            deployment.runtime.host.clone(),
        )))
    }
}
