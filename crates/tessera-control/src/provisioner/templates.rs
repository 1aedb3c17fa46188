//! Manifest templates for the Kubernetes provisioner.

use std::collections::BTreeMap;
use std::path::Path;

use minijinja::Environment;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{ControlError, ControlResult};

use super::cluster::ResourceKind;
use super::kubernetes::TemplatePaths;
use super::{Allocation, ProvisionOptions, ResourceNames};

/// Annotation carrying the checksum of the templates a resource was rendered from.
pub const CHECKSUM_ANNOTATION: &str = "checksum/templates";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

const DEFAULT_DEPLOYMENT: &str = include_str!("../../templates/deployment.yaml");
const DEFAULT_SERVICE: &str = include_str!("../../templates/service.yaml");
const DEFAULT_HTTP_INGRESS: &str = include_str!("../../templates/http_ingress.yaml");
const DEFAULT_GRPC_INGRESS: &str = include_str!("../../templates/grpc_ingress.yaml");

/// Creation order. Deletion runs in reverse.
const RESOURCES: [(&str, ResourceKind); 4] = [
    ("deployment", ResourceKind::Deployment),
    ("service", ResourceKind::Service),
    ("http_ingress", ResourceKind::Ingress),
    ("grpc_ingress", ResourceKind::Ingress),
];

/// Values available to every template.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateData {
    pub provision_id: String,
    pub image: String,
    pub image_tag: String,
    /// Public base URL of the runtime.
    pub host: String,
    /// `host` without scheme, for ingress rules.
    pub ingress_host: String,
    pub olap_driver: String,
    pub cpu: u32,
    pub memory_gb: u32,
    pub storage_bytes: u64,
    pub names: ResourceNames,
    pub annotations: BTreeMap<String, String>,
}

impl TemplateData {
    /// Assemble template values for one provision request.
    #[must_use]
    pub fn new(image: &str, opts: &ProvisionOptions, allocation: &Allocation) -> Self {
        let ingress_host = allocation
            .host
            .split_once("://")
            .map_or(allocation.host.as_str(), |(_, rest)| rest)
            .trim_end_matches('/')
            .to_owned();

        Self {
            provision_id: opts.provision_id.clone(),
            image: image.to_owned(),
            image_tag: opts.runtime_version.clone(),
            host: allocation.host.clone(),
            ingress_host,
            olap_driver: opts.olap_driver.clone(),
            cpu: allocation.cpu,
            memory_gb: allocation.memory_gb,
            storage_bytes: allocation.storage_bytes,
            names: ResourceNames::for_id(&opts.provision_id),
            annotations: opts.annotations.clone(),
        }
    }
}

/// A manifest ready to be sent to the cluster.
#[derive(Debug, Clone)]
pub struct RenderedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub manifest: Value,
}

/// The compiled set of manifest templates.
pub struct Templates {
    env: Environment<'static>,
    checksum: String,
}

impl Templates {
    /// Templates bundled with the crate.
    pub fn builtin() -> ControlResult<Self> {
        Self::from_sources([
            DEFAULT_DEPLOYMENT.to_owned(),
            DEFAULT_SERVICE.to_owned(),
            DEFAULT_HTTP_INGRESS.to_owned(),
            DEFAULT_GRPC_INGRESS.to_owned(),
        ])
    }

    /// Load templates from disk, falling back to the bundled ones.
    pub fn load(paths: &TemplatePaths) -> ControlResult<Self> {
        Self::from_sources([
            read_or(paths.deployment.as_deref(), DEFAULT_DEPLOYMENT)?,
            read_or(paths.service.as_deref(), DEFAULT_SERVICE)?,
            read_or(paths.http_ingress.as_deref(), DEFAULT_HTTP_INGRESS)?,
            read_or(paths.grpc_ingress.as_deref(), DEFAULT_GRPC_INGRESS)?,
        ])
    }

    /// Compile templates given in creation order.
    pub fn from_sources(sources: [String; 4]) -> ControlResult<Self> {
        let mut hasher = Sha256::new();
        let mut env = Environment::new();
        for ((name, _), source) in RESOURCES.iter().zip(sources) {
            hasher.update(source.as_bytes());
            env.add_template_owned(*name, source)?;
        }

        Ok(Self {
            env,
            checksum: format!("{:x}", hasher.finalize()),
        })
    }

    /// SHA-256 over all template sources.
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Render every resource in creation order.
    ///
    /// Names, the checksum annotation, caller annotations and ownership
    /// labels are enforced on top of whatever the templates produce.
    pub fn render(&self, data: &TemplateData) -> ControlResult<Vec<RenderedResource>> {
        let names = [
            &data.names.deployment,
            &data.names.service,
            &data.names.http_ingress,
            &data.names.grpc_ingress,
        ];

        RESOURCES
            .iter()
            .zip(names)
            .map(|((template, kind), name)| -> ControlResult<RenderedResource> {
                let rendered = self.env.get_template(template)?.render(data)?;
                let mut manifest: Value = serde_yaml::from_str(&rendered).map_err(|e| {
                    ControlError::Serialisation(format!(
                        "template {template} did not produce valid YAML: {e}"
                    ))
                })?;
                self.stamp(&mut manifest, name, data)?;
                Ok(RenderedResource {
                    kind: *kind,
                    name: name.clone(),
                    manifest,
                })
            })
            .collect()
    }

    fn stamp(&self, manifest: &mut Value, name: &str, data: &TemplateData) -> ControlResult<()> {
        let metadata = object_entry(manifest, "metadata")?;
        metadata.insert("name".to_owned(), Value::String(name.to_owned()));

        let labels = object_entry_in(metadata, "labels")?;
        labels.insert(
            MANAGED_BY_LABEL.to_owned(),
            Value::String("tessera-control".to_owned()),
        );
        labels.insert(
            INSTANCE_LABEL.to_owned(),
            Value::String(data.provision_id.clone()),
        );

        let annotations = object_entry_in(metadata, "annotations")?;
        for (key, value) in &data.annotations {
            annotations.insert(key.clone(), Value::String(value.clone()));
        }
        annotations.insert(
            CHECKSUM_ANNOTATION.to_owned(),
            Value::String(self.checksum.clone()),
        );
        Ok(())
    }
}

impl std::fmt::Debug for Templates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Templates")
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

fn read_or(path: Option<&Path>, fallback: &str) -> ControlResult<String> {
    match path {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            ControlError::Config(format!("failed to read template {}: {e}", path.display()))
        }),
        None => Ok(fallback.to_owned()),
    }
}

fn object_entry<'a>(value: &'a mut Value, key: &str) -> ControlResult<&'a mut Map<String, Value>> {
    let object = value
        .as_object_mut()
        .ok_or_else(|| ControlError::Serialisation("manifest is not a mapping".to_owned()))?;
    object_entry_in(object, key)
}

fn object_entry_in<'a>(
    object: &'a mut Map<String, Value>,
    key: &str,
) -> ControlResult<&'a mut Map<String, Value>> {
    let entry = object
        .entry(key.to_owned())
        .or_insert_with(|| Value::Object(Map::new()));
    if entry.is_null() {
        *entry = Value::Object(Map::new());
    }
    entry
        .as_object_mut()
        .ok_or_else(|| ControlError::Serialisation(format!("manifest field {key} is not a mapping")))
}

/// Read the checksum annotation from a manifest.
#[must_use]
pub fn checksum_of(manifest: &Value) -> Option<&str> {
    manifest
        .pointer("/metadata/annotations")?
        .get(CHECKSUM_ANNOTATION)?
        .as_str()
}
