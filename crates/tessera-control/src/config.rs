//! Configuration for tessera-control.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};
use crate::provisioner::ProvisionerSpec;

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Named provisioner definitions.
    #[serde(default)]
    pub provisioners: HashMap<String, ProvisionerSpec>,

    /// Orchestrator behaviour.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Runtime client configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Background job scheduling.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Durable job queue.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `tessera.toml` in the current directory (if present)
    /// 3. Environment variables with `TESSERA_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("tessera.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TESSERA_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. When unset an in-memory store is used.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Orchestrator behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Provisioner used when a project does not name one.
    #[serde(default = "default_provisioner")]
    pub default_provisioner: String,

    /// Runtime image tag for new deployments.
    #[serde(default = "default_runtime_version")]
    pub runtime_version: String,

    /// A reconcile that has not touched its deployment for this long is
    /// considered abandoned and may be taken over.
    #[serde(default = "default_reconcile_stale_after_secs")]
    pub reconcile_stale_after_secs: u64,
}

fn default_provisioner() -> String {
    "default".to_owned()
}

fn default_runtime_version() -> String {
    "latest".to_owned()
}

const fn default_reconcile_stale_after_secs() -> u64 {
    30 * 60
}

impl OrchestratorConfig {
    /// Staleness window for reconcile claims.
    #[must_use]
    pub const fn reconcile_stale_after(&self) -> Duration {
        Duration::from_secs(self.reconcile_stale_after_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_provisioner: default_provisioner(),
            runtime_version: default_runtime_version(),
            reconcile_stale_after_secs: default_reconcile_stale_after_secs(),
        }
    }
}

/// Runtime client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Request timeout in seconds. Reconciles can be slow.
    #[serde(default = "default_runtime_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_runtime_timeout_secs() -> u64 {
    600
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_runtime_timeout_secs(),
        }
    }
}

/// Background job scheduling.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Upper bound for a single job execution.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_fifteen_minutes")]
    pub check_capacity_interval_secs: u64,

    #[serde(default = "default_fifteen_minutes")]
    pub hibernate_interval_secs: u64,

    #[serde(default = "default_validate_interval_secs")]
    pub validate_interval_secs: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Cron expression for the trial end check.
    #[serde(default = "default_trial_check_cron")]
    pub trial_check_cron: String,

    /// Overrides the biller's usage reporting cron expression.
    #[serde(default)]
    pub usage_report_cron: Option<String>,
}

const fn default_job_timeout_secs() -> u64 {
    60 * 60
}

const fn default_fifteen_minutes() -> u64 {
    15 * 60
}

const fn default_validate_interval_secs() -> u64 {
    6 * 60 * 60
}

const fn default_health_check_interval_secs() -> u64 {
    10 * 60
}

fn default_trial_check_cron() -> String {
    "0 0 * * *".to_owned()
}

impl WorkerConfig {
    /// Upper bound for a single job execution.
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: default_job_timeout_secs(),
            check_capacity_interval_secs: default_fifteen_minutes(),
            hibernate_interval_secs: default_fifteen_minutes(),
            validate_interval_secs: default_validate_interval_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            trial_check_cron: default_trial_check_cron(),
            usage_report_cron: None,
        }
    }
}

/// Which queue implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-process queue. Jobs are lost on restart.
    #[default]
    Memory,
    /// Table-backed queue sharing the control database.
    Postgres,
}

/// Durable job queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,

    /// Attempts before a job is discarded.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// How often an idle consumer polls for work, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Base delay before a failed job is retried, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Table used by the Postgres backend.
    #[serde(default = "default_queue_table")]
    pub table: String,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_poll_interval_ms() -> u64 {
    1000
}

const fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_queue_table() -> String {
    "queue_jobs".to_owned()
}

impl QueueConfig {
    /// Idle poll interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Base retry delay.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            table: default_queue_table(),
        }
    }
}

/// Prometheus exporter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Address for the `/metrics` listener. Disabled when unset.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}
