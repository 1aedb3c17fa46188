//! Health probing of freshly provisioned runtimes.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ControlError, ControlResult};

/// Well-known health path served by every runtime.
pub const HEALTH_PATH: &str = "/v1/ping";

/// Retry policy for the health probe.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

const fn default_retries() -> u32 {
    5
}

const fn default_min_backoff_ms() -> u64 {
    2_000
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_request_timeout_ms() -> u64 {
    5_000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ProbeConfig {
    /// Jittered exponential backoff before retry number `attempt` (from 1).
    fn backoff(&self, attempt: u32) -> Duration {
        let max = self.max_backoff_ms.max(self.min_backoff_ms);
        let base = self
            .min_backoff_ms
            .saturating_mul(1_u64 << attempt.saturating_sub(1).min(16))
            .min(max);
        let jittered = if base > self.min_backoff_ms {
            rand::thread_rng().gen_range(self.min_backoff_ms..=base)
        } else {
            base
        };
        Duration::from_millis(jittered)
    }
}

/// Probe `{base_url}/v1/ping` until it answers with a success status.
pub async fn await_reachable(
    client: &reqwest::Client,
    base_url: &str,
    config: &ProbeConfig,
) -> ControlResult<()> {
    let url = format!("{}{HEALTH_PATH}", base_url.trim_end_matches('/'));
    let timeout = Duration::from_millis(config.request_timeout_ms);
    let mut last_error = String::new();

    for attempt in 0..=config.retries {
        if attempt > 0 {
            let delay = config.backoff(attempt);
            debug!(%url, attempt, delay_ms = delay.as_millis(), "retrying health probe");
            tokio::time::sleep(delay).await;
        }

        match client.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => last_error = format!("status {}", response.status()),
            Err(e) => last_error = e.to_string(),
        }
    }

    warn!(%url, error = %last_error, "runtime did not answer health probe");
    Err(ControlError::provisioning(format!(
        "runtime at {url} not reachable after {} attempts: {last_error}",
        config.retries.saturating_add(1)
    )))
}
