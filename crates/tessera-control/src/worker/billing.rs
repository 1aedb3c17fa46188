//! Billing collaborator used by billing-related jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ControlResult;
use crate::types::OrganizationId;

use super::queue::QueueJob;

/// Usage is reported hourly unless the biller says otherwise.
pub const DEFAULT_USAGE_REPORT_CRON: &str = "0 * * * *";

/// A subscription in its trial period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialInfo {
    pub org_id: OrganizationId,
    pub subscription_id: String,
    pub plan_id: String,
    pub trial_end_date: DateTime<Utc>,
}

/// A failed invoice payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub billing_customer_id: String,
    pub invoice_id: String,
    pub invoice_number: String,
    pub invoice_url: String,
    /// Amount in minor currency units.
    pub amount: i64,
    pub currency: String,
    pub due_date: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

/// Billing provider integration.
#[async_trait]
pub trait Biller: Send + Sync {
    fn name(&self) -> &str;

    /// Whether billing is disabled. Billing-only jobs are not scheduled then.
    fn is_noop(&self) -> bool {
        false
    }

    /// Cron expression for usage reporting.
    fn reporting_cron(&self) -> &str {
        DEFAULT_USAGE_REPORT_CRON
    }

    /// Push metered usage to the provider.
    async fn report_usage(&self) -> ControlResult<()>;

    /// Trials ending before `cutoff`.
    async fn trials_ending_before(&self, cutoff: DateTime<Utc>) -> ControlResult<Vec<TrialInfo>>;

    /// Handle a billing event taken off the durable queue.
    async fn handle_event(&self, job: &QueueJob) -> ControlResult<()>;
}

/// Biller used when no billing provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBiller;

#[async_trait]
impl Biller for NoopBiller {
    fn name(&self) -> &str {
        "noop"
    }

    fn is_noop(&self) -> bool {
        true
    }

    async fn report_usage(&self) -> ControlResult<()> {
        Ok(())
    }

    async fn trials_ending_before(&self, _cutoff: DateTime<Utc>) -> ControlResult<Vec<TrialInfo>> {
        Ok(Vec::new())
    }

    async fn handle_event(&self, _job: &QueueJob) -> ControlResult<()> {
        Ok(())
    }
}
