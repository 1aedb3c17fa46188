//! Durable job queue.
//!
//! Jobs are enqueued by other components (billing webhooks, organization
//! deletion) and consumed by the worker for its whole lifetime. Each job kind
//! has a uniqueness key; enqueueing a job whose key is already pending
//! reports a duplicate instead of inserting it again.

mod memory;
mod postgres;

pub use memory::{MemoryQueue, QueueStats};
pub use postgres::PostgresQueue;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::deployment::Orchestrator;
use crate::error::ControlResult;
use crate::types::OrganizationId;

use super::billing::{Biller, PaymentFailure, TrialInfo};

/// A job on the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueJob {
    PaymentFailed(PaymentFailure),
    PaymentSuccess {
        billing_customer_id: String,
        invoice_id: String,
    },
    TrialEndingSoon(TrialInfo),
    TrialEndCheck(TrialInfo),
    TrialGracePeriodCheck {
        trial: TrialInfo,
        grace_period_end_date: DateTime<Utc>,
    },
    SubscriptionCancellation {
        org_id: OrganizationId,
        subscription_id: String,
        plan_id: String,
        end_date: DateTime<Utc>,
    },
    PurgeOrg {
        org_id: OrganizationId,
    },
}

impl QueueJob {
    /// Stable name of the job kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PaymentFailed(_) => "payment_failed",
            Self::PaymentSuccess { .. } => "payment_success",
            Self::TrialEndingSoon(_) => "trial_ending_soon",
            Self::TrialEndCheck(_) => "trial_end_check",
            Self::TrialGracePeriodCheck { .. } => "trial_grace_period_check",
            Self::SubscriptionCancellation { .. } => "subscription_cancellation",
            Self::PurgeOrg { .. } => "purge_org",
        }
    }

    /// Key under which at most one pending job may exist.
    #[must_use]
    pub fn unique_key(&self) -> String {
        let subject = match self {
            Self::PaymentFailed(failure) => failure.invoice_id.clone(),
            Self::PaymentSuccess { invoice_id, .. } => invoice_id.clone(),
            Self::TrialEndingSoon(trial) | Self::TrialEndCheck(trial) => {
                format!("{}:{}", trial.org_id, trial.subscription_id)
            }
            Self::TrialGracePeriodCheck { trial, .. } => {
                format!("{}:{}", trial.org_id, trial.subscription_id)
            }
            Self::SubscriptionCancellation {
                org_id,
                subscription_id,
                ..
            } => format!("{org_id}:{subscription_id}"),
            Self::PurgeOrg { org_id } => org_id.to_string(),
        };
        format!("{}:{subject}", self.kind())
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    /// Id of the inserted job, or of the pending job it duplicates.
    pub id: i64,
    pub duplicate: bool,
}

/// Executes jobs taken off the queue.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob) -> ControlResult<()>;
}

/// Durable job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create or upgrade the queue's storage.
    async fn migrate(&self) -> ControlResult<()>;

    /// Insert a job unless one with the same key is pending.
    async fn enqueue(&self, job: QueueJob) -> ControlResult<InsertResult>;

    /// Consume jobs until `cancel` fires.
    async fn work(&self, cancel: CancellationToken) -> ControlResult<()>;

    async fn payment_failed(&self, failure: PaymentFailure) -> ControlResult<InsertResult> {
        self.enqueue(QueueJob::PaymentFailed(failure)).await
    }

    async fn payment_success(
        &self,
        billing_customer_id: &str,
        invoice_id: &str,
    ) -> ControlResult<InsertResult> {
        self.enqueue(QueueJob::PaymentSuccess {
            billing_customer_id: billing_customer_id.to_owned(),
            invoice_id: invoice_id.to_owned(),
        })
        .await
    }

    async fn trial_ending_soon(&self, trial: TrialInfo) -> ControlResult<InsertResult> {
        self.enqueue(QueueJob::TrialEndingSoon(trial)).await
    }

    async fn trial_end_check(&self, trial: TrialInfo) -> ControlResult<InsertResult> {
        self.enqueue(QueueJob::TrialEndCheck(trial)).await
    }

    async fn trial_grace_period_check(
        &self,
        trial: TrialInfo,
        grace_period_end_date: DateTime<Utc>,
    ) -> ControlResult<InsertResult> {
        self.enqueue(QueueJob::TrialGracePeriodCheck {
            trial,
            grace_period_end_date,
        })
        .await
    }

    async fn subscription_cancellation(
        &self,
        org_id: &OrganizationId,
        subscription_id: &str,
        plan_id: &str,
        end_date: DateTime<Utc>,
    ) -> ControlResult<InsertResult> {
        self.enqueue(QueueJob::SubscriptionCancellation {
            org_id: org_id.clone(),
            subscription_id: subscription_id.to_owned(),
            plan_id: plan_id.to_owned(),
            end_date,
        })
        .await
    }

    async fn purge_org(&self, org_id: &OrganizationId) -> ControlResult<InsertResult> {
        self.enqueue(QueueJob::PurgeOrg {
            org_id: org_id.clone(),
        })
        .await
    }
}

/// Routes organization purges to the orchestrator and everything else to
/// the biller.
pub struct ControlQueueHandler {
    orchestrator: Arc<Orchestrator>,
    biller: Arc<dyn Biller>,
}

impl ControlQueueHandler {
    pub fn new(orchestrator: Arc<Orchestrator>, biller: Arc<dyn Biller>) -> Self {
        Self {
            orchestrator,
            biller,
        }
    }
}

#[async_trait]
impl QueueHandler for ControlQueueHandler {
    async fn handle(&self, job: &QueueJob) -> ControlResult<()> {
        match job {
            QueueJob::PurgeOrg { org_id } => self.orchestrator.purge_organization(org_id).await,
            other => self.biller.handle_event(other).await,
        }
    }
}

/// Delay before retry number `attempt` (from 1): doubles each time, capped.
fn retry_delay(base: std::time::Duration, attempt: u32) -> std::time::Duration {
    const MAX: std::time::Duration = std::time::Duration::from_secs(300);
    base.saturating_mul(1_u32 << attempt.saturating_sub(1).min(16))
        .min(MAX)
}
