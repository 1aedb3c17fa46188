//! Built-in maintenance jobs and the standard worker assembled from them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::deployment::Orchestrator;
use crate::error::{ControlError, ControlResult};
use crate::types::{Deployment, Project};

use super::billing::Biller;
use super::queue::JobQueue;
use super::schedule::{CronSchedule, Interval};
use super::{Job, JobRegistry, Worker};

pub const CHECK_PROVISIONER_CAPACITY: &str = "check_provisioner_capacity";
pub const HIBERNATE_EXPIRED_DEPLOYMENTS: &str = "hibernate_expired_deployments";
pub const VALIDATE_DEPLOYMENTS: &str = "validate_deployments";
pub const DEPLOYMENTS_HEALTH_CHECK: &str = "deployments_health_check";
pub const REPORT_USAGE: &str = "report_usage";
pub const TRIAL_END_CHECK: &str = "trial_end_check";
pub const RESET_ALL_DEPLOYMENTS: &str = "reset_all_deployments";

/// Build the worker with every built-in job registered and the default
/// schedules from `config`.
///
/// `trial_end_check` is only scheduled when billing is enabled;
/// `reset_all_deployments` is never scheduled.
pub fn standard_worker(
    orchestrator: &Arc<Orchestrator>,
    biller: &Arc<dyn Biller>,
    queue: &Arc<dyn JobQueue>,
    config: &WorkerConfig,
) -> ControlResult<Worker> {
    let mut registry = JobRegistry::new();
    registry.register(Arc::new(CheckProvisionerCapacity::new(Arc::clone(orchestrator))));
    registry.register(Arc::new(HibernateExpiredDeployments::new(Arc::clone(orchestrator))));
    registry.register(Arc::new(ValidateDeployments::new(Arc::clone(orchestrator))));
    registry.register(Arc::new(DeploymentsHealthCheck::new(Arc::clone(orchestrator))));
    registry.register(Arc::new(ReportUsage::new(Arc::clone(biller))));
    registry.register(Arc::new(TrialEndCheck::new(Arc::clone(biller), Arc::clone(queue))));
    registry.register(Arc::new(ResetAllDeployments::new(Arc::clone(orchestrator))));

    let mut worker = Worker::new(registry, config.job_timeout()).with_queue(Arc::clone(queue));

    worker.schedule(
        CHECK_PROVISIONER_CAPACITY,
        Arc::new(Interval::from_secs(config.check_capacity_interval_secs)),
    )?;
    worker.schedule(
        HIBERNATE_EXPIRED_DEPLOYMENTS,
        Arc::new(Interval::from_secs(config.hibernate_interval_secs)),
    )?;
    worker.schedule(
        VALIDATE_DEPLOYMENTS,
        Arc::new(Interval::from_secs(config.validate_interval_secs)),
    )?;
    worker.schedule(
        DEPLOYMENTS_HEALTH_CHECK,
        Arc::new(Interval::from_secs(config.health_check_interval_secs)),
    )?;

    let usage_cron = config
        .usage_report_cron
        .as_deref()
        .unwrap_or_else(|| biller.reporting_cron());
    worker.schedule(REPORT_USAGE, Arc::new(CronSchedule::parse(usage_cron)?))?;

    if biller.is_noop() {
        debug!(biller = biller.name(), "billing disabled, not scheduling trial checks");
    } else {
        worker.schedule(
            TRIAL_END_CHECK,
            Arc::new(CronSchedule::parse(&config.trial_check_cron)?),
        )?;
    }

    Ok(worker)
}

/// The project's production deployment, if it has one.
async fn prod_deployment(
    orchestrator: &Orchestrator,
    project: &Project,
) -> ControlResult<Option<Deployment>> {
    match &project.prod_deployment_id {
        Some(id) => orchestrator.store().find_deployment(id).await.map(Some),
        None => Ok(None),
    }
}

/// Asks every provisioner whether it has room left.
pub struct CheckProvisionerCapacity {
    orchestrator: Arc<Orchestrator>,
}

impl CheckProvisionerCapacity {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Job for CheckProvisionerCapacity {
    fn name(&self) -> &str {
        CHECK_PROVISIONER_CAPACITY
    }

    async fn run(&self) -> ControlResult<()> {
        let mut errors = Vec::new();
        for (name, provisioner) in self.orchestrator.provisioners().iter() {
            if let Err(e) = provisioner.check_capacity().await {
                warn!(provisioner = name, error = %e, "provisioner capacity check failed");
                errors.push(e.context(format!("provisioner {name}")));
            }
        }
        ControlError::collect(errors)
    }
}

/// Hibernates production deployments idle for longer than their project's TTL.
pub struct HibernateExpiredDeployments {
    orchestrator: Arc<Orchestrator>,
}

impl HibernateExpiredDeployments {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn hibernate_if_expired(&self, project: &Project, ttl_seconds: i64) -> ControlResult<()> {
        let Some(deployment) = prod_deployment(&self.orchestrator, project).await? else {
            return Ok(());
        };

        let expires = deployment.used_on + ChronoDuration::seconds(ttl_seconds);
        if expires > Utc::now() {
            return Ok(());
        }

        info!(
            project_id = %project.id,
            deployment_id = %deployment.id,
            ttl_seconds,
            "production deployment expired"
        );
        self.orchestrator.hibernate_project(project).await.map(|_| ())
    }
}

#[async_trait]
impl Job for HibernateExpiredDeployments {
    fn name(&self) -> &str {
        HIBERNATE_EXPIRED_DEPLOYMENTS
    }

    async fn run(&self) -> ControlResult<()> {
        let mut errors = Vec::new();
        for project in self.orchestrator.all_projects().await? {
            let Some(ttl) = project.prod_ttl_seconds else {
                continue;
            };
            if let Err(e) = self.hibernate_if_expired(&project, ttl).await {
                warn!(project_id = %project.id, error = %e, "could not hibernate project");
                errors.push(e);
            }
        }
        ControlError::collect(errors)
    }
}

/// Redeploys production deployments whose provisioned resources drifted from
/// the current configuration.
pub struct ValidateDeployments {
    orchestrator: Arc<Orchestrator>,
}

impl ValidateDeployments {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn validate(&self, project: &Project) -> ControlResult<()> {
        let Some(deployment) = prod_deployment(&self.orchestrator, project).await? else {
            return Ok(());
        };

        let Ok(provisioner) = self.orchestrator.provisioners().get(&deployment.provisioner) else {
            warn!(
                deployment_id = %deployment.id,
                provisioner = %deployment.provisioner,
                "skipping deployment with unknown provisioner"
            );
            return Ok(());
        };

        if provisioner.validate_config(deployment.id.as_str()).await? {
            return Ok(());
        }

        info!(project_id = %project.id, deployment_id = %deployment.id, "deployment config drifted");
        self.orchestrator
            .trigger_redeploy(project, &deployment)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Job for ValidateDeployments {
    fn name(&self) -> &str {
        VALIDATE_DEPLOYMENTS
    }

    async fn run(&self) -> ControlResult<()> {
        let mut errors = Vec::new();
        for project in self.orchestrator.all_projects().await? {
            if let Err(e) = self.validate(&project).await {
                warn!(project_id = %project.id, error = %e, "could not validate deployment");
                errors.push(e);
            }
        }
        ControlError::collect(errors)
    }
}

/// Pings every production runtime. Unreachable runtimes are counted and
/// logged but do not fail the job.
pub struct DeploymentsHealthCheck {
    orchestrator: Arc<Orchestrator>,
}

impl DeploymentsHealthCheck {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn ping(&self, deployment: &Deployment) -> ControlResult<()> {
        let client = self.orchestrator.runtime().open(deployment).await?;
        client.ping().await
    }
}

#[async_trait]
impl Job for DeploymentsHealthCheck {
    fn name(&self) -> &str {
        DEPLOYMENTS_HEALTH_CHECK
    }

    async fn run(&self) -> ControlResult<()> {
        let mut checked = 0_u32;
        let mut failed = 0_u32;
        for project in self.orchestrator.all_projects().await? {
            let deployment = match prod_deployment(&self.orchestrator, &project).await {
                Ok(Some(deployment)) => deployment,
                Ok(None) => continue,
                Err(e) => {
                    warn!(project_id = %project.id, error = %e, "could not load deployment");
                    continue;
                }
            };

            checked = checked.saturating_add(1);
            if let Err(e) = self.ping(&deployment).await {
                failed = failed.saturating_add(1);
                counter!("tessera.deployments.health_check_failures").increment(1);
                warn!(
                    project_id = %project.id,
                    deployment_id = %deployment.id,
                    host = %deployment.runtime.host,
                    error = %e,
                    "deployment health check failed"
                );
            }
        }
        info!(checked, failed, "health check complete");
        Ok(())
    }
}

/// Reports metered usage to the billing provider.
pub struct ReportUsage {
    biller: Arc<dyn Biller>,
}

impl ReportUsage {
    pub fn new(biller: Arc<dyn Biller>) -> Self {
        Self { biller }
    }
}

#[async_trait]
impl Job for ReportUsage {
    fn name(&self) -> &str {
        REPORT_USAGE
    }

    async fn run(&self) -> ControlResult<()> {
        self.biller.report_usage().await
    }
}

/// Enqueues a durable check for every trial that has ended.
pub struct TrialEndCheck {
    biller: Arc<dyn Biller>,
    queue: Arc<dyn JobQueue>,
}

impl TrialEndCheck {
    pub fn new(biller: Arc<dyn Biller>, queue: Arc<dyn JobQueue>) -> Self {
        Self { biller, queue }
    }
}

#[async_trait]
impl Job for TrialEndCheck {
    fn name(&self) -> &str {
        TRIAL_END_CHECK
    }

    async fn run(&self) -> ControlResult<()> {
        let trials = self.biller.trials_ending_before(Utc::now()).await?;
        for trial in trials {
            let org_id = trial.org_id.clone();
            let inserted = self.queue.trial_end_check(trial).await?;
            if inserted.duplicate {
                debug!(org_id = %org_id, job_id = inserted.id, "trial end check already queued");
            } else {
                info!(org_id = %org_id, job_id = inserted.id, "queued trial end check");
            }
        }
        Ok(())
    }
}

/// Redeploys every deployment. Only run on demand.
pub struct ResetAllDeployments {
    orchestrator: Arc<Orchestrator>,
}

impl ResetAllDeployments {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Job for ResetAllDeployments {
    fn name(&self) -> &str {
        RESET_ALL_DEPLOYMENTS
    }

    async fn run(&self) -> ControlResult<()> {
        self.orchestrator.redeploy_all().await
    }
}
