//! Background jobs.
//!
//! A [`Worker`] owns an explicit [`JobRegistry`], a set of schedules naming
//! registered jobs, and optionally the durable [`JobQueue`] consumer. All of
//! them run concurrently under one cancellation group. A failing job is
//! logged and metered; it never stops its schedule or any other.

pub mod billing;
pub mod jobs;
pub mod queue;
pub mod schedule;

pub use billing::{Biller, NoopBiller, PaymentFailure, TrialInfo, DEFAULT_USAGE_REPORT_CRON};
pub use jobs::standard_worker;
pub use queue::{
    ControlQueueHandler, InsertResult, JobQueue, MemoryQueue, PostgresQueue, QueueHandler,
    QueueJob, QueueStats,
};
pub use schedule::{CronSchedule, Interval, Schedule};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::{ControlError, ControlResult};

/// A unit of background work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> ControlResult<()>;
}

/// Jobs by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job under its own name, replacing any previous one.
    pub fn register(&mut self, job: Arc<dyn Job>) {
        self.jobs.insert(job.name().to_owned(), job);
    }

    pub fn get(&self, name: &str) -> ControlResult<&Arc<dyn Job>> {
        self.jobs
            .get(name)
            .ok_or_else(|| ControlError::UnknownJob(name.to_owned()))
    }

    /// Registered names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.jobs.keys()).finish()
    }
}

/// Runs one job execution with a timeout, a span, timing and metrics.
#[derive(Debug, Clone, Copy)]
pub struct JobRunner {
    timeout: Duration,
}

impl JobRunner {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run(&self, job: &dyn Job) -> ControlResult<()> {
        let name = job.name().to_owned();
        let span = info_span!("job", name = %name);

        async {
            let started = Instant::now();
            let result = match tokio::time::timeout(self.timeout, job.run()).await {
                Ok(result) => result,
                Err(_) => Err(ControlError::JobTimeout {
                    job: name.clone(),
                    timeout_secs: self.timeout.as_secs(),
                }),
            };
            let elapsed = started.elapsed();
            let failed = if result.is_err() { "true" } else { "false" };

            histogram!("tessera.worker.job.duration", "job" => name.clone(), "failed" => failed)
                .record(elapsed.as_secs_f64());
            counter!("tessera.worker.job.runs", "job" => name.clone(), "failed" => failed)
                .increment(1);

            match &result {
                Ok(()) => info!(?elapsed, "job finished"),
                Err(e) => error!(?elapsed, error = %e, "job failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Runs scheduled jobs and the queue consumer.
pub struct Worker {
    registry: JobRegistry,
    schedules: Vec<(String, Arc<dyn Schedule>)>,
    queue: Option<Arc<dyn JobQueue>>,
    runner: JobRunner,
}

impl Worker {
    pub fn new(registry: JobRegistry, job_timeout: Duration) -> Self {
        Self {
            registry,
            schedules: Vec::new(),
            queue: None,
            runner: JobRunner::new(job_timeout),
        }
    }

    /// Consume `queue` for the worker's lifetime.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Run the registered job `name` on `schedule`.
    pub fn schedule(&mut self, name: &str, schedule: Arc<dyn Schedule>) -> ControlResult<()> {
        self.registry.get(name)?;
        self.schedules.push((name.to_owned(), schedule));
        Ok(())
    }

    #[must_use]
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Names of scheduled jobs, in scheduling order.
    pub fn scheduled(&self) -> impl Iterator<Item = &str> {
        self.schedules.iter().map(|(name, _)| name.as_str())
    }

    /// Run the named job once, now.
    pub async fn run_job(&self, name: &str) -> ControlResult<()> {
        let job = self.registry.get(name)?;
        self.runner.run(job.as_ref()).await
    }

    /// Run every schedule and the queue consumer until `cancel` fires.
    ///
    /// Returns early with the error if queue migration or the consumer
    /// fails, after stopping everything else.
    pub async fn run(&self, cancel: CancellationToken) -> ControlResult<()> {
        let group = cancel.child_token();

        if let Some(queue) = &self.queue {
            queue
                .migrate()
                .await
                .map_err(|e| e.context("queue migration failed"))?;
        }

        let mut tasks = JoinSet::new();

        for (name, schedule) in &self.schedules {
            let job = Arc::clone(self.registry.get(name)?);
            let schedule = Arc::clone(schedule);
            let runner = self.runner;
            let cancel = group.clone();
            tasks.spawn(
                run_schedule(job, schedule, runner, cancel)
                    .instrument(info_span!("schedule", job = %name)),
            );
        }

        if let Some(queue) = &self.queue {
            let queue = Arc::clone(queue);
            let cancel = group.clone();
            tasks.spawn(async move {
                queue
                    .work(cancel)
                    .await
                    .map_err(|e| e.context("queue consumer failed"))
            });
        }

        info!(
            schedules = self.schedules.len(),
            queue = self.queue.is_some(),
            "worker started"
        );

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| ControlError::internal(format!("worker task panicked: {e}")))
                .and_then(|r| r);
            if let Err(e) = result {
                if fatal.is_none() {
                    error!(error = %e, "worker stopping");
                    group.cancel();
                    fatal = Some(e);
                }
            }
        }

        info!("worker stopped");
        fatal.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("registry", &self.registry)
            .field("schedules", &self.schedules)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

async fn run_schedule(
    job: Arc<dyn Job>,
    schedule: Arc<dyn Schedule>,
    runner: JobRunner,
    cancel: CancellationToken,
) -> ControlResult<()> {
    let mut next = schedule.first_run(Utc::now());

    while let Some(at) = next {
        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(wait) => {}
        }

        tokio::select! {
            () = cancel.cancelled() => {
                warn!("job interrupted by shutdown");
                return Ok(());
            }
            // Failures are logged by the runner.
            _ = runner.run(job.as_ref()) => {}
        }

        next = schedule.next_run(Utc::now());
    }

    warn!("schedule exhausted");
    Ok(())
}
