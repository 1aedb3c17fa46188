//! Composition root: builds every component from configuration and runs them.

use std::sync::Arc;

use sqlx::postgres::PgPool;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ControlConfig, QueueBackend};
use crate::deployment::Orchestrator;
use crate::error::{ControlError, ControlResult};
use crate::provisioner::ProvisionerSet;
use crate::runtime::{HttpRuntimeClientFactory, RuntimeClientFactory};
use crate::store::{MemoryStore, PostgresStore, Store};
use crate::worker::{
    standard_worker, Biller, ControlQueueHandler, JobQueue, MemoryQueue, NoopBiller,
    PostgresQueue, QueueHandler, Worker,
};

/// The running control plane.
pub struct ControlService {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn JobQueue>,
    worker: Worker,
    shutdown: CancellationToken,
}

impl ControlService {
    /// Build the control plane from configuration.
    ///
    /// Without a database URL the store is held in memory.
    pub async fn build(config: &ControlConfig, shutdown: CancellationToken) -> ControlResult<Self> {
        let (store, pool): (Arc<dyn Store>, Option<PgPool>) = match &config.database.url {
            Some(url) => {
                let store = PostgresStore::connect(url, &config.database).await?;
                let pool = store.pool().clone();
                info!("connected to database");
                (Arc::new(store), Some(pool))
            }
            None => {
                warn!("no database configured, state will not survive a restart");
                (Arc::new(MemoryStore::new()), None)
            }
        };

        let provisioners = ProvisionerSet::from_specs(&config.provisioners, &store)?;
        if !provisioners.contains(&config.orchestrator.default_provisioner) {
            warn!(
                provisioner = %config.orchestrator.default_provisioner,
                "default provisioner is not configured"
            );
        }
        info!(?provisioners, "provisioners loaded");

        let runtime: Arc<dyn RuntimeClientFactory> =
            Arc::new(HttpRuntimeClientFactory::new(&config.runtime)?);

        let orchestrator = Arc::new(Orchestrator::new(
            store,
            provisioners,
            runtime,
            config.orchestrator.clone(),
            shutdown.clone(),
        ));

        let biller: Arc<dyn Biller> = Arc::new(NoopBiller);
        let handler: Arc<dyn QueueHandler> = Arc::new(ControlQueueHandler::new(
            Arc::clone(&orchestrator),
            Arc::clone(&biller),
        ));

        let queue: Arc<dyn JobQueue> = match (config.queue.backend, pool) {
            (QueueBackend::Memory, _) => Arc::new(MemoryQueue::new(handler, config.queue.clone())),
            (QueueBackend::Postgres, Some(pool)) => {
                Arc::new(PostgresQueue::new(pool, handler, config.queue.clone())?)
            }
            (QueueBackend::Postgres, None) => {
                return Err(ControlError::Config(
                    "the postgres queue requires database.url".to_owned(),
                ));
            }
        };

        let worker = standard_worker(&orchestrator, &biller, &queue, &config.worker)?;
        info!(
            jobs = ?worker.registry(),
            scheduled = ?worker.scheduled().collect::<Vec<_>>(),
            "worker configured"
        );

        Ok(Self {
            orchestrator,
            queue,
            worker,
            shutdown,
        })
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    #[must_use]
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Run the worker until shutdown, then wait for background reconciles.
    pub async fn run(&self) -> ControlResult<()> {
        let result = self.worker.run(self.shutdown.clone()).await;
        if let Err(e) = &result {
            error!(error = %e, "worker failed");
            self.shutdown.cancel();
        }

        self.orchestrator.wait_background().await;
        info!("control service stopped");
        result
    }

    /// Run a single job by name and wait for any reconciles it started.
    pub async fn run_job(&self, name: &str) -> ControlResult<()> {
        let result = self.worker.run_job(name).await;
        self.orchestrator.wait_background().await;
        result
    }
}

impl std::fmt::Debug for ControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlService")
            .field("orchestrator", &self.orchestrator)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Resolve on SIGINT or SIGTERM, or when `cancel` fires.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
