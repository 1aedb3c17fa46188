//! Tessera Control Plane
//!
//! This crate provisions and manages the runtimes that serve Tessera
//! projects. Each project has at most one production deployment: a runtime
//! instance allocated by a named provisioner and kept in step with the
//! project's files through reconciles.
//!
//! # Architecture
//!
//! - **Provisioners** ([`provisioner`]): allocate runtime capacity, either by
//!   rendering and applying templated Kubernetes resources or by assigning
//!   slots on a fixed pool of runtimes
//! - **Orchestrator** ([`deployment`]): multi-step project and deployment
//!   operations that compensate completed steps when a later one fails
//! - **Runtime client** ([`runtime`]): triggers reconciles on a runtime
//!   instance and reads its catalog
//! - **Worker** ([`worker`]): recurring maintenance jobs on interval or cron
//!   schedules, plus a durable job queue
//! - **Store** ([`store`]): organizations, projects and deployments, in
//!   memory or in PostgreSQL
//!
//! # Deployment status
//!
//! ```text
//! Unspecified ──▶ Pending ──▶ Reconciling ──▶ Ok
//!                                  ▲    │
//!                                  │    ▼
//!                                  └── Error
//! ```
//!
//! A reconcile only starts when the deployment is not already reconciling,
//! or when the running reconcile has not updated it for longer than the
//! configured staleness window.
//!
//! # Example
//!
//! ```ignore
//! use tessera_control::{ControlConfig, ControlService};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ControlConfig::load()?;
//! let shutdown = CancellationToken::new();
//! let service = ControlService::build(&config, shutdown.clone()).await?;
//!
//! let project = service
//!     .orchestrator()
//!     .create_project(&org, &creator, opts)
//!     .await?;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod deployment;
pub mod error;
pub mod provisioner;
pub mod runtime;
pub mod service;
pub mod store;
pub mod types;
pub mod worker;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use deployment::{Orchestrator, ReconcileOutcome, ReconcileScope, Reconciler};
pub use error::{ControlError, ControlResult};
pub use provisioner::{Allocation, ProvisionOptions, Provisioner, ProvisionerSet, ProvisionerSpec};
pub use runtime::{RuntimeClient, RuntimeClientFactory};
pub use service::ControlService;
pub use store::{MemoryStore, PostgresStore, Store};
pub use types::{
    CreateProjectOptions, Deployment, DeploymentId, DeploymentStatus, Organization,
    OrganizationId, Project, ProjectId, ProjectMember, ProjectRole, UpdateProjectOptions, UserId,
    UsergroupId,
};
pub use worker::{JobQueue, Worker};
