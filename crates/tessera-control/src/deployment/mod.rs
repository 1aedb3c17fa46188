//! Deployment orchestration and lifecycle management.
//!
//! The [`Orchestrator`] owns the multi-step sagas that create, replace and
//! tear down deployments; the [`Reconciler`] drives a single deployment
//! through a reconcile against its runtime.

mod orchestrator;
mod reconcile;

pub use orchestrator::Orchestrator;
pub use reconcile::{ReconcileOutcome, ReconcileScope, Reconciler};
