//! Error types for tessera-control.

use crate::provisioner::ClusterError;
use crate::types::DeploymentId;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A requested record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record ("project", "deployment", ...).
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Provisioning error.
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// Kubernetes API error.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Project references a provisioner that is not configured.
    #[error("provisioner not found: {0}")]
    ProvisionerNotFound(String),

    /// Runtime communication error.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Another reconcile holds the deployment.
    #[error("skipping because reconcile is already running for deployment {0}")]
    ReconcileInProgress(DeploymentId),

    /// The production deployment pointer changed underneath us.
    #[error("production deployment of project {project} was changed concurrently")]
    ProdDeploymentConflict {
        /// Project identifier.
        project: String,
    },

    /// A job name that is not registered.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// A job exceeded its time budget.
    #[error("job {job} timed out after {timeout_secs}s")]
    JobTimeout {
        /// Job name.
        job: String,
        /// Budget in seconds.
        timeout_secs: u64,
    },

    /// Job queue error.
    #[error("queue error: {0}")]
    Queue(String),

    /// Template rendering error.
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// An operation failed with additional context.
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted.
        context: String,
        /// Underlying failure.
        #[source]
        source: Box<ControlError>,
    },

    /// An operation failed and one or more compensating actions failed too.
    #[error("{error} (compensation failed: {})", join(.compensations))]
    Compensated {
        /// The original failure.
        error: Box<ControlError>,
        /// Failures of the compensating actions, in the order they ran.
        compensations: Vec<ControlError>,
    },

    /// Several independent steps failed.
    #[error("{}", join(.0))]
    Multiple(Vec<ControlError>),
}

fn join(errors: &[ControlError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControlError {
    /// Create a provisioning error.
    #[must_use]
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a runtime error.
    #[must_use]
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create a queue error.
    #[must_use]
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Wrap this error with a description of the failed operation.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Attach the outcome of compensating actions to a failure.
    ///
    /// Successful compensations are dropped; if all succeeded the original
    /// error is returned unchanged.
    #[must_use]
    pub fn compensated<I>(self, compensations: I) -> Self
    where
        I: IntoIterator<Item = ControlResult<()>>,
    {
        let failed: Vec<_> = compensations.into_iter().filter_map(Result::err).collect();
        if failed.is_empty() {
            self
        } else {
            Self::Compensated {
                error: Box::new(self),
                compensations: failed,
            }
        }
    }

    /// Collapse a list of failures into a single result.
    pub fn collect(mut errors: Vec<Self>) -> ControlResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Strip [`ControlError::Context`] layers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error (ignoring context) is a missing record.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }
}
