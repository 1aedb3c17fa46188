//! Core types for tessera-control.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique identifier using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_type!(
    /// Unique identifier for a deployment. Doubles as the provision id.
    DeploymentId
);
id_type!(
    /// Unique identifier for a project.
    ProjectId
);
id_type!(
    /// Unique identifier for an organization.
    OrganizationId
);
id_type!(
    /// Unique identifier for a user.
    UserId
);
id_type!(
    /// Unique identifier for a user group.
    UsergroupId
);

/// A tenant organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    /// Organization identifier.
    pub id: OrganizationId,
    /// Unique name.
    pub name: String,
    /// Group containing every member of the organization.
    pub all_usergroup_id: Option<UsergroupId>,
    /// When the organization was created.
    pub created_on: DateTime<Utc>,
}

impl Organization {
    /// Create a new organization with a generated ID.
    #[must_use]
    pub fn new(name: impl Into<String>, all_usergroup_id: Option<UsergroupId>) -> Self {
        Self {
            id: OrganizationId::generate(),
            name: name.into(),
            all_usergroup_id,
            created_on: Utc::now(),
        }
    }
}

/// Options supplied when creating a project.
#[derive(Debug, Clone, Default)]
pub struct CreateProjectOptions {
    /// Project name, unique within the organization.
    pub name: String,
    /// Git repository the project is built from.
    pub git_url: Option<String>,
    /// Branch deployed to production.
    pub prod_branch: String,
    /// Runtime slots for the production deployment.
    pub prod_slots: u32,
    /// OLAP driver the runtime instance is configured with.
    pub prod_olap_driver: String,
    /// Provisioner name; `None` selects the configured default.
    pub provisioner: Option<String>,
    /// Free-form annotations passed through to the provisioner.
    pub annotations: BTreeMap<String, String>,
    /// Hibernate the production deployment after this many idle seconds.
    pub prod_ttl_seconds: Option<i64>,
}

/// Changes applied to an existing project.
///
/// Every field is written; start from [`UpdateProjectOptions::from_project`]
/// to change only some of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateProjectOptions {
    pub name: String,
    pub git_url: Option<String>,
    pub prod_branch: String,
    pub prod_ttl_seconds: Option<i64>,
    /// Roll every deployment to this runtime version.
    pub runtime_version: Option<String>,
}

impl UpdateProjectOptions {
    /// Options that leave `project` unchanged.
    #[must_use]
    pub fn from_project(project: &Project) -> Self {
        Self {
            name: project.name.clone(),
            git_url: project.git_url.clone(),
            prod_branch: project.prod_branch.clone(),
            prod_ttl_seconds: project.prod_ttl_seconds,
            runtime_version: None,
        }
    }

    /// Whether applying these options changes what deployments serve.
    #[must_use]
    pub fn impacts_deployments(&self, project: &Project) -> bool {
        self.prod_branch != project.prod_branch
            || self.git_url != project.git_url
            || self.runtime_version.is_some()
    }
}

/// A tenant project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub git_url: Option<String>,
    pub prod_branch: String,
    pub prod_slots: u32,
    pub prod_olap_driver: String,
    pub provisioner: String,
    pub annotations: BTreeMap<String, String>,
    /// The single active production deployment, if any.
    pub prod_deployment_id: Option<DeploymentId>,
    pub prod_ttl_seconds: Option<i64>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

impl Project {
    /// Build a new project record from creation options.
    #[must_use]
    pub fn new(
        organization_id: OrganizationId,
        opts: CreateProjectOptions,
        provisioner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::generate(),
            organization_id,
            name: opts.name,
            git_url: opts.git_url,
            prod_branch: opts.prod_branch,
            prod_slots: opts.prod_slots,
            prod_olap_driver: opts.prod_olap_driver,
            provisioner: provisioner.into(),
            annotations: opts.annotations,
            prod_deployment_id: None,
            prod_ttl_seconds: opts.prod_ttl_seconds,
            created_on: now,
            updated_on: now,
        }
    }
}

/// Role granted to a project member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectRole {
    Admin,
    Viewer,
}

impl ProjectRole {
    /// Get the role name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Viewer => "viewer",
        }
    }
}

impl FromStr for ProjectRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "viewer" => Ok(Self::Viewer),
            _ => Err(format!("unknown project role: {s}")),
        }
    }
}

/// Who a project membership is granted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum MemberRef {
    User(UserId),
    Usergroup(UsergroupId),
}

/// A membership row seeded when a project is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMember {
    pub member: MemberRef,
    pub role: ProjectRole,
}

impl ProjectMember {
    /// Grant a role to a single user.
    #[must_use]
    pub fn user(id: UserId, role: ProjectRole) -> Self {
        Self {
            member: MemberRef::User(id),
            role,
        }
    }

    /// Grant a role to a user group.
    #[must_use]
    pub fn usergroup(id: UsergroupId, role: ProjectRole) -> Self {
        Self {
            member: MemberRef::Usergroup(id),
            role,
        }
    }
}

/// Lifecycle status of a deployment.
///
/// `Pending` on creation, `Reconciling` while a reconcile holds the
/// deployment, then `Ok` or `Error`. Both terminal states may re-enter
/// `Reconciling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Unspecified,
    Pending,
    Ok,
    Reconciling,
    Error,
}

impl DeploymentStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Reconciling => "reconciling",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspecified" => Ok(Self::Unspecified),
            "pending" => Ok(Self::Pending),
            "ok" => Ok(Self::Ok),
            "reconciling" => Ok(Self::Reconciling),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// Connection details of the runtime instance serving a deployment.
///
/// Grouped so a deployment can never carry a partial endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEndpoint {
    /// Base URL of the runtime.
    pub host: String,
    /// Instance created on the runtime for this deployment.
    pub instance_id: String,
    /// Audience for tokens presented to the runtime.
    pub audience: String,
}

/// A provisioned runtime instance serving a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub project_id: ProjectId,
    pub provisioner: String,
    pub slots: u32,
    pub branch: String,
    pub runtime: RuntimeEndpoint,
    pub status: DeploymentStatus,
    /// Logs from the last reconcile.
    pub status_message: String,
    pub created_on: DateTime<Utc>,
    /// Also the staleness clock for in-flight reconciles.
    pub updated_on: DateTime<Utc>,
    /// Last recorded use. Idle time for hibernation counts from here.
    pub used_on: DateTime<Utc>,
}

impl Deployment {
    /// Build a pending deployment for a project.
    #[must_use]
    pub fn pending(id: DeploymentId, project: &Project, runtime: RuntimeEndpoint) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id: project.id.clone(),
            provisioner: project.provisioner.clone(),
            slots: project.prod_slots,
            branch: project.prod_branch.clone(),
            runtime,
            status: DeploymentStatus::Pending,
            status_message: String::new(),
            created_on: now,
            updated_on: now,
            used_on: now,
        }
    }
}
