//! PostgreSQL store implementation.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::{
    Deployment, DeploymentId, DeploymentStatus, MemberRef, Organization, OrganizationId, Project,
    ProjectId, ProjectMember, RuntimeEndpoint, UpdateProjectOptions, UsergroupId, UserId,
};

use super::{ProjectCursor, Store};

const PROJECT_COLUMNS: &str = "id, organization_id, name, git_url, prod_branch, prod_slots, \
     prod_olap_driver, provisioner, annotations, prod_deployment_id, prod_ttl_seconds, \
     created_on, updated_on";

const DEPLOYMENT_COLUMNS: &str = "id, project_id, provisioner, slots, branch, runtime_host, \
     runtime_instance_id, runtime_audience, status, status_message, created_on, updated_on, \
     used_on";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn connect(url: &str, config: &DatabaseConfig) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// The underlying pool, shared with the job queue.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                all_usergroup_id TEXT,
                created_on TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL REFERENCES organizations(id),
                name TEXT NOT NULL,
                git_url TEXT,
                prod_branch TEXT NOT NULL,
                prod_slots INTEGER NOT NULL,
                prod_olap_driver TEXT NOT NULL,
                provisioner TEXT NOT NULL,
                annotations JSONB NOT NULL DEFAULT '{}',
                prod_deployment_id TEXT,
                prod_ttl_seconds BIGINT,
                created_on TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_on TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (organization_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_members (
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                user_id TEXT,
                usergroup_id TEXT,
                role TEXT NOT NULL,
                CHECK ((user_id IS NULL) <> (usergroup_id IS NULL))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                provisioner TEXT NOT NULL,
                slots INTEGER NOT NULL,
                branch TEXT NOT NULL,
                runtime_host TEXT NOT NULL,
                runtime_instance_id TEXT NOT NULL,
                runtime_audience TEXT NOT NULL,
                status TEXT NOT NULL,
                status_message TEXT NOT NULL DEFAULT '',
                created_on TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_on TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                used_on TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "ALTER TABLE deployments \
             ADD COLUMN IF NOT EXISTS used_on TIMESTAMPTZ NOT NULL DEFAULT NOW()",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_project
            ON deployments (project_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_organization(row: &PgRow) -> Organization {
        let all_usergroup_id: Option<String> = row.get("all_usergroup_id");
        Organization {
            id: OrganizationId::new(row.get::<String, _>("id")),
            name: row.get("name"),
            all_usergroup_id: all_usergroup_id.map(UsergroupId::new),
            created_on: row.get("created_on"),
        }
    }

    fn row_to_project(row: &PgRow) -> ControlResult<Project> {
        let annotations: serde_json::Value = row.get("annotations");
        let annotations: BTreeMap<String, String> = serde_json::from_value(annotations)
            .map_err(|e| {
                ControlError::Serialisation(format!("failed to deserialise annotations: {e}"))
            })?;
        let prod_deployment_id: Option<String> = row.get("prod_deployment_id");

        Ok(Project {
            id: ProjectId::new(row.get::<String, _>("id")),
            organization_id: OrganizationId::new(row.get::<String, _>("organization_id")),
            name: row.get("name"),
            git_url: row.get("git_url"),
            prod_branch: row.get("prod_branch"),
            prod_slots: to_slots(row.get("prod_slots"))?,
            prod_olap_driver: row.get("prod_olap_driver"),
            provisioner: row.get("provisioner"),
            annotations,
            prod_deployment_id: prod_deployment_id.map(DeploymentId::new),
            prod_ttl_seconds: row.get("prod_ttl_seconds"),
            created_on: row.get("created_on"),
            updated_on: row.get("updated_on"),
        })
    }

    fn row_to_deployment(row: &PgRow) -> ControlResult<Deployment> {
        let status: String = row.get("status");
        let status: DeploymentStatus = status.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status}': {e}"))
        })?;

        Ok(Deployment {
            id: DeploymentId::new(row.get::<String, _>("id")),
            project_id: ProjectId::new(row.get::<String, _>("project_id")),
            provisioner: row.get("provisioner"),
            slots: to_slots(row.get("slots"))?,
            branch: row.get("branch"),
            runtime: RuntimeEndpoint {
                host: row.get("runtime_host"),
                instance_id: row.get("runtime_instance_id"),
                audience: row.get("runtime_audience"),
            },
            status,
            status_message: row.get("status_message"),
            created_on: row.get("created_on"),
            updated_on: row.get("updated_on"),
            used_on: row.get("used_on"),
        })
    }

    async fn project_exists(&self, id: &ProjectId) -> ControlResult<bool> {
        let row = sqlx::query("SELECT 1 FROM projects WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn to_slots(value: i32) -> ControlResult<u32> {
    u32::try_from(value)
        .map_err(|_| ControlError::Serialisation(format!("negative slot count {value}")))
}

fn from_slots(value: u32) -> ControlResult<i32> {
    i32::try_from(value)
        .map_err(|_| ControlError::Serialisation(format!("slot count {value} out of range")))
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_organization(&self, org: &Organization) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, all_usergroup_id, created_on)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(org.id.as_str())
        .bind(&org.name)
        .bind(org.all_usergroup_id.as_ref().map(UsergroupId::as_str))
        .bind(org.created_on)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_organization(&self, id: &OrganizationId) -> ControlResult<Organization> {
        let row = sqlx::query(
            "SELECT id, name, all_usergroup_id, created_on FROM organizations WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(Self::row_to_organization)
            .ok_or_else(|| ControlError::not_found("organization", id))
    }

    async fn delete_organization(&self, id: &OrganizationId) -> ControlResult<()> {
        let result = sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found("organization", id));
        }
        Ok(())
    }

    async fn create_project(
        &self,
        project: &Project,
        members: &[ProjectMember],
    ) -> ControlResult<()> {
        let annotations = serde_json::to_value(&project.annotations).map_err(|e| {
            ControlError::Serialisation(format!("failed to serialise annotations: {e}"))
        })?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO projects ({PROJECT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(project.id.as_str())
        .bind(project.organization_id.as_str())
        .bind(&project.name)
        .bind(project.git_url.as_deref())
        .bind(&project.prod_branch)
        .bind(from_slots(project.prod_slots)?)
        .bind(&project.prod_olap_driver)
        .bind(&project.provisioner)
        .bind(annotations)
        .bind(project.prod_deployment_id.as_ref().map(DeploymentId::as_str))
        .bind(project.prod_ttl_seconds)
        .bind(project.created_on)
        .bind(project.updated_on)
        .execute(&mut *tx)
        .await?;

        for member in members {
            let (user_id, usergroup_id) = match &member.member {
                MemberRef::User(id) => (Some(id.as_str()), None),
                MemberRef::Usergroup(id) => (None, Some(id.as_str())),
            };
            sqlx::query(
                r#"
                INSERT INTO project_members (project_id, user_id, usergroup_id, role)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(project.id.as_str())
            .bind(user_id)
            .bind(usergroup_id)
            .bind(member.role.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_project(&self, id: &ProjectId) -> ControlResult<Project> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_project(&row),
            None => Err(ControlError::not_found("project", id)),
        }
    }

    async fn list_projects(
        &self,
        after: Option<&ProjectCursor>,
        limit: u32,
    ) -> ControlResult<Vec<Project>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects \
             WHERE $1::text IS NULL OR (name, id) > ($1, $2) \
             ORDER BY name, id LIMIT $3"
        ))
        .bind(after.map(|c| c.name.as_str()))
        .bind(after.map(|c| c.id.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_project).collect()
    }

    async fn update_project(
        &self,
        id: &ProjectId,
        opts: &UpdateProjectOptions,
    ) -> ControlResult<Project> {
        let row = sqlx::query(&format!(
            "UPDATE projects SET name = $2, git_url = $3, prod_branch = $4, \
             prod_ttl_seconds = $5, updated_on = NOW() \
             WHERE id = $1 RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(&opts.name)
        .bind(opts.git_url.as_deref())
        .bind(&opts.prod_branch)
        .bind(opts.prod_ttl_seconds)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_project(&row),
            None => Err(ControlError::not_found("project", id)),
        }
    }

    async fn find_projects_for_organization(
        &self,
        org: &OrganizationId,
    ) -> ControlResult<Vec<Project>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE organization_id = $1 ORDER BY name"
        ))
        .bind(org.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_project).collect()
    }

    async fn find_project_members(&self, id: &ProjectId) -> ControlResult<Vec<ProjectMember>> {
        let rows = sqlx::query(
            "SELECT user_id, usergroup_id, role FROM project_members WHERE project_id = $1",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let user_id: Option<String> = row.get("user_id");
                let usergroup_id: Option<String> = row.get("usergroup_id");
                let role: String = row.get("role");
                let role = role.parse().map_err(ControlError::Serialisation)?;
                let member = match (user_id, usergroup_id) {
                    (Some(id), _) => MemberRef::User(UserId::new(id)),
                    (None, Some(id)) => MemberRef::Usergroup(UsergroupId::new(id)),
                    (None, None) => {
                        return Err(ControlError::Serialisation(
                            "project member without user or group".to_owned(),
                        ))
                    }
                };
                Ok(ProjectMember { member, role })
            })
            .collect()
    }

    async fn swap_prod_deployment(
        &self,
        project: &ProjectId,
        expected: Option<&DeploymentId>,
        new: Option<&DeploymentId>,
    ) -> ControlResult<Project> {
        let row = sqlx::query(&format!(
            "UPDATE projects SET prod_deployment_id = $3, updated_on = NOW() \
             WHERE id = $1 \
               AND prod_deployment_id IS NOT DISTINCT FROM $2 \
               AND ($3::text IS NULL OR EXISTS ( \
                   SELECT 1 FROM deployments d WHERE d.id = $3 AND d.project_id = $1)) \
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(project.as_str())
        .bind(expected.map(DeploymentId::as_str))
        .bind(new.map(DeploymentId::as_str))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_project(&row),
            None if !self.project_exists(project).await? => {
                Err(ControlError::not_found("project", project))
            }
            None => Err(ControlError::ProdDeploymentConflict {
                project: project.to_string(),
            }),
        }
    }

    async fn delete_project(&self, id: &ProjectId) -> ControlResult<()> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found("project", id));
        }
        Ok(())
    }

    async fn insert_deployment(&self, deployment: &Deployment) -> ControlResult<()> {
        sqlx::query(&format!(
            "INSERT INTO deployments ({DEPLOYMENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(deployment.id.as_str())
        .bind(deployment.project_id.as_str())
        .bind(&deployment.provisioner)
        .bind(from_slots(deployment.slots)?)
        .bind(&deployment.branch)
        .bind(&deployment.runtime.host)
        .bind(&deployment.runtime.instance_id)
        .bind(&deployment.runtime.audience)
        .bind(deployment.status.as_str())
        .bind(&deployment.status_message)
        .bind(deployment.created_on)
        .bind(deployment.updated_on)
        .bind(deployment.used_on)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_deployment(&self, id: &DeploymentId) -> ControlResult<Deployment> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_deployment(&row),
            None => Err(ControlError::not_found("deployment", id)),
        }
    }

    async fn find_deployments_for_project(
        &self,
        id: &ProjectId,
    ) -> ControlResult<Vec<Deployment>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE project_id = $1 ORDER BY created_on"
        ))
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn update_deployment_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        logs: &str,
    ) -> ControlResult<Deployment> {
        let row = sqlx::query(&format!(
            "UPDATE deployments SET status = $2, status_message = $3, updated_on = NOW() \
             WHERE id = $1 RETURNING {DEPLOYMENT_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(status.as_str())
        .bind(logs)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_deployment(&row),
            None => Err(ControlError::not_found("deployment", id)),
        }
    }

    async fn update_deployment_branch(
        &self,
        id: &DeploymentId,
        branch: &str,
    ) -> ControlResult<Deployment> {
        let row = sqlx::query(&format!(
            "UPDATE deployments SET branch = $2, updated_on = NOW() \
             WHERE id = $1 RETURNING {DEPLOYMENT_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(branch)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_deployment(&row),
            None => Err(ControlError::not_found("deployment", id)),
        }
    }

    async fn mark_deployment_used(&self, id: &DeploymentId) -> ControlResult<Deployment> {
        let row = sqlx::query(&format!(
            "UPDATE deployments SET used_on = NOW() WHERE id = $1 RETURNING {DEPLOYMENT_COLUMNS}"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_deployment(&row),
            None => Err(ControlError::not_found("deployment", id)),
        }
    }

    async fn try_start_reconcile(
        &self,
        id: &DeploymentId,
        stale_after: Duration,
    ) -> ControlResult<Option<Deployment>> {
        let cutoff: DateTime<Utc> = Utc::now()
            .checked_sub_signed(super::stale_after(stale_after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let row = sqlx::query(&format!(
            "UPDATE deployments SET status = $2, updated_on = NOW() \
             WHERE id = $1 AND (status <> $2 OR updated_on < $3) \
             RETURNING {DEPLOYMENT_COLUMNS}"
        ))
        .bind(id.as_str())
        .bind(DeploymentStatus::Reconciling.as_str())
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_deployment(&row).map(Some),
            None => {
                // Distinguish a held claim from a missing row.
                self.find_deployment(id).await?;
                Ok(None)
            }
        }
    }

    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE projects SET prod_deployment_id = NULL, updated_on = NOW() \
             WHERE prod_deployment_id = $1",
        )
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found("deployment", id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn runtime_slots_used(&self) -> ControlResult<HashMap<String, u32>> {
        let rows = sqlx::query(
            "SELECT runtime_host, SUM(slots)::BIGINT AS used FROM deployments GROUP BY runtime_host",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let host: String = row.get("runtime_host");
                let used: i64 = row.get("used");
                let used = u32::try_from(used).map_err(|_| {
                    ControlError::Serialisation(format!("slot total {used} out of range"))
                })?;
                Ok((host, used))
            })
            .collect()
    }
}
