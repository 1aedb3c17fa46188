//! Queue stored in a Postgres table, claimed with `FOR UPDATE SKIP LOCKED`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::config::QueueConfig;
use crate::error::{ControlError, ControlResult};

use super::{retry_delay, InsertResult, JobQueue, QueueHandler, QueueJob};

/// How long a claimed job stays invisible to other consumers. A consumer
/// that dies mid-job releases it once this passes.
const CLAIM_LEASE: Duration = Duration::from_secs(60 * 60);

/// Postgres-backed queue. Several processes may consume the same table.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    handler: Arc<dyn QueueHandler>,
    config: QueueConfig,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, handler: Arc<dyn QueueHandler>, config: QueueConfig) -> ControlResult<Self> {
        let valid = !config.table.is_empty()
            && config
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(ControlError::Config(format!(
                "invalid queue table name {:?}",
                config.table
            )));
        }
        Ok(Self {
            pool,
            handler,
            config,
        })
    }

    fn table(&self) -> &str {
        &self.config.table
    }

    async fn claim(&self) -> ControlResult<Option<(i64, QueueJob, u32)>> {
        let query = format!(
            r#"
            UPDATE {table}
            SET run_at = NOW() + ($1 * INTERVAL '1 second'),
                attempt = attempt + 1
            WHERE id = (
                SELECT id FROM {table}
                WHERE status = 'pending' AND run_at <= NOW()
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempt
            "#,
            table = self.table()
        );

        let Some(row) = sqlx::query(&query)
            .bind(CLAIM_LEASE.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let attempt: i32 = row.try_get("attempt")?;
        let attempt = u32::try_from(attempt).unwrap_or(0);

        match row.try_get::<Json<QueueJob>, _>("payload") {
            Ok(Json(job)) => Ok(Some((id, job, attempt))),
            Err(e) => {
                error!(id, error = %e, "discarding job with unreadable payload");
                self.mark_failed(id, &e.to_string()).await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, id: i64) -> ControlResult<()> {
        let query = format!("DELETE FROM {} WHERE id = $1", self.table());
        sqlx::query(&query).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, message: &str) -> ControlResult<()> {
        let query = format!(
            "UPDATE {} SET status = 'failed', last_error = $2 WHERE id = $1",
            self.table()
        );
        sqlx::query(&query)
            .bind(id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn schedule_retry(&self, id: i64, delay: Duration, message: &str) -> ControlResult<()> {
        let query = format!(
            "UPDATE {} SET run_at = NOW() + ($2 * INTERVAL '1 second'), last_error = $3 WHERE id = $1",
            self.table()
        );
        sqlx::query(&query)
            .bind(id)
            .bind(delay.as_secs_f64())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn process(&self, id: i64, job: QueueJob, attempt: u32) -> ControlResult<()> {
        match self.handler.handle(&job).await {
            Ok(()) => {
                counter!("tessera.queue.jobs", "kind" => job.kind(), "outcome" => "ok").increment(1);
                debug!(attempt, "job completed");
                self.complete(id).await
            }
            Err(e) if attempt >= self.config.max_attempts => {
                counter!("tessera.queue.jobs", "kind" => job.kind(), "outcome" => "failed")
                    .increment(1);
                error!(attempt, error = %e, "job failed permanently");
                self.mark_failed(id, &e.to_string()).await
            }
            Err(e) => {
                let delay = retry_delay(self.config.retry_delay(), attempt);
                counter!("tessera.queue.jobs", "kind" => job.kind(), "outcome" => "retry")
                    .increment(1);
                warn!(attempt, retry_in = ?delay, error = %e, "job failed, will retry");
                self.schedule_retry(id, delay, &e.to_string()).await
            }
        }
    }
}

#[async_trait]
impl JobQueue for PostgresQueue {
    async fn migrate(&self) -> ControlResult<()> {
        let table = self.table();
        let index_prefix = table.replace('.', "_");
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id BIGSERIAL PRIMARY KEY,
                    kind TEXT NOT NULL,
                    unique_key TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempt INT NOT NULL DEFAULT 0,
                    last_error TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    run_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
            ),
            format!(
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS idx_{index_prefix}_unique_pending
                ON {table} (unique_key)
                WHERE status = 'pending'
                "#
            ),
            format!(
                r#"
                CREATE INDEX IF NOT EXISTS idx_{index_prefix}_claim
                ON {table} (run_at)
                WHERE status = 'pending'
                "#
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn enqueue(&self, job: QueueJob) -> ControlResult<InsertResult> {
        let key = job.unique_key();
        let insert = format!(
            r#"
            INSERT INTO {} (kind, unique_key, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (unique_key) WHERE status = 'pending' DO NOTHING
            RETURNING id
            "#,
            self.table()
        );

        let inserted = sqlx::query(&insert)
            .bind(job.kind())
            .bind(&key)
            .bind(Json(&job))
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = inserted {
            return Ok(InsertResult {
                id: row.try_get("id")?,
                duplicate: false,
            });
        }

        let existing = format!(
            "SELECT id FROM {} WHERE unique_key = $1 AND status = 'pending'",
            self.table()
        );
        let row = sqlx::query(&existing)
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                ControlError::queue(format!("job {key} conflicted but is no longer pending"))
            })?;
        Ok(InsertResult {
            id: row.try_get("id")?,
            duplicate: true,
        })
    }

    async fn work(&self, cancel: CancellationToken) -> ControlResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let claimed = match self.claim().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(error = %e, "could not claim job");
                    None
                }
            };

            match claimed {
                Some((id, job, attempt)) => {
                    let span = info_span!("queue_job", id, kind = job.kind());
                    if let Err(e) = self.process(id, job, attempt).instrument(span).await {
                        warn!(id, error = %e, "could not record job result");
                    }
                }
                None => {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
