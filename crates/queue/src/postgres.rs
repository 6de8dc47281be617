//! Postgres-backed job store.
//!
//! Claiming is the one operation with a real race to lose: two workers
//! polling the same table must never both win the same row. The claim here
//! is a single `UPDATE … WHERE id IN (SELECT … FOR UPDATE SKIP LOCKED
//! LIMIT 1) RETURNING` statement, so selection and mutation commit together
//! and a losing worker simply sees no row rather than an error.
//!
//! The dead-letter move (delete the job row, insert the failure record) runs
//! in one transaction; if the row is already gone the transaction inserts
//! nothing, preserving the silent no-op contract.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use pagesmith_core::{FailedJobId, JobId, WorkerId};

use crate::store::{JobStore, StoreError};
use crate::types::{
    FailedJob, FailedJobFilter, Job, JobCounts, JobFilter, JobStatus, NewJob, Page,
};

/// Table DDL. `id` is a BIGSERIAL so ids are monotonically increasing and
/// the claim tie-break can order by insertion.
const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    payload TEXT NOT NULL,
    queue TEXT NOT NULL DEFAULT 'default',
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued',
    run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    locked_at TIMESTAMPTZ,
    locked_by TEXT,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs (status, run_at, priority, id);

CREATE TABLE IF NOT EXISTS failed_jobs (
    uuid UUID PRIMARY KEY,
    name TEXT NOT NULL,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    exception TEXT NOT NULL,
    failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

const JOB_COLUMNS: &str = "id, name, payload, queue, priority, status, run_at, \
     attempts, max_attempts, locked_at, locked_by, last_error, created_at";

/// Postgres job store.
///
/// Shares a SQLx connection pool; `Send + Sync`, cheap to clone.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the job-table DDL. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATION_SQL.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("{operation}: {err}"))
}

#[derive(Debug)]
struct JobRow {
    id: i64,
    name: String,
    payload: String,
    queue: String,
    priority: i32,
    status: String,
    run_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            payload: row.try_get("payload")?,
            queue: row.try_get("queue")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            run_at: row.try_get("run_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status)
            .map_err(|e| StoreError::Decode(format!("job {}: {e}", row.id)))?;
        Ok(Job {
            id: JobId::from_i64(row.id),
            name: row.name,
            payload: row.payload,
            queue: row.queue,
            priority: row.priority,
            status,
            run_at: row.run_at,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            locked_at: row.locked_at,
            locked_by: row.locked_by.map(WorkerId::new),
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct FailedJobRow {
    uuid: uuid::Uuid,
    name: String,
    queue: String,
    payload: String,
    exception: String,
    failed_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for FailedJobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(FailedJobRow {
            uuid: row.try_get("uuid")?,
            name: row.try_get("name")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            exception: row.try_get("exception")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

impl From<FailedJobRow> for FailedJob {
    fn from(row: FailedJobRow) -> Self {
        FailedJob {
            uuid: FailedJobId::from_uuid(row.uuid),
            name: row.name,
            queue: row.queue,
            payload: row.payload,
            exception: row.exception,
            failed_at: row.failed_at,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(name = %job.name, queue = %job.queue), err)]
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (name, payload, queue, priority, status, run_at, max_attempts)
            VALUES ($1, $2, $3, $4, 'queued', $5, $6)
            RETURNING id
            "#,
        )
        .bind(&job.name)
        .bind(&job.payload)
        .bind(&job.queue)
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.max_attempts)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        Ok(JobId::from_i64(id))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id.as_i64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let lease_expiry = now - chrono::Duration::from_std(lease).unwrap_or_default();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                locked_at = $1,
                locked_by = $2,
                attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM jobs
                WHERE status <> 'completed'
                  AND run_at <= $1
                  AND (locked_at IS NULL OR locked_at < $3)
                ORDER BY run_at ASC, priority DESC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(worker.as_str())
        .bind(lease_expiry)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(Job::try_from).transpose()
    }

    async fn mark_completed(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE jobs SET status = 'completed' WHERE id = $1")
            .bind(id.as_i64())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_completed", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn requeue(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                run_at = $2,
                locked_at = NULL,
                locked_by = NULL,
                last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .bind(run_at)
        .bind(last_error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, entry), fields(name = %entry.name), err)]
    async fn move_to_dead_letter(&self, id: JobId, entry: FailedJob) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;

        let deleted = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;

        if deleted.rows_affected() == 0 {
            // Already completed or dead-lettered by a racing caller.
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO failed_jobs (uuid, name, queue, payload, exception, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.uuid.as_uuid())
        .bind(&entry.name)
        .bind(&entry.queue)
        .bind(&entry.payload)
        .bind(&entry.exception)
        .bind(entry.failed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("move_to_dead_letter", e))?;

        Ok(true)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Page<Job>, StoreError> {
        let status = filter.status.map(|s| s.as_str());
        let queue = filter.queue.as_deref();

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR queue = $2)
            "#,
        )
        .bind(status)
        .bind(queue)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR queue = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(status)
        .bind(queue)
        .bind(filter.pagination.limit as i64)
        .bind(filter.pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let items = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more =
            total as u64 > (filter.pagination.offset + filter.pagination.limit) as u64;

        Ok(Page {
            items,
            total: total as u64,
            has_more,
        })
    }

    async fn list_failed(&self, filter: &FailedJobFilter) -> Result<Page<FailedJob>, StoreError> {
        let queue = filter.queue.as_deref();

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM failed_jobs WHERE ($1::text IS NULL OR queue = $1)",
        )
        .bind(queue)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_failed", e))?;

        let rows = sqlx::query_as::<_, FailedJobRow>(
            r#"
            SELECT uuid, name, queue, payload, exception, failed_at
            FROM failed_jobs
            WHERE ($1::text IS NULL OR queue = $1)
            ORDER BY failed_at DESC, uuid DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(queue)
        .bind(filter.pagination.limit as i64)
        .bind(filter.pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_failed", e))?;

        let items = rows.into_iter().map(FailedJob::from).collect();
        let has_more =
            total as u64 > (filter.pagination.offset + filter.pagination.limit) as u64;

        Ok(Page {
            items,
            total: total as u64,
            has_more,
        })
    }

    async fn get_failed(&self, id: FailedJobId) -> Result<Option<FailedJob>, StoreError> {
        let row = sqlx::query_as::<_, FailedJobRow>(
            r#"
            SELECT uuid, name, queue, payload, exception, failed_at
            FROM failed_jobs
            WHERE uuid = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_failed", e))?;

        Ok(row.map(FailedJob::from))
    }

    async fn delete_failed(&self, id: FailedJobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM failed_jobs WHERE uuid = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_failed", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            match JobStatus::from_str(&status) {
                Ok(JobStatus::Queued) => counts.queued = total as u64,
                Ok(JobStatus::Processing) => counts.processing = total as u64,
                Ok(JobStatus::Completed) => counts.completed = total as u64,
                Err(e) => return Err(StoreError::Decode(e.to_string())),
            }
        }

        let dead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failed_jobs")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts", e))?;
        counts.dead_lettered = dead as u64;

        Ok(counts)
    }

    async fn purge_completed(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status = 'completed' AND created_at < $1",
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_completed", e))?;

        Ok(result.rows_affected())
    }
}
