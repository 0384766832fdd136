//! SQLite job status records
//!
//! Status changes go through a single conditional `UPDATE … WHERE status = ?`,
//! so two aggregator passes racing on the same job cannot both win.

use super::JobStore;
use crate::models::{Job, JobStatus};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shelf_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp '{}': {}", raw, e)))
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let job_id: String = row.get("job_id");
    let status: String = row.get("status");
    let total_items: i64 = row.get("total_items");
    let completed_items: i64 = row.get("completed_items");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Job {
        job_id: Uuid::parse_str(&job_id)
            .map_err(|e| Error::Internal(format!("Invalid job id '{}': {}", job_id, e)))?,
        status: status.parse()?,
        total_items: total_items.max(0) as usize,
        completed_items: completed_items.max(0) as usize,
        error_message: row.get("error_message"),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

const SELECT_JOB: &str = "SELECT job_id, status, total_items, completed_items, error_message, created_at, updated_at FROM jobs";

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let job_id = job.job_id.to_string();
        let created_at = job.created_at.to_rfc3339();
        let updated_at = job.updated_at.to_rfc3339();

        retry_on_lock("job create", DEFAULT_MAX_LOCK_WAIT, || async {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    job_id, status, total_items, completed_items,
                    error_message, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job_id)
            .bind(job.status.as_str())
            .bind(job.total_items as i64)
            .bind(job.completed_items as i64)
            .bind(&job.error_message)
            .bind(&created_at)
            .bind(&updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("{} WHERE job_id = ?", SELECT_JOB))
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!("{} WHERE status = ? ORDER BY created_at", SELECT_JOB))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidInput(format!(
                "Job status cannot move from {} to {}",
                from, to
            )));
        }

        let id = job_id.to_string();
        let updated_at = Utc::now().to_rfc3339();

        let changed = retry_on_lock("job transition", DEFAULT_MAX_LOCK_WAIT, || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET status = ?, error_message = COALESCE(?, error_message), updated_at = ?
                WHERE job_id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(error_message)
            .bind(&updated_at)
            .bind(&id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await?;

        if changed {
            tracing::info!(job_id = %job_id, from = %from, to = %to, "Job status changed");
        } else {
            tracing::debug!(
                job_id = %job_id,
                from = %from,
                to = %to,
                "Job status change skipped; status no longer matches"
            );
        }
        Ok(changed)
    }

    async fn record_progress(&self, job_id: Uuid, completed_items: usize) -> Result<()> {
        let id = job_id.to_string();
        let updated_at = Utc::now().to_rfc3339();

        retry_on_lock("job progress", DEFAULT_MAX_LOCK_WAIT, || async {
            sqlx::query(
                r#"
                UPDATE jobs SET completed_items = ?, updated_at = ?
                WHERE job_id = ? AND status = 'processing' AND completed_items != ?
                "#,
            )
            .bind(completed_items as i64)
            .bind(&updated_at)
            .bind(&id)
            .bind(completed_items as i64)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}
