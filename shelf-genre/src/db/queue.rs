//! SQLite work queue with visibility leases
//!
//! A received message stays in the table with `visible_at` pushed past the
//! lease; if the worker never acks it, it reappears for another worker.
//! Every receive bumps `deliveries`, which drives dead-lettering.

use super::WorkQueue;
use crate::models::WorkMessage;
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelf_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

/// A leased message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub message: WorkMessage,
    /// Receive count including this one
    pub deliveries: u32,
    /// Identifies this lease; ack/release from an expired lease are ignored
    pub lease_token: Uuid,
}

/// A message that exhausted its deliveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub message: WorkMessage,
    pub deliveries: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

pub struct SqliteWorkQueue {
    pool: SqlitePool,
}

impl SqliteWorkQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Internal(format!("Invalid {} '{}': {}", what, raw, e)))
}

fn decode_message(message_id: &str, body: &str) -> Result<WorkMessage> {
    serde_json::from_str(body)
        .map_err(|e| Error::Internal(format!("Corrupt queue message '{}': {}", message_id, e)))
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn publish(&self, message: &WorkMessage) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let message_id = message.message_id.to_string();
        let job_id = message.job_id.to_string();
        let enqueued_at = Utc::now().to_rfc3339();

        retry_on_lock("queue publish", DEFAULT_MAX_LOCK_WAIT, || async {
            sqlx::query(
                r#"
                INSERT INTO work_queue (message_id, job_id, body, deliveries, visible_at, enqueued_at)
                VALUES (?, ?, ?, 0, ?, ?)
                "#,
            )
            .bind(&message_id)
            .bind(&job_id)
            .bind(&body)
            .bind(now_millis())
            .bind(&enqueued_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            message_id = %message.message_id,
            job_id = %message.job_id,
            items = message.requests.len(),
            "Published work message"
        );
        Ok(())
    }

    async fn receive(&self, lease: Duration) -> Result<Option<Delivery>> {
        let lease_ms = millis(lease);

        let row = retry_on_lock("queue receive", DEFAULT_MAX_LOCK_WAIT, || async {
            let now = now_millis();
            let token = Uuid::new_v4().to_string();
            let row = sqlx::query(
                r#"
                UPDATE work_queue
                SET visible_at = ?, lease_token = ?, deliveries = deliveries + 1
                WHERE message_id = (
                    SELECT message_id FROM work_queue
                    WHERE visible_at <= ?
                    ORDER BY visible_at, enqueued_at
                    LIMIT 1
                )
                RETURNING message_id, job_id, body, deliveries, lease_token
                "#,
            )
            .bind(now.saturating_add(lease_ms))
            .bind(&token)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let message_id: String = row.get("message_id");
        let job_id: String = row.get("job_id");
        let body: String = row.get("body");
        let deliveries: i64 = row.get("deliveries");
        let lease_token: String = row.get("lease_token");

        Ok(Some(Delivery {
            message_id: parse_uuid(&message_id, "message id")?,
            job_id: parse_uuid(&job_id, "job id")?,
            message: decode_message(&message_id, &body)?,
            deliveries: deliveries.max(0) as u32,
            lease_token: parse_uuid(&lease_token, "lease token")?,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let message_id = delivery.message_id.to_string();
        let token = delivery.lease_token.to_string();

        retry_on_lock("queue ack", DEFAULT_MAX_LOCK_WAIT, || async {
            let result =
                sqlx::query("DELETE FROM work_queue WHERE message_id = ? AND lease_token = ?")
                    .bind(&message_id)
                    .bind(&token)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<bool> {
        let message_id = delivery.message_id.to_string();
        let token = delivery.lease_token.to_string();
        let delay_ms = millis(delay);

        retry_on_lock("queue release", DEFAULT_MAX_LOCK_WAIT, || async {
            let result = sqlx::query(
                r#"
                UPDATE work_queue SET visible_at = ?, lease_token = NULL
                WHERE message_id = ? AND lease_token = ?
                "#,
            )
            .bind(now_millis().saturating_add(delay_ms))
            .bind(&message_id)
            .bind(&token)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let message_id = delivery.message_id.to_string();
        let job_id = delivery.job_id.to_string();
        let body = serde_json::to_string(&delivery.message)?;
        let dead_lettered_at = Utc::now().to_rfc3339();

        retry_on_lock("queue dead_letter", DEFAULT_MAX_LOCK_WAIT, || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO dead_letters (message_id, job_id, body, deliveries, reason, dead_lettered_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(message_id) DO NOTHING
                "#,
            )
            .bind(&message_id)
            .bind(&job_id)
            .bind(&body)
            .bind(delivery.deliveries as i64)
            .bind(reason)
            .bind(&dead_lettered_at)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM work_queue WHERE message_id = ?")
                .bind(&message_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::warn!(
            message_id = %delivery.message_id,
            job_id = %delivery.job_id,
            deliveries = delivery.deliveries,
            reason,
            "Message moved to dead-letter table"
        );
        Ok(())
    }

    async fn depth(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn dead_letters(&self, job_id: Uuid) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, job_id, body, deliveries, reason, dead_lettered_at
            FROM dead_letters WHERE job_id = ? ORDER BY dead_lettered_at
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let message_id: String = row.get("message_id");
                let job_id: String = row.get("job_id");
                let body: String = row.get("body");
                let deliveries: i64 = row.get("deliveries");
                let dead_lettered_at: String = row.get("dead_lettered_at");
                Ok(DeadLetter {
                    message_id: parse_uuid(&message_id, "message id")?,
                    job_id: parse_uuid(&job_id, "job id")?,
                    message: decode_message(&message_id, &body)?,
                    deliveries: deliveries.max(0) as u32,
                    reason: row.get("reason"),
                    dead_lettered_at: DateTime::parse_from_rfc3339(&dead_lettered_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| Error::Internal(format!("Invalid timestamp: {}", e)))?,
                })
            })
            .collect()
    }
}
