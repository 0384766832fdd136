//! Table definitions for the queue, blob store and job records

use shelf_common::Result;
use sqlx::SqlitePool;

const CREATE_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        job_id TEXT PRIMARY KEY,
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'processing', 'complete', 'error')),
        total_items INTEGER NOT NULL,
        completed_items INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
    r#"
    CREATE TABLE IF NOT EXISTS blobs (
        key TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS work_queue (
        message_id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        body TEXT NOT NULL,
        deliveries INTEGER NOT NULL DEFAULT 0,
        visible_at INTEGER NOT NULL,
        lease_token TEXT,
        enqueued_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_work_queue_visible ON work_queue(visible_at)",
    "CREATE INDEX IF NOT EXISTS idx_work_queue_job ON work_queue(job_id)",
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        message_id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        body TEXT NOT NULL,
        deliveries INTEGER NOT NULL,
        reason TEXT NOT NULL,
        dead_lettered_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_dead_letters_job ON dead_letters(job_id)",
];

/// Create every table and index if missing
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    for statement in CREATE_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!("Database tables initialized (jobs, blobs, work_queue, dead_letters)");
    Ok(())
}
