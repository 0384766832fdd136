//! Persistence substrate: blob store, job records and work queue
//!
//! Each concern sits behind an async trait; the SQLite implementations in
//! the submodules share one pool. Workflow code only sees the traits.

pub mod blobs;
pub mod jobs;
pub mod keys;
pub mod queue;
pub mod schema;

pub use blobs::SqliteBlobStore;
pub use jobs::SqliteJobStore;
pub use queue::{DeadLetter, Delivery, SqliteWorkQueue};
pub use schema::init_tables;

use crate::models::{Job, JobStatus, WorkMessage};
use async_trait::async_trait;
use shelf_common::Result;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Key-value blob store
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `body` under `key`, replacing any previous value
    async fn put(&self, key: &str, body: &str) -> Result<()>;

    /// Write only if `key` is unused; `true` when this call wrote it
    async fn put_if_absent(&self, key: &str, body: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn count_prefix(&self, prefix: &str) -> Result<usize>;

    /// `(key, body)` pairs under `prefix`, ordered by key
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Delete everything under `prefix`; returns the number removed
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Delete one key; `true` when it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Job status records
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Compare-and-set status change
    ///
    /// Succeeds (`true`) only when the stored status still equals `from`.
    /// Transitions not allowed by [`JobStatus::can_transition_to`] are
    /// rejected before touching the store.
    async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;

    /// Refresh `completed_items` on a processing job
    async fn record_progress(&self, job_id: Uuid, completed_items: usize) -> Result<()>;
}

/// At-least-once work queue with leases
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, message: &WorkMessage) -> Result<()>;

    /// Lease the next visible message for `lease`, bumping its delivery count
    async fn receive(&self, lease: Duration) -> Result<Option<Delivery>>;

    /// Remove a message after successful processing; `false` if the lease was lost
    async fn ack(&self, delivery: &Delivery) -> Result<bool>;

    /// Give a message back, visible again after `delay`
    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<bool>;

    /// Move a message to the dead-letter table
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()>;

    /// Messages still queued or leased
    async fn depth(&self) -> Result<usize>;

    async fn dead_letters(&self, job_id: Uuid) -> Result<Vec<DeadLetter>>;
}

/// The three stores, shared by distributor, workers and aggregator
#[derive(Clone)]
pub struct Stores {
    pub blobs: Arc<dyn BlobStore>,
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn WorkQueue>,
}

impl Stores {
    /// SQLite-backed stores on one pool
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self {
            blobs: Arc::new(SqliteBlobStore::new(pool.clone())),
            jobs: Arc::new(SqliteJobStore::new(pool.clone())),
            queue: Arc::new(SqliteWorkQueue::new(pool)),
        }
    }
}

/// Open the database file and make sure every table exists
pub async fn open_database(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let pool = shelf_common::db::init_database(db_path, max_connections).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// In-memory database with every table, for tests and dry runs
pub async fn open_memory_database() -> Result<SqlitePool> {
    let pool = shelf_common::db::init_memory_database().await?;
    init_tables(&pool).await?;
    Ok(pool)
}
