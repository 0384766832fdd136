//! Database Test Utilities

use async_trait::async_trait;
use shelf_genre::config::WorkerConfig;
use shelf_genre::db::{open_database, DeadLetter, Delivery, Stores, WorkQueue};
use shelf_genre::models::WorkMessage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// SQLite stores in a temporary directory
///
/// Returns (TempDir, Stores) - TempDir must be kept alive for duration of test
pub async fn create_test_stores() -> (TempDir, Stores) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test_shelf.db");
    let pool = open_database(&db_path, 8).await.unwrap();
    (temp_dir, Stores::sqlite(pool))
}

/// Worker settings with millisecond waits
pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 4,
        max_deliveries: 2,
        lease_secs: 60,
        item_timeout_secs: 5,
        poll_interval_ms: 10,
        redelivery_delay_ms: 0,
    }
}

/// Queue wrapper whose `publish` fails after `allowed` successes
pub struct FailingQueue {
    inner: Arc<dyn WorkQueue>,
    allowed: usize,
    attempts: AtomicUsize,
}

impl FailingQueue {
    pub fn wrap(stores: &mut Stores, allowed: usize) {
        stores.queue = Arc::new(Self {
            inner: Arc::clone(&stores.queue),
            allowed,
            attempts: AtomicUsize::new(0),
        });
    }
}

#[async_trait]
impl WorkQueue for FailingQueue {
    async fn publish(&self, message: &WorkMessage) -> shelf_common::Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(shelf_common::Error::Internal(
                "queue rejected message".to_string(),
            ));
        }
        self.inner.publish(message).await
    }

    async fn receive(&self, lease: Duration) -> shelf_common::Result<Option<Delivery>> {
        self.inner.receive(lease).await
    }

    async fn ack(&self, delivery: &Delivery) -> shelf_common::Result<bool> {
        self.inner.ack(delivery).await
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> shelf_common::Result<bool> {
        self.inner.release(delivery, delay).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> shelf_common::Result<()> {
        self.inner.dead_letter(delivery, reason).await
    }

    async fn depth(&self) -> shelf_common::Result<usize> {
        self.inner.depth().await
    }

    async fn dead_letters(&self, job_id: Uuid) -> shelf_common::Result<Vec<DeadLetter>> {
        self.inner.dead_letters(job_id).await
    }
}
