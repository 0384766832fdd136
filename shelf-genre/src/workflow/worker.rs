//! Queue workers
//!
//! A [`Worker`] leases one message, enriches every book in it and persists
//! each result under `results/{job_id}/{item_key}`. The key is recomputed
//! from the book identity, so a redelivered message overwrites instead of
//! adding a second result.
//!
//! **Invocation failures** (panic, timeout, store error) are not enrichment
//! failures. The item gets a placeholder result right away so the job can
//! still reach readiness, and the message is released for another try. A
//! successful retry overwrites the placeholder. After `max_deliveries` the
//! message is dead-lettered.
//!
//! Once a job is complete or errored its results prefix is gone for good.
//! A late delivery for such a job is acked without persisting anything.
//!
//! A [`WorkerPool`] runs N independent pull loops; there is no coordinator
//! between them.

use crate::config::WorkerConfig;
use crate::db::blobs::{put_json, put_json_if_absent};
use crate::db::keys::result_key;
use crate::db::{Delivery, Stores};
use crate::error::{WorkflowError, WorkflowResult};
use crate::models::{EnrichedBook, EnrichmentRequest, JobStatus};
use crate::services::BookEnricher;
use chrono::Utc;
use shelf_common::events::{EnrichEvent, EventBus};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Every item persisted and the message acked
    Completed { items: usize },
    /// Some item failed; the message will be redelivered
    Released { failed: usize },
    /// Deliveries exhausted; the message is in the dead-letter table
    DeadLettered { failed: usize },
    /// The job was already closed; the message was acked without persisting
    Discarded { status: JobStatus },
}

pub struct Worker {
    stores: Stores,
    enricher: Arc<BookEnricher>,
    config: WorkerConfig,
    events: EventBus,
}

impl Worker {
    pub fn new(
        stores: Stores,
        enricher: Arc<BookEnricher>,
        config: WorkerConfig,
        events: EventBus,
    ) -> Self {
        Self {
            stores,
            enricher,
            config,
            events,
        }
    }

    /// Lease and handle one message; `None` when nothing is visible
    pub async fn process_next(&self) -> WorkflowResult<Option<DeliveryOutcome>> {
        match self.stores.queue.receive(self.config.lease()).await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Handle one leased message
    pub async fn handle(&self, delivery: Delivery) -> WorkflowResult<DeliveryOutcome> {
        debug!(
            message_id = %delivery.message_id,
            job_id = %delivery.job_id,
            deliveries = delivery.deliveries,
            items = delivery.message.requests.len(),
            "Handling work message"
        );

        if let Some(status) = self.closed_status(delivery.job_id).await? {
            return self.discard(&delivery, status).await;
        }

        // A lease that expired mid-processing still counts as a delivery
        if delivery.deliveries > self.config.max_deliveries {
            let reason = format!(
                "Delivered {} times without completing",
                delivery.deliveries
            );
            let requests: Vec<&EnrichmentRequest> = delivery.message.requests.iter().collect();
            return self.dead_letter(&delivery, &requests, &reason).await;
        }

        let mut failures: Vec<(&EnrichmentRequest, String)> = Vec::new();
        for request in &delivery.message.requests {
            match self.process_request(request).await {
                Ok(None) => {}
                Ok(Some(status)) => return self.discard(&delivery, status).await,
                Err(e) => {
                    let reason = e.to_string();
                    warn!(
                        job_id = %request.job_id,
                        item_key = %request.item_key,
                        deliveries = delivery.deliveries,
                        error = %reason,
                        "Worker invocation failed"
                    );
                    self.write_placeholder(request, &reason).await;
                    failures.push((request, reason));
                }
            }
        }

        if failures.is_empty() {
            if !self.stores.queue.ack(&delivery).await? {
                // Lease expired and someone else holds the message; results are already stored
                debug!(message_id = %delivery.message_id, "Ack skipped; lease no longer held");
            }
            return Ok(DeliveryOutcome::Completed {
                items: delivery.message.requests.len(),
            });
        }

        if delivery.deliveries >= self.config.max_deliveries {
            let requests: Vec<&EnrichmentRequest> = failures.iter().map(|(r, _)| *r).collect();
            let reason = failures
                .iter()
                .map(|(_, reason)| reason.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return self.dead_letter(&delivery, &requests, &reason).await;
        }

        self.stores
            .queue
            .release(&delivery, self.config.redelivery_delay())
            .await?;
        Ok(DeliveryOutcome::Released {
            failed: failures.len(),
        })
    }

    /// Enrich one book and persist it
    ///
    /// Returns the job's status instead when the job closed before the
    /// result could be kept.
    async fn process_request(
        &self,
        request: &EnrichmentRequest,
    ) -> WorkflowResult<Option<JobStatus>> {
        let book = self.invoke(request).await?;
        if let Some(status) = self.closed_status(request.job_id).await? {
            return Ok(Some(status));
        }

        if book.item_key != request.item_key {
            warn!(
                job_id = %request.job_id,
                message_key = %request.item_key,
                identity_key = %book.item_key,
                "Message item key differs from identity; using identity"
            );
        }

        let key = result_key(request.job_id, &book.item_key);
        put_json(self.stores.blobs.as_ref(), &key, &book).await?;
        if let Some(status) = self.undo_if_closed(request.job_id, &key).await? {
            return Ok(Some(status));
        }

        self.events.emit_lossy(EnrichEvent::ItemPersisted {
            job_id: request.job_id,
            item_key: book.item_key.to_string(),
            success: book.success(),
            timestamp: Utc::now(),
        });
        Ok(None)
    }

    /// Terminal status of the job, or `None` while it still takes results
    ///
    /// A job with no status record is treated as open.
    async fn closed_status(&self, job_id: Uuid) -> WorkflowResult<Option<JobStatus>> {
        let job = self.stores.jobs.get(job_id).await?;
        Ok(job.map(|job| job.status).filter(JobStatus::is_terminal))
    }

    /// Delete `key` again when the job closed while it was being written
    ///
    /// The aggregator clears results only after its status CAS, so a write
    /// that lands after that clear is always seen here.
    async fn undo_if_closed(&self, job_id: Uuid, key: &str) -> WorkflowResult<Option<JobStatus>> {
        let status = self.closed_status(job_id).await?;
        if status.is_some() {
            self.stores.blobs.delete(key).await?;
        }
        Ok(status)
    }

    async fn discard(
        &self,
        delivery: &Delivery,
        status: JobStatus,
    ) -> WorkflowResult<DeliveryOutcome> {
        info!(
            message_id = %delivery.message_id,
            job_id = %delivery.job_id,
            status = status.as_str(),
            "Job already closed; dropping work message"
        );
        if !self.stores.queue.ack(delivery).await? {
            debug!(message_id = %delivery.message_id, "Ack skipped; lease no longer held");
        }
        Ok(DeliveryOutcome::Discarded { status })
    }

    /// Run the enricher in its own task, bounded by the item timeout
    async fn invoke(&self, request: &EnrichmentRequest) -> WorkflowResult<EnrichedBook> {
        let enricher = Arc::clone(&self.enricher);
        let identity = request.book.clone();
        let mut handle = tokio::spawn(async move { enricher.enrich(&identity).await });

        let invocation_error = |reason: String| WorkflowError::Invocation {
            item_key: request.item_key.to_string(),
            reason,
        };

        match tokio::time::timeout(self.config.item_timeout(), &mut handle).await {
            Ok(Ok(book)) => Ok(book),
            Ok(Err(join_error)) if join_error.is_panic() => {
                let panic = join_error.into_panic();
                let message = panic
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(invocation_error(format!("enrichment panicked: {}", message)))
            }
            Ok(Err(join_error)) => Err(invocation_error(format!(
                "enrichment task failed: {}",
                join_error
            ))),
            Err(_) => {
                handle.abort();
                Err(invocation_error(format!(
                    "enrichment timed out after {}s",
                    self.config.item_timeout_secs
                )))
            }
        }
    }

    /// Best-effort failure record; never replaces a real result
    async fn write_placeholder(&self, request: &EnrichmentRequest, reason: &str) {
        let placeholder = EnrichedBook::failure_placeholder(request.book.clone(), reason);
        let key = result_key(request.job_id, &placeholder.item_key);
        match put_json_if_absent(self.stores.blobs.as_ref(), &key, &placeholder).await {
            Ok(true) => {
                if let Ok(Some(_)) = self.undo_if_closed(request.job_id, &key).await {
                    return;
                }
                self.events.emit_lossy(EnrichEvent::ItemPersisted {
                    job_id: request.job_id,
                    item_key: placeholder.item_key.to_string(),
                    success: false,
                    timestamp: Utc::now(),
                });
            }
            Ok(false) => {}
            Err(e) => error!(
                job_id = %request.job_id,
                item_key = %placeholder.item_key,
                error = %e,
                "Failed to write placeholder result"
            ),
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        requests: &[&EnrichmentRequest],
        reason: &str,
    ) -> WorkflowResult<DeliveryOutcome> {
        for request in requests {
            self.write_placeholder(request, reason).await;
        }
        self.stores.queue.dead_letter(delivery, reason).await?;

        for request in requests {
            self.events.emit_lossy(EnrichEvent::ItemDeadLettered {
                job_id: request.job_id,
                item_key: request.item_key.to_string(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(DeliveryOutcome::DeadLettered {
            failed: requests.len(),
        })
    }
}

/// Totals over one pool run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub messages: usize,
    pub items_persisted: usize,
    pub released: usize,
    pub dead_lettered: usize,
    pub discarded: usize,
}

impl PoolStats {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        self.messages += 1;
        match outcome {
            DeliveryOutcome::Completed { items } => self.items_persisted += items,
            DeliveryOutcome::Released { .. } => self.released += 1,
            DeliveryOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            DeliveryOutcome::Discarded { .. } => self.discarded += 1,
        }
    }

    fn merge(&mut self, other: PoolStats) {
        self.messages += other.messages;
        self.items_persisted += other.items_persisted;
        self.released += other.released;
        self.dead_lettered += other.dead_lettered;
        self.discarded += other.discarded;
    }
}

/// N independent pull loops over one queue
pub struct WorkerPool {
    worker: Arc<Worker>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(worker: Worker, concurrency: usize) -> Self {
        Self {
            worker: Arc::new(worker),
            concurrency: concurrency.max(1),
        }
    }

    /// Pull until cancelled, or with `drain`, until the queue is empty
    ///
    /// Draining waits for leased and delayed messages too: a loop only
    /// exits once the queue holds nothing at all.
    pub async fn run(&self, cancel: CancellationToken, drain: bool) -> PoolStats {
        info!(concurrency = self.concurrency, drain, "Worker pool starting");

        let mut loops = JoinSet::new();
        for worker_index in 0..self.concurrency {
            let worker = Arc::clone(&self.worker);
            let cancel = cancel.clone();
            loops.spawn(async move { pull_loop(worker, worker_index, cancel, drain).await });
        }

        let mut stats = PoolStats::default();
        while let Some(result) = loops.join_next().await {
            match result {
                Ok(loop_stats) => stats.merge(loop_stats),
                Err(e) => error!(error = %e, "Worker loop aborted"),
            }
        }

        info!(
            messages = stats.messages,
            items_persisted = stats.items_persisted,
            released = stats.released,
            dead_lettered = stats.dead_lettered,
            discarded = stats.discarded,
            "Worker pool stopped"
        );
        stats
    }
}

async fn pull_loop(
    worker: Arc<Worker>,
    worker_index: usize,
    cancel: CancellationToken,
    drain: bool,
) -> PoolStats {
    let mut stats = PoolStats::default();
    let poll_interval = worker.config.poll_interval();

    while !cancel.is_cancelled() {
        match worker.process_next().await {
            Ok(Some(outcome)) => {
                stats.record(&outcome);
                continue;
            }
            Ok(None) => {
                if drain {
                    match worker.stores.queue.depth().await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => warn!(worker_index, error = %e, "Failed to read queue depth"),
                    }
                }
            }
            Err(e) => warn!(worker_index, error = %e, "Worker poll failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    debug!(worker_index, messages = stats.messages, "Worker loop exiting");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::blobs::get_json;
    use crate::db::keys::results_prefix;
    use crate::db::open_memory_database;
    use crate::models::{BookIdentity, Job, SourceKind, WorkMessage};
    use crate::workflow::testing::{enricher, silent_enricher, Reply, ScriptedSource};
    use std::time::Duration;
    use uuid::Uuid;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            max_deliveries: 2,
            lease_secs: 60,
            item_timeout_secs: 5,
            poll_interval_ms: 10,
            redelivery_delay_ms: 0,
        }
    }

    async fn publish(stores: &Stores, job_id: Uuid, books: Vec<BookIdentity>) {
        let message = WorkMessage {
            message_id: Uuid::new_v4(),
            job_id,
            requests: books
                .into_iter()
                .map(|b| EnrichmentRequest::new(job_id, b))
                .collect(),
        };
        stores.queue.publish(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_persists_result_under_identity_key_and_acks() {
        let stores = Stores::sqlite(open_memory_database().await.unwrap());
        let enricher = enricher(
            ScriptedSource::new(SourceKind::Goodreads)
                .reply("Dune", Reply::Genres(vec!["Science Fiction"])),
            ScriptedSource::new(SourceKind::GoogleBooks),
            ScriptedSource::new(SourceKind::OpenLibrary),
        );
        let worker = Worker::new(stores.clone(), enricher, fast_config(), EventBus::new(16));

        let job_id = Uuid::new_v4();
        let dune = BookIdentity::new("Dune", "Frank Herbert").with_external_id("234225");
        publish(&stores, job_id, vec![dune.clone()]).await;

        let outcome = worker.process_next().await.unwrap().unwrap();
        assert_eq!(outcome, DeliveryOutcome::Completed { items: 1 });
        assert_eq!(stores.queue.depth().await.unwrap(), 0);

        let key = result_key(job_id, &dune.item_key());
        let stored: EnrichedBook = get_json(stores.blobs.as_ref(), &key).await.unwrap().unwrap();
        assert_eq!(stored.final_genres(), ["Science Fiction"]);
        assert!(worker.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_overwrites_single_result() {
        let stores = Stores::sqlite(open_memory_database().await.unwrap());
        let worker = Worker::new(stores.clone(), silent_enricher(), fast_config(), EventBus::new(16));

        let job_id = Uuid::new_v4();
        let book = BookIdentity::new("Emma", "Jane Austen");
        publish(&stores, job_id, vec![book.clone()]).await;
        publish(&stores, job_id, vec![book]).await;

        worker.process_next().await.unwrap();
        worker.process_next().await.unwrap();
        assert_eq!(
            stores.blobs.count_prefix(&results_prefix(job_id)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_panic_writes_placeholder_then_dead_letters() {
        let stores = Stores::sqlite(open_memory_database().await.unwrap());
        let enricher = enricher(
            ScriptedSource::new(SourceKind::Goodreads),
            ScriptedSource::new(SourceKind::GoogleBooks).reply("Emma", Reply::Panic),
            ScriptedSource::new(SourceKind::OpenLibrary),
        );
        let worker = Worker::new(stores.clone(), enricher, fast_config(), EventBus::new(16));

        let job_id = Uuid::new_v4();
        let book = BookIdentity::new("Emma", "Jane Austen");
        publish(&stores, job_id, vec![book.clone()]).await;

        let first = worker.process_next().await.unwrap().unwrap();
        assert_eq!(first, DeliveryOutcome::Released { failed: 1 });

        let key = result_key(job_id, &book.item_key());
        let placeholder: EnrichedBook =
            get_json(stores.blobs.as_ref(), &key).await.unwrap().unwrap();
        assert!(placeholder.is_placeholder());
        assert!(!placeholder.success());

        let second = worker.process_next().await.unwrap().unwrap();
        assert_eq!(second, DeliveryOutcome::DeadLettered { failed: 1 });
        assert_eq!(stores.queue.depth().await.unwrap(), 0);
        assert_eq!(stores.queue.dead_letters(job_id).await.unwrap().len(), 1);
        assert_eq!(
            stores.blobs.count_prefix(&results_prefix(job_id)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_over_delivered_message_dead_lettered_without_work() {
        let stores = Stores::sqlite(open_memory_database().await.unwrap());
        let worker = Worker::new(stores.clone(), silent_enricher(), fast_config(), EventBus::new(16));

        let job_id = Uuid::new_v4();
        publish(&stores, job_id, vec![BookIdentity::new("Emma", "Jane Austen")]).await;

        // Simulate leases that expired while a worker was stuck
        for _ in 0..2 {
            stores.queue.receive(Duration::ZERO).await.unwrap().unwrap();
        }

        let outcome = worker.process_next().await.unwrap().unwrap();
        assert_eq!(outcome, DeliveryOutcome::DeadLettered { failed: 1 });
    }

    #[tokio::test]
    async fn test_message_for_closed_job_is_dropped_unprocessed() {
        let stores = Stores::sqlite(open_memory_database().await.unwrap());
        // Running the enricher would fail the item, so only the guard yields Discarded
        let enricher = enricher(
            ScriptedSource::new(SourceKind::Goodreads),
            ScriptedSource::new(SourceKind::GoogleBooks).reply("Emma", Reply::Panic),
            ScriptedSource::new(SourceKind::OpenLibrary),
        );
        let worker = Worker::new(stores.clone(), enricher, fast_config(), EventBus::new(16));

        let job_id = Uuid::new_v4();
        stores.jobs.create(&Job::new(job_id, 1)).await.unwrap();
        stores
            .jobs
            .transition(job_id, JobStatus::Pending, JobStatus::Error, Some("gave up"))
            .await
            .unwrap();
        publish(&stores, job_id, vec![BookIdentity::new("Emma", "Jane Austen")]).await;

        let outcome = worker.process_next().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::Discarded {
                status: JobStatus::Error
            }
        );
        assert_eq!(stores.queue.depth().await.unwrap(), 0);
        assert_eq!(
            stores.blobs.count_prefix(&results_prefix(job_id)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let stores = Stores::sqlite(open_memory_database().await.unwrap());
        let worker = Worker::new(stores.clone(), silent_enricher(), fast_config(), EventBus::new(16));
        let pool = WorkerPool::new(worker, 3);

        let job_id = Uuid::new_v4();
        for i in 0..5 {
            publish(&stores, job_id, vec![BookIdentity::new(format!("Book {}", i), "A")]).await;
        }

        let stats = tokio::time::timeout(
            Duration::from_secs(10),
            pool.run(CancellationToken::new(), true),
        )
        .await
        .unwrap();
        assert_eq!(stats.items_persisted, 5);
        assert_eq!(stores.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pool_stops_on_cancel() {
        let stores = Stores::sqlite(open_memory_database().await.unwrap());
        let worker = Worker::new(stores, silent_enricher(), fast_config(), EventBus::new(16));
        let pool = WorkerPool::new(worker, 2);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = pool.run(cancel, false).await;
        assert_eq!(stats, PoolStats::default());
    }
}
