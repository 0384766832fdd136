//! Work distributor: job creation and fan-out
//!
//! **Sequence:**
//! 1. Write the canonical manifest (write-once).
//! 2. Create the job record as `pending`.
//! 3. Publish every message; any publish failure moves the job to `error`.
//! 4. Move the job to `processing`.
//!
//! Workers may start on early messages before step 4. That is harmless:
//! the aggregator ignores `pending` jobs.

use crate::config::DistributorConfig;
use crate::db::blobs::put_json_if_absent;
use crate::db::keys::manifest_key;
use crate::db::Stores;
use crate::error::{WorkflowError, WorkflowResult};
use crate::models::{BookIdentity, EnrichmentRequest, Job, JobManifest, JobStatus, WorkMessage};
use chrono::Utc;
use shelf_common::events::{EnrichEvent, EventBus};
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct WorkDistributor {
    stores: Stores,
    config: DistributorConfig,
    events: EventBus,
}

impl WorkDistributor {
    pub fn new(stores: Stores, config: DistributorConfig, events: EventBus) -> Self {
        Self {
            stores,
            config,
            events,
        }
    }

    /// Create a job for `books` and fan it out under a fresh job id
    pub async fn submit(&self, books: Vec<BookIdentity>) -> WorkflowResult<Job> {
        self.submit_with_id(Uuid::new_v4(), books).await
    }

    /// Create a job under a caller-chosen id
    ///
    /// Fails with `InvalidInput` if the id is already in use, and with
    /// `Orchestration` (job left in `error`) if publishing fails.
    pub async fn submit_with_id(
        &self,
        job_id: Uuid,
        books: Vec<BookIdentity>,
    ) -> WorkflowResult<Job> {
        let (manifest, dropped) = JobManifest::new(job_id, books);
        if manifest.is_empty() {
            return Err(WorkflowError::InvalidInput(
                "Cannot create a job with no books".to_string(),
            ));
        }
        if dropped > 0 {
            warn!(
                job_id = %job_id,
                dropped,
                "Duplicate book identities collapsed into one entry each"
            );
        }

        if !put_json_if_absent(self.stores.blobs.as_ref(), &manifest_key(job_id), &manifest).await? {
            return Err(WorkflowError::InvalidInput(format!(
                "Job {} already exists",
                job_id
            )));
        }

        let job = Job::new(job_id, manifest.len());
        self.stores.jobs.create(&job).await?;

        let messages = self.build_messages(&manifest);
        info!(
            job_id = %job_id,
            total_items = manifest.len(),
            messages = messages.len(),
            "Publishing work"
        );

        for (published, message) in messages.iter().enumerate() {
            if let Err(e) = self.stores.queue.publish(message).await {
                let reason = format!(
                    "Failed to publish work ({} of {} messages sent): {}",
                    published,
                    messages.len(),
                    e
                );
                error!(job_id = %job_id, error = %e, "Fan-out failed");
                self.fail(job_id, &reason).await;
                return Err(WorkflowError::Orchestration(reason));
            }
        }

        self.events.emit_lossy(EnrichEvent::JobSubmitted {
            job_id,
            total_items: manifest.len(),
            messages: messages.len(),
            timestamp: Utc::now(),
        });

        if self
            .stores
            .jobs
            .transition(job_id, JobStatus::Pending, JobStatus::Processing, None)
            .await?
        {
            self.events.emit_lossy(EnrichEvent::JobProcessing {
                job_id,
                timestamp: Utc::now(),
            });
        }

        self.stores
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| WorkflowError::Orchestration(format!("Job {} vanished", job_id)))
    }

    /// Split the manifest into queue messages, preserving manifest order
    fn build_messages(&self, manifest: &JobManifest) -> Vec<WorkMessage> {
        let batch_size = self.config.batch_size(manifest.len());
        manifest
            .identities
            .chunks(batch_size)
            .map(|chunk| WorkMessage {
                message_id: Uuid::new_v4(),
                job_id: manifest.job_id,
                requests: chunk
                    .iter()
                    .map(|book| EnrichmentRequest::new(manifest.job_id, book.clone()))
                    .collect(),
            })
            .collect()
    }

    async fn fail(&self, job_id: Uuid, reason: &str) {
        match self
            .stores
            .jobs
            .transition(job_id, JobStatus::Pending, JobStatus::Error, Some(reason))
            .await
        {
            Ok(true) => self.events.emit_lossy(EnrichEvent::JobFailed {
                job_id,
                message: reason.to_string(),
                timestamp: Utc::now(),
            }),
            Ok(false) => warn!(job_id = %job_id, "Job was no longer pending when marking error"),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to mark job as error"),
        }
    }
}
