//! Aggregator: readiness detection and identity-keyed merge
//!
//! Each scan looks at every `processing` job:
//! - not ready: refresh `completed_items`, or move a stale job to `error`
//! - ready: build the final report, write it once, compare-and-set the
//!   job to `complete`, then delete the per-item results
//!
//! Results are matched to the manifest through a map keyed by item key.
//! Result order in the store says nothing about manifest order, and a
//! manifest entry without a result gets a synthesized failure entry, so
//! the report always has exactly one entry per manifest identity.
//!
//! Two overlapping scans are safe: the report write is `put_if_absent`
//! and only the scan that wins the status change deletes results.

use crate::config::AggregatorConfig;
use crate::db::blobs::{get_json, put_json_if_absent};
use crate::db::keys::{manifest_key, report_key, results_prefix};
use crate::db::Stores;
use crate::error::{WorkflowError, WorkflowResult};
use crate::models::{
    is_ready, EnrichedBook, FinalReport, ItemKey, Job, JobManifest, JobStatus, ReportEntry,
    ReportSummary,
};
use chrono::Utc;
use shelf_common::events::{EnrichEvent, EventBus};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of scanning one job
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Already complete or error; nothing done
    Terminal(JobStatus),
    /// Still being published
    Pending,
    /// Not ready yet
    InProgress { persisted: usize, total: usize },
    /// Past the stale-job timeout; moved to error
    TimedOut { persisted: usize, total: usize },
    /// Report written and job completed by this scan
    Completed { summary: ReportSummary },
    /// Another scan moved the job out of processing first
    Superseded,
    /// Aggregation impossible (manifest missing); moved to error
    Failed { message: String },
}

pub struct Aggregator {
    stores: Stores,
    config: AggregatorConfig,
    events: EventBus,
}

impl Aggregator {
    pub fn new(stores: Stores, config: AggregatorConfig, events: EventBus) -> Self {
        Self {
            stores,
            config,
            events,
        }
    }

    /// Scan every processing job once
    ///
    /// A failure on one job is logged and does not stop the others.
    pub async fn scan_once(&self) -> WorkflowResult<Vec<(Uuid, ScanOutcome)>> {
        let jobs = self.stores.jobs.list_by_status(JobStatus::Processing).await?;
        debug!(jobs = jobs.len(), "Aggregator scan");

        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            let job_id = job.job_id;
            match self.scan(job).await {
                Ok(outcome) => outcomes.push((job_id, outcome)),
                Err(e) => error!(job_id = %job_id, error = %e, "Aggregation failed"),
            }
        }
        Ok(outcomes)
    }

    /// Scan one job by id
    pub async fn scan_job(&self, job_id: Uuid) -> WorkflowResult<ScanOutcome> {
        let job = self
            .stores
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| WorkflowError::InvalidInput(format!("Unknown job {}", job_id)))?;
        self.scan(job).await
    }

    /// Periodic scans until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = self.config.interval_secs, "Aggregator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once().await {
                        warn!(error = %e, "Aggregator scan failed");
                    }
                }
            }
        }
        info!("Aggregator stopped");
    }

    /// Scan one job periodically until it is terminal or `cancel` fires
    ///
    /// Returns the last job record seen.
    pub async fn watch(&self, job_id: Uuid, cancel: CancellationToken) -> WorkflowResult<Job> {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.scan_job(job_id).await? {
                        ScanOutcome::InProgress { .. } | ScanOutcome::Pending => {}
                        _ => break,
                    }
                }
            }
        }

        self.stores
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| WorkflowError::InvalidInput(format!("Unknown job {}", job_id)))
    }

    async fn scan(&self, job: Job) -> WorkflowResult<ScanOutcome> {
        match job.status {
            JobStatus::Complete | JobStatus::Error => return Ok(ScanOutcome::Terminal(job.status)),
            JobStatus::Pending => return Ok(ScanOutcome::Pending),
            JobStatus::Processing => {}
        }

        let persisted = self
            .stores
            .blobs
            .count_prefix(&results_prefix(job.job_id))
            .await?;

        if is_ready(&job, persisted) {
            return self.finalize(&job, persisted).await;
        }

        if self.is_stale(&job) {
            let message = format!(
                "Timed out with {} of {} results after {}s",
                persisted,
                job.total_items,
                (Utc::now() - job.created_at).num_seconds()
            );
            if self.fail(&job, &message).await? {
                return Ok(ScanOutcome::TimedOut {
                    persisted,
                    total: job.total_items,
                });
            }
            return Ok(ScanOutcome::Superseded);
        }

        if persisted != job.completed_items {
            self.stores.jobs.record_progress(job.job_id, persisted).await?;
            self.events.emit_lossy(EnrichEvent::JobProgress {
                job_id: job.job_id,
                completed_items: persisted,
                total_items: job.total_items,
                timestamp: Utc::now(),
            });
        }
        debug!(
            job_id = %job.job_id,
            persisted,
            total = job.total_items,
            "Job not ready"
        );
        Ok(ScanOutcome::InProgress {
            persisted,
            total: job.total_items,
        })
    }

    fn is_stale(&self, job: &Job) -> bool {
        match self.config.job_timeout_secs {
            Some(timeout) => (Utc::now() - job.created_at).num_seconds() >= timeout as i64,
            None => false,
        }
    }

    async fn finalize(&self, job: &Job, persisted: usize) -> WorkflowResult<ScanOutcome> {
        let job_id = job.job_id;

        let manifest: JobManifest =
            match get_json(self.stores.blobs.as_ref(), &manifest_key(job_id)).await? {
                Some(manifest) => manifest,
                None => {
                    let message = "Manifest missing; cannot build report".to_string();
                    self.fail(job, &message).await?;
                    return Ok(ScanOutcome::Failed { message });
                }
            };

        let report = self.build_report(&manifest).await?;
        let summary = report.summary.clone();

        if !put_json_if_absent(self.stores.blobs.as_ref(), &report_key(job_id), &report).await? {
            debug!(job_id = %job_id, "Report already written by an earlier scan");
        }

        self.stores.jobs.record_progress(job_id, persisted).await?;
        if !self
            .stores
            .jobs
            .transition(job_id, JobStatus::Processing, JobStatus::Complete, None)
            .await?
        {
            return Ok(ScanOutcome::Superseded);
        }

        let removed = self
            .stores
            .blobs
            .delete_prefix(&results_prefix(job_id))
            .await?;

        info!(
            job_id = %job_id,
            total_items = summary.total_items,
            successful_items = summary.successful_items,
            synthesized_items = summary.synthesized_items,
            removed,
            "Job complete"
        );
        self.events.emit_lossy(EnrichEvent::JobCompleted {
            job_id,
            total_items: summary.total_items,
            successful_items: summary.successful_items,
            timestamp: Utc::now(),
        });

        Ok(ScanOutcome::Completed { summary })
    }

    /// Merge persisted results onto the manifest by item key
    async fn build_report(&self, manifest: &JobManifest) -> WorkflowResult<FinalReport> {
        let job_id = manifest.job_id;
        let stored = self
            .stores
            .blobs
            .list_prefix(&results_prefix(job_id))
            .await?;

        let mut by_key: HashMap<ItemKey, EnrichedBook> = HashMap::with_capacity(stored.len());
        for (key, body) in stored {
            match serde_json::from_str::<EnrichedBook>(&body) {
                Ok(book) => {
                    by_key.insert(book.identity.item_key(), book);
                }
                Err(e) => warn!(job_id = %job_id, key = %key, error = %e, "Skipping corrupt result"),
            }
        }

        let entries: Vec<ReportEntry> = manifest
            .identities
            .iter()
            .map(|identity| match by_key.remove(&identity.item_key()) {
                Some(book) => ReportEntry::from_result(&book),
                None => {
                    warn!(
                        job_id = %job_id,
                        item_key = %identity.item_key(),
                        "No result for manifest entry; synthesizing failure entry"
                    );
                    ReportEntry::missing(identity)
                }
            })
            .collect();

        if !by_key.is_empty() {
            warn!(
                job_id = %job_id,
                unmatched = by_key.len(),
                "Results with no manifest entry were ignored"
            );
        }

        Ok(FinalReport {
            job_id,
            generated_at: Utc::now(),
            summary: ReportSummary::from_entries(&entries, self.config.top_genres),
            entries,
        })
    }

    /// Compare-and-set processing → error; `true` if this call made the change
    async fn fail(&self, job: &Job, message: &str) -> WorkflowResult<bool> {
        let changed = self
            .stores
            .jobs
            .transition(job.job_id, JobStatus::Processing, JobStatus::Error, Some(message))
            .await?;
        if changed {
            warn!(job_id = %job.job_id, message, "Job failed");
            self.events.emit_lossy(EnrichEvent::JobFailed {
                job_id: job.job_id,
                message: message.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(changed)
    }
}

/// Load a job's final report
pub async fn load_report(stores: &Stores, job_id: Uuid) -> WorkflowResult<Option<FinalReport>> {
    Ok(get_json(stores.blobs.as_ref(), &report_key(job_id)).await?)
}
