//! Job state machine, canonical manifest and queue message shapes
//!
//! Job status only moves forward:
//! PENDING → PROCESSING → COMPLETE | ERROR (PENDING → ERROR on publish failure)

use super::book::{BookIdentity, ItemKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, work not yet fully published
    Pending,
    /// All work published, workers running
    Processing,
    /// Final report written
    Complete,
    /// Unrecoverable failure (publish failure, stale job, aggregation failure)
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    /// True once no further transitions are allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    /// Forward-only transition table
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Error)
                | (JobStatus::Processing, JobStatus::Complete)
                | (JobStatus::Processing, JobStatus::Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = shelf_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "complete" => Ok(JobStatus::Complete),
            "error" => Ok(JobStatus::Error),
            other => Err(shelf_common::Error::Internal(format!(
                "Unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Job status record, as read by status pollers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total_items: usize,
    /// Persisted result count at the last aggregator scan
    pub completed_items: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: Uuid, total_items: usize) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobStatus::Pending,
            total_items,
            completed_items: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Readiness, derived and never stored
///
/// Cannot tell "all succeeded" from "all finished, some as placeholders";
/// both count.
pub fn is_ready(job: &Job, persisted_count: usize) -> bool {
    job.status == JobStatus::Processing && persisted_count >= job.total_items
}

/// Canonical ordered identity list, written once at job creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: Uuid,
    pub identities: Vec<BookIdentity>,
    pub created_at: DateTime<Utc>,
}

impl JobManifest {
    /// Build a manifest, collapsing identities that share an item key
    ///
    /// Returns the manifest and the number of duplicates dropped. The first
    /// occurrence keeps its position.
    pub fn new(job_id: Uuid, books: Vec<BookIdentity>) -> (Self, usize) {
        let mut seen = std::collections::HashSet::new();
        let total = books.len();
        let identities: Vec<BookIdentity> = books
            .into_iter()
            .filter(|book| seen.insert(book.item_key()))
            .collect();
        let dropped = total - identities.len();
        (
            Self {
                job_id,
                identities,
                created_at: Utc::now(),
            },
            dropped,
        )
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// One book to enrich, as carried in a queue message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub book: BookIdentity,
    pub job_id: Uuid,
    pub item_key: ItemKey,
}

impl EnrichmentRequest {
    pub fn new(job_id: Uuid, book: BookIdentity) -> Self {
        let item_key = book.item_key();
        Self {
            book,
            job_id,
            item_key,
        }
    }
}

/// Queue message: one book, or a small fixed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub message_id: Uuid,
    pub job_id: Uuid,
    pub requests: Vec<EnrichmentRequest>,
}
