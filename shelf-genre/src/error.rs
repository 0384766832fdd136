//! Error types for shelf-genre
//!
//! Two layers:
//! - [`FetchError`]: one external source call failed (transient or permanent).
//!   Never escapes the enricher; it degrades only that source.
//! - [`WorkflowError`]: distribution, worker invocation and aggregation failures.
//!
//! "No genres found" is not an error anywhere: it is an empty
//! [`crate::models::ProcessedGenreSet`].

use crate::models::SourceKind;
use thiserror::Error;

/// Failure of a single external source call, after retries
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// Timeout, connection failure, 5xx or 429 that survived every retry
    #[error("{source_kind}: transient failure after {attempts} attempts: {reason}")]
    Transient {
        source_kind: SourceKind,
        attempts: u32,
        reason: String,
    },

    /// Non-429 4xx or an unparseable payload; never retried
    #[error("{source_kind}: permanent failure{}: {reason}", status_suffix(.status))]
    Permanent {
        source_kind: SourceKind,
        status: Option<u16>,
        reason: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl FetchError {
    /// Payload arrived but could not be decoded
    pub fn malformed(source_kind: SourceKind, reason: impl Into<String>) -> Self {
        FetchError::Permanent {
            source_kind,
            status: None,
            reason: format!("malformed payload: {}", reason.into()),
        }
    }

    /// Source the failure came from
    pub fn source_kind(&self) -> SourceKind {
        match self {
            FetchError::Transient { source_kind, .. } | FetchError::Permanent { source_kind, .. } => {
                *source_kind
            }
        }
    }

    /// True when the failure was retried locally before surfacing
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Distribution / worker / aggregation errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Fan-out publish failed; fatal for the job
    #[error("Orchestration failure: {0}")]
    Orchestration(String),

    /// A worker invocation failed (panic, timeout, persistence error)
    #[error("Worker invocation failed for {item_key}: {reason}")]
    Invocation { item_key: String, reason: String },

    /// Caller supplied something unusable (empty book list, unknown job)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage substrate error
    #[error(transparent)]
    Store(#[from] shelf_common::Error),

    /// Record encoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

impl From<sqlx::Error> for WorkflowError {
    fn from(err: sqlx::Error) -> Self {
        WorkflowError::Store(shelf_common::Error::Database(err))
    }
}
