//! Event types for the enrichment event system
//!
//! Distributor, workers and aggregator emit events onto a broadcast bus.
//! Emission is lossy: a pipeline with nobody listening keeps working.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Enrichment pipeline events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EnrichEvent {
    /// Job created and its work published to the queue
    JobSubmitted {
        job_id: Uuid,
        total_items: usize,
        messages: usize,
        timestamp: DateTime<Utc>,
    },

    /// Job moved from pending to processing
    JobProcessing {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A worker persisted the result for one item
    ItemPersisted {
        job_id: Uuid,
        item_key: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },

    /// An item exhausted its deliveries and went to the dead-letter table
    ItemDeadLettered {
        job_id: Uuid,
        item_key: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Aggregator observed progress on a job that is not ready yet
    JobProgress {
        job_id: Uuid,
        completed_items: usize,
        total_items: usize,
        timestamp: DateTime<Utc>,
    },

    /// Final report written and job marked complete
    JobCompleted {
        job_id: Uuid,
        total_items: usize,
        successful_items: usize,
        timestamp: DateTime<Utc>,
    },

    /// Job moved to error
    JobFailed {
        job_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl EnrichEvent {
    /// Job the event belongs to
    pub fn job_id(&self) -> Uuid {
        match self {
            EnrichEvent::JobSubmitted { job_id, .. }
            | EnrichEvent::JobProcessing { job_id, .. }
            | EnrichEvent::ItemPersisted { job_id, .. }
            | EnrichEvent::ItemDeadLettered { job_id, .. }
            | EnrichEvent::JobProgress { job_id, .. }
            | EnrichEvent::JobCompleted { job_id, .. }
            | EnrichEvent::JobFailed { job_id, .. } => *job_id,
        }
    }

    /// True for events after which the job will not change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrichEvent::JobCompleted { .. } | EnrichEvent::JobFailed { .. }
        )
    }
}

/// Central event distribution bus
///
/// Cloning is cheap; all clones share one channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EnrichEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EnrichEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: EnrichEvent,
    ) -> Result<usize, broadcast::error::SendError<EnrichEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EnrichEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
