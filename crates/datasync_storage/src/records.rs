//! Rows of the system tables.

use datasync_model::MutationEvent;
use serde::{Deserialize, Serialize};

/// A persisted outbox entry.
///
/// The outbox logic lives in the sync engine; the store only keeps these
/// rows durable and hands them back in `sequence` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Enqueue order, unique per store.
    pub sequence: u64,
    /// Latest (coalesced) event for the model instance.
    pub event: MutationEvent,
    /// Failed submission attempts so far.
    pub attempt_count: u32,
    /// Earliest next submission time, epoch milliseconds.
    pub next_retry_at: i64,
    /// Whether a submission is outstanding.
    pub in_flight: bool,
}

impl OutboxRecord {
    /// Creates a fresh, immediately eligible record.
    pub fn new(sequence: u64, event: MutationEvent) -> Self {
        Self {
            sequence,
            event,
            attempt_count: 0,
            next_retry_at: 0,
            in_flight: false,
        }
    }

    /// Identifier of the model instance this record mutates.
    pub fn model_id(&self) -> &str {
        &self.event.model_id
    }
}
