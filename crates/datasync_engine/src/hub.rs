//! Lifecycle notifications for an external observability sink.

use datasync_model::{Model, MutationEvent, MutationSyncMetadata};

use crate::publisher::EventPublisher;

/// A notification about sync progress.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Connectivity to the backend changed.
    NetworkStatus {
        /// Whether the backend is reachable.
        active: bool,
    },
    /// Every subscription is connected.
    SubscriptionsEstablished,
    /// Initial sync started for these models.
    SyncQueriesStarted {
        /// Model names in sync order.
        models: Vec<String>,
    },
    /// One model finished its initial sync.
    ModelSynced {
        /// Model name.
        model: String,
        /// Whether the sync ran without a cursor.
        is_full_sync: bool,
        /// Rows created locally.
        created: usize,
        /// Rows updated locally.
        updated: usize,
        /// Rows deleted locally.
        deleted: usize,
    },
    /// Initial sync finished for every model.
    SyncQueriesReady,
    /// The engine is syncing.
    Ready,
    /// A local write was queued.
    OutboxMutationEnqueued(MutationEvent),
    /// The backend acknowledged a queued write.
    OutboxMutationProcessed {
        /// The model as the backend returned it.
        model: Model,
        /// Its new sync metadata.
        metadata: MutationSyncMetadata,
    },
    /// The outbox size changed after a submission.
    OutboxStatus {
        /// Whether nothing is left to submit.
        is_empty: bool,
    },
    /// A remote change was applied locally.
    SyncReceived(MutationEvent),
    /// The backend rejected a write because its condition did not hold.
    ConditionalSaveFailed(MutationEvent),
    /// The backend rejected a write terminally.
    OutboxMutationFailed {
        /// The rejected write.
        event: MutationEvent,
        /// The backend's message.
        reason: String,
    },
    /// A remote change outside the model's sync expression was ignored.
    NonApplicableDataReceived {
        /// Model name.
        model: String,
        /// Model identifier.
        model_id: String,
    },
}

impl HubEvent {
    /// Event name as used by hub listeners.
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::NetworkStatus { .. } => "networkStatus",
            HubEvent::SubscriptionsEstablished => "subscriptionsEstablished",
            HubEvent::SyncQueriesStarted { .. } => "syncQueriesStarted",
            HubEvent::ModelSynced { .. } => "modelSynced",
            HubEvent::SyncQueriesReady => "syncQueriesReady",
            HubEvent::Ready => "ready",
            HubEvent::OutboxMutationEnqueued(_) => "outboxMutationEnqueued",
            HubEvent::OutboxMutationProcessed { .. } => "outboxMutationProcessed",
            HubEvent::OutboxStatus { .. } => "outboxStatus",
            HubEvent::SyncReceived(_) => "syncReceived",
            HubEvent::ConditionalSaveFailed(_) => "conditionalSaveFailed",
            HubEvent::OutboxMutationFailed { .. } => "outboxMutationFailed",
            HubEvent::NonApplicableDataReceived { .. } => "nonApplicableDataReceived",
        }
    }
}

/// Receives hub events. Implementations must not block.
pub trait HubSink: Send + Sync {
    /// Delivers one event.
    fn dispatch(&self, event: HubEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHub;

impl HubSink for NoopHub {
    fn dispatch(&self, _event: HubEvent) {}
}

impl HubSink for EventPublisher<HubEvent> {
    fn dispatch(&self, event: HubEvent) {
        self.send(event);
    }
}
