//! Durable queue of local mutations awaiting acknowledgment.
//!
//! Entries live in the store's outbox table, so every outbox change is a
//! store write transaction and is serialized with model writes. Entries for
//! one model instance are coalesced while none of them is in flight, and are
//! handed out strictly in enqueue order. `next_ready` and `acknowledge`
//! additionally run on a dedicated worker task (see [`OutboxHandle`]).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use datasync_model::{now_millis, MutationEvent, MutationSyncMetadata, MutationType};
use datasync_storage::{LocalStore, OutboxRecord, StorageResult, Transaction};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, trace};

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};

/// An outbox entry.
pub type PendingMutation = OutboxRecord;

/// Result of a submission, reported back to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The backend accepted the mutation.
    Success(Option<MutationSyncMetadata>),
    /// A transient failure; resubmit after a backoff.
    Retry,
    /// A terminal failure; drop the entry.
    Discard,
}

/// What `enqueue` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new entry was appended.
    Appended(u64),
    /// The event was merged into an existing entry.
    Merged(u64),
}

/// The mutation outbox.
#[derive(Clone)]
pub struct MutationOutbox {
    store: Arc<LocalStore>,
    retry: RetryConfig,
    max_in_flight: usize,
    changed: Arc<Notify>,
}

impl MutationOutbox {
    /// Creates an outbox over `store`.
    pub fn new(store: Arc<LocalStore>, retry: RetryConfig, max_in_flight: usize) -> Self {
        Self {
            store,
            retry,
            max_in_flight: max_in_flight.max(1),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Queues `event`, coalescing it with the pending entry for the same
    /// model instance.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot persist the entry.
    pub fn enqueue(&self, event: MutationEvent) -> SyncResult<Enqueued> {
        let outcome = self.store.write_transaction(|txn| enqueue_in(txn, event))?;
        self.notify();
        Ok(outcome)
    }

    /// Wakes a processor waiting in [`MutationOutbox::changed`].
    pub fn notify(&self) {
        self.changed.notify_one();
    }

    /// Waits until the outbox may have a newly eligible entry.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Entries in enqueue order.
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.store.outbox_records()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.store.outbox_records().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if an entry for the model instance is queued or in flight.
    pub fn has_pending(&self, model_name: &str, model_id: &str) -> bool {
        self.store
            .outbox_records()
            .iter()
            .any(|r| r.event.model_name == model_name && r.model_id() == model_id)
    }

    /// Makes entries left in flight by a previous run eligible again.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot persist the change.
    pub fn reset_in_flight(&self) -> SyncResult<usize> {
        let reset = self.store.write_transaction(|txn| {
            let mut reset = 0;
            for mut record in txn.outbox_records() {
                if record.in_flight {
                    record.in_flight = false;
                    txn.put_outbox(record);
                    reset += 1;
                }
            }
            Ok(reset)
        })?;
        if reset > 0 {
            info!(entries = reset, "outbox entries reset after restart");
            self.notify();
        }
        Ok(reset)
    }

    /// Takes the oldest eligible entry and marks it in flight.
    ///
    /// An entry is eligible when it is not in flight, its retry time has
    /// passed, no older entry exists for the same model instance, and fewer
    /// than `max_in_flight` entries are in flight.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot persist the change.
    pub fn next_ready(&self) -> SyncResult<Option<PendingMutation>> {
        let max_in_flight = self.max_in_flight;
        let now = now_millis();
        let next = self.store.write_transaction(|txn| {
            let records = txn.outbox_records();
            if records.iter().filter(|r| r.in_flight).count() >= max_in_flight {
                return Ok(None);
            }
            let mut seen = HashSet::new();
            for mut record in records {
                let key = (record.event.model_name.clone(), record.event.model_id.clone());
                if !seen.insert(key) || record.in_flight || record.next_retry_at > now {
                    continue;
                }
                record.in_flight = true;
                txn.put_outbox(record.clone());
                return Ok(Some(record));
            }
            Ok(None)
        })?;
        if let Some(record) = &next {
            debug!(
                sequence = record.sequence,
                model = %record.event.model_name,
                model_id = %record.model_id(),
                mutation = %record.event.mutation_type,
                "outbox entry dispatched"
            );
        }
        Ok(next)
    }

    /// Resolves an in-flight entry and returns the number of entries left.
    ///
    /// On success the entry is removed, the returned sync metadata is stored
    /// (never lowering a known version) and later entries for the same model
    /// instance are stamped with the new version, all in one transaction.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot persist the change.
    pub fn acknowledge(&self, sequence: u64, outcome: AckOutcome) -> SyncResult<usize> {
        let retry = &self.retry;
        let remaining = self.store.write_transaction(|txn| {
            let records = txn.outbox_records();
            let Some(record) = records.iter().find(|r| r.sequence == sequence).cloned() else {
                trace!(sequence, "acknowledged entry no longer queued");
                return Ok(records.len());
            };
            match &outcome {
                AckOutcome::Success(metadata) => {
                    txn.delete_outbox(sequence);
                    if let Some(metadata) = metadata {
                        let version = store_metadata(txn, metadata.clone());
                        for mut later in records.into_iter().filter(|r| {
                            r.sequence > sequence
                                && r.event.model_name == record.event.model_name
                                && r.event.model_id == record.event.model_id
                        }) {
                            later.event.version = Some(version);
                            txn.put_outbox(later);
                        }
                    }
                }
                AckOutcome::Retry => {
                    let mut record = record;
                    record.in_flight = false;
                    record.attempt_count += 1;
                    let delay = retry.backoff(record.attempt_count);
                    record.next_retry_at =
                        now_millis() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                    debug!(
                        sequence,
                        attempt = record.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        "outbox entry scheduled for retry"
                    );
                    txn.put_outbox(record);
                }
                AckOutcome::Discard => txn.delete_outbox(sequence),
            }
            Ok(txn.outbox_records().len())
        })?;
        debug!(sequence, outcome = ?outcome, remaining, "outbox entry acknowledged");
        self.notify();
        Ok(remaining)
    }

    /// Time until the earliest scheduled retry, if any entry is waiting.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        let now = now_millis();
        self.store
            .outbox_records()
            .iter()
            .filter(|r| !r.in_flight && r.next_retry_at > now)
            .map(|r| Duration::from_millis(u64::try_from(r.next_retry_at - now).unwrap_or(0)))
            .min()
    }

    /// Starts the worker that serializes `next_ready` and `acknowledge`.
    ///
    /// The worker stops when the handle is dropped.
    pub fn spawn_worker(&self) -> OutboxHandle {
        let (commands, mut queue) = mpsc::unbounded_channel::<Command>();
        let outbox = self.clone();
        tokio::spawn(async move {
            while let Some(command) = queue.recv().await {
                match command {
                    Command::NextReady(reply) => {
                        let _ = reply.send(outbox.next_ready());
                    }
                    Command::Acknowledge {
                        sequence,
                        outcome,
                        reply,
                    } => {
                        let _ = reply.send(outbox.acknowledge(sequence, outcome));
                    }
                }
            }
            trace!("outbox worker stopped");
        });
        OutboxHandle {
            commands,
            outbox: self.clone(),
        }
    }
}

/// Coalesces `event` into the outbox inside an open transaction.
///
/// Rules against the newest entry for the same model instance, when that
/// entry is not in flight:
/// - create then update: one create carrying the update's fields
/// - anything then delete: one delete
/// - update then update: the latest update
/// - delete then anything: appended
///
/// A new entry is stamped with the version from the sync metadata.
///
/// # Errors
///
/// Never fails today; returns a result to compose with other writes.
pub fn enqueue_in(txn: &mut Transaction<'_>, mut event: MutationEvent) -> StorageResult<Enqueued> {
    let existing = txn
        .outbox_records()
        .into_iter()
        .rev()
        .find(|r| r.event.model_name == event.model_name && r.event.model_id == event.model_id);

    if let Some(mut existing) = existing.filter(|r| !r.in_flight) {
        let merged = match (existing.event.mutation_type, event.mutation_type) {
            (MutationType::Delete, _) => None,
            (_, MutationType::Delete) => Some(MutationType::Delete),
            (MutationType::Create, _) => Some(MutationType::Create),
            (MutationType::Update, _) => Some(MutationType::Update),
        };
        if let Some(mutation_type) = merged {
            let previous = existing.event.mutation_type;
            if mutation_type == MutationType::Create {
                event.graphql_filter = existing.event.graphql_filter.take();
            }
            event.mutation_type = mutation_type;
            event.version = existing.event.version.or(event.version);
            trace!(
                sequence = existing.sequence,
                model_id = %event.model_id,
                from = %previous,
                to = %mutation_type,
                "outbox entry coalesced"
            );
            existing.event = event;
            let sequence = existing.sequence;
            txn.put_outbox(existing);
            return Ok(Enqueued::Merged(sequence));
        }
    }

    if event.version.is_none() {
        event.version = txn
            .sync_metadata(&event.model_name, &event.model_id)
            .map(|m| m.version);
    }
    let sequence = txn.next_outbox_sequence();
    debug!(
        sequence,
        model = %event.model_name,
        model_id = %event.model_id,
        mutation = %event.mutation_type,
        "outbox entry appended"
    );
    txn.put_outbox(OutboxRecord::new(sequence, event));
    Ok(Enqueued::Appended(sequence))
}

/// Returns true if the outbox holds an entry for the model instance.
pub fn has_pending_in(txn: &Transaction<'_>, model_name: &str, model_id: &str) -> bool {
    txn.outbox_records()
        .iter()
        .any(|r| r.event.model_name == model_name && r.model_id() == model_id)
}

/// Writes `metadata` unless a higher version is stored. Returns the stored
/// version.
pub(crate) fn store_metadata(txn: &mut Transaction<'_>, metadata: MutationSyncMetadata) -> i64 {
    let current = txn
        .sync_metadata(&metadata.model_name, &metadata.model_id)
        .map(|m| m.version);
    match current {
        Some(version) if version > metadata.version => version,
        _ => {
            let version = metadata.version;
            txn.put_sync_metadata(metadata);
            version
        }
    }
}

enum Command {
    NextReady(oneshot::Sender<SyncResult<Option<PendingMutation>>>),
    Acknowledge {
        sequence: u64,
        outcome: AckOutcome,
        reply: oneshot::Sender<SyncResult<usize>>,
    },
}

/// Async access to the outbox worker.
#[derive(Clone)]
pub struct OutboxHandle {
    commands: mpsc::UnboundedSender<Command>,
    outbox: MutationOutbox,
}

impl OutboxHandle {
    /// See [`MutationOutbox::next_ready`].
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] if the worker is gone; storage errors.
    pub async fn next_ready(&self) -> SyncResult<Option<PendingMutation>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::NextReady(reply))
            .map_err(|_| SyncError::Cancelled)?;
        response.await.map_err(|_| SyncError::Cancelled)?
    }

    /// See [`MutationOutbox::acknowledge`].
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] if the worker is gone; storage errors.
    pub async fn acknowledge(&self, sequence: u64, outcome: AckOutcome) -> SyncResult<usize> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Acknowledge {
                sequence,
                outcome,
                reply,
            })
            .map_err(|_| SyncError::Cancelled)?;
        response.await.map_err(|_| SyncError::Cancelled)?
    }

    /// The outbox behind this handle.
    pub fn outbox(&self) -> &MutationOutbox {
        &self.outbox
    }
}

#[cfg(test)]
mod tests {
    use datasync_model::{FieldType, Model, ModelField, ModelRegistry, ModelSchema};

    use super::*;

    fn setup() -> (MutationOutbox, Arc<ModelSchema>) {
        setup_with(
            RetryConfig::new(3)
                .with_base_delay(Duration::from_secs(30))
                .with_jitter(Duration::ZERO),
        )
    }

    fn setup_with(retry: RetryConfig) -> (MutationOutbox, Arc<ModelSchema>) {
        let post = ModelSchema::builder("Post")
            .field(ModelField::id())
            .field(ModelField::new("title", FieldType::String))
            .build()
            .unwrap();
        let registry = ModelRegistry::builder().register(post.clone()).build().unwrap();
        let store = Arc::new(LocalStore::in_memory(registry).unwrap());
        (MutationOutbox::new(store, retry, 2), post)
    }

    fn event(schema: &Arc<ModelSchema>, id: &str, title: &str, kind: MutationType) -> MutationEvent {
        let model = Model::builder(schema)
            .set("id", id)
            .set("title", title)
            .build()
            .unwrap();
        MutationEvent::new(&model, kind)
    }

    #[test]
    fn create_then_update_is_one_create_with_latest_fields() {
        let (outbox, post) = setup();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Create)).unwrap();
        let merged = outbox.enqueue(event(&post, "p1", "b", MutationType::Update)).unwrap();
        assert!(matches!(merged, Enqueued::Merged(_)));

        let pending = outbox.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.mutation_type, MutationType::Create);
        assert!(pending[0].event.json.contains("\"b\""));
    }

    #[test]
    fn update_then_delete_is_one_delete() {
        let (outbox, post) = setup();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Update)).unwrap();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Delete)).unwrap();
        let pending = outbox.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.mutation_type, MutationType::Delete);
    }

    #[test]
    fn delete_then_create_appends() {
        let (outbox, post) = setup();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Delete)).unwrap();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Create)).unwrap();
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn in_flight_entries_are_not_coalesced() {
        let (outbox, post) = setup();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Create)).unwrap();
        let first = outbox.next_ready().unwrap().unwrap();
        outbox.enqueue(event(&post, "p1", "b", MutationType::Update)).unwrap();
        assert_eq!(outbox.len(), 2);

        // The second entry waits for the first.
        assert!(outbox.next_ready().unwrap().is_none());
        outbox.acknowledge(first.sequence, AckOutcome::Success(None)).unwrap();
        let second = outbox.next_ready().unwrap().unwrap();
        assert_eq!(second.event.mutation_type, MutationType::Update);
    }

    #[test]
    fn different_ids_dispatch_concurrently_up_to_the_bound() {
        let (outbox, post) = setup();
        for id in ["p1", "p2", "p3"] {
            outbox.enqueue(event(&post, id, "a", MutationType::Create)).unwrap();
        }
        let a = outbox.next_ready().unwrap().unwrap();
        let b = outbox.next_ready().unwrap().unwrap();
        assert_eq!((a.model_id(), b.model_id()), ("p1", "p2"));
        assert!(outbox.next_ready().unwrap().is_none());
    }

    #[test]
    fn retry_schedules_a_backoff() {
        let (outbox, post) = setup();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Create)).unwrap();
        let record = outbox.next_ready().unwrap().unwrap();
        assert_eq!(outbox.acknowledge(record.sequence, AckOutcome::Retry).unwrap(), 1);

        let pending = &outbox.pending()[0];
        assert_eq!(pending.attempt_count, 1);
        assert!(!pending.in_flight);
        assert!(outbox.next_ready().unwrap().is_none());
        let delay = outbox.next_retry_delay().unwrap();
        assert!(delay > Duration::from_secs(50) && delay <= Duration::from_secs(60));
    }

    #[test]
    fn repeated_retries_double_the_wait_up_to_the_ceiling() {
        let (outbox, post) = setup();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Create)).unwrap();
        let record = outbox.next_ready().unwrap().unwrap();

        for expected in [60, 120, 240, 300, 300] {
            outbox.acknowledge(record.sequence, AckOutcome::Retry).unwrap();
            let wait = outbox.next_retry_delay().unwrap();
            let expected = Duration::from_secs(expected);
            assert!(wait <= expected && wait > expected - Duration::from_secs(5), "{wait:?}");
        }
        assert_eq!(outbox.pending()[0].attempt_count, 5);
        assert!(outbox.next_ready().unwrap().is_none());
    }

    #[test]
    fn jittered_retry_stays_inside_its_window() {
        let (outbox, post) = setup_with(RetryConfig::new(3).with_base_delay(Duration::from_secs(10)).with_jitter(Duration::from_secs(10)));
        outbox.enqueue(event(&post, "p1", "a", MutationType::Create)).unwrap();
        let record = outbox.next_ready().unwrap().unwrap();
        outbox.acknowledge(record.sequence, AckOutcome::Retry).unwrap();

        let wait = outbox.next_retry_delay().unwrap();
        assert!(wait > Duration::from_secs(15) && wait < Duration::from_secs(30), "{wait:?}");
    }

    #[test]
    fn success_stores_metadata_and_restamps_later_entries() {
        let (outbox, post) = setup();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Create)).unwrap();
        let record = outbox.next_ready().unwrap().unwrap();
        outbox.enqueue(event(&post, "p1", "b", MutationType::Update)).unwrap();

        let metadata = MutationSyncMetadata {
            model_id: "p1".into(),
            model_name: "Post".into(),
            version: 1,
            deleted: false,
            last_changed_at: 10,
        };
        let left = outbox
            .acknowledge(record.sequence, AckOutcome::Success(Some(metadata)))
            .unwrap();
        assert_eq!(left, 1);
        assert_eq!(outbox.store.sync_metadata("Post", "p1").unwrap().version, 1);
        assert_eq!(outbox.pending()[0].event.version, Some(1));
    }

    #[test]
    fn new_entries_carry_the_known_version() {
        let (outbox, post) = setup();
        outbox
            .store
            .save_sync_metadata(MutationSyncMetadata {
                model_id: "p1".into(),
                model_name: "Post".into(),
                version: 7,
                deleted: false,
                last_changed_at: 0,
            })
            .unwrap();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Update)).unwrap();
        assert_eq!(outbox.pending()[0].event.version, Some(7));
    }

    #[test]
    fn reset_in_flight_after_restart() {
        let (outbox, post) = setup();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Create)).unwrap();
        outbox.next_ready().unwrap().unwrap();
        assert_eq!(outbox.reset_in_flight().unwrap(), 1);
        assert!(outbox.next_ready().unwrap().is_some());
    }

    #[tokio::test]
    async fn worker_serializes_dispatch() {
        let (outbox, post) = setup();
        outbox.enqueue(event(&post, "p1", "a", MutationType::Create)).unwrap();
        let handle = outbox.spawn_worker();
        let record = handle.next_ready().await.unwrap().unwrap();
        assert!(handle.next_ready().await.unwrap().is_none());
        let left = handle.acknowledge(record.sequence, AckOutcome::Discard).await.unwrap();
        assert_eq!(left, 0);
        assert!(handle.outbox().is_empty());
    }
}
