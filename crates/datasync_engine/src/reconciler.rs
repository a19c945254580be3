//! Merges remote changes into the local store.
//!
//! The same rules apply to initial-sync rows, subscription events and the
//! server copies returned with conflicts:
//! 1. no local metadata, or a higher remote version: apply and publish
//! 2. a remote version at or below the local one: drop silently
//! 3. a queued or in-flight outbox entry for the instance: defer until the
//!    entry is acknowledged

use std::collections::HashMap;
use std::sync::Arc;

use datasync_model::{MutationEvent, MutationSync, MutationSyncMetadata, MutationType, QueryPredicate};
use datasync_storage::{DeleteTarget, LocalStore};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::SyncResult;
use crate::hub::{HubEvent, HubSink};
use crate::outbox::has_pending_in;
use crate::publisher::EventPublisher;

/// What happened to a remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Written locally and published.
    Applied(MutationType),
    /// Already applied or superseded.
    Dropped,
    /// Held until the local outbox entry resolves.
    Deferred,
    /// Outside the model's sync expression.
    NotApplicable,
}

/// Applies remote changes under the version rules.
pub struct Reconciler {
    store: Arc<LocalStore>,
    changes: EventPublisher<MutationEvent>,
    hub: Arc<dyn HubSink>,
    sync_expressions: HashMap<String, QueryPredicate>,
    deferred: Mutex<HashMap<String, MutationSync>>,
}

impl Reconciler {
    /// Creates a reconciler publishing applied changes to `changes`.
    pub fn new(
        store: Arc<LocalStore>,
        changes: EventPublisher<MutationEvent>,
        hub: Arc<dyn HubSink>,
        sync_expressions: HashMap<String, QueryPredicate>,
    ) -> Self {
        Self {
            store,
            changes,
            hub,
            sync_expressions,
            deferred: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles one remote change.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the write.
    pub fn reconcile(&self, remote: MutationSync) -> SyncResult<Disposition> {
        let metadata = remote.sync_metadata.clone();
        if !metadata.deleted {
            if let Some(expression) = self
                .sync_expressions
                .get(&metadata.model_name)
                .filter(|p| !p.is_all())
            {
                if !expression.evaluate(&remote.model) {
                    debug!(
                        model = %metadata.model_name,
                        model_id = %metadata.model_id,
                        "remote change outside sync expression"
                    );
                    self.hub.dispatch(HubEvent::NonApplicableDataReceived {
                        model: metadata.model_name.clone(),
                        model_id: metadata.model_id.clone(),
                    });
                    return Ok(Disposition::NotApplicable);
                }
            }
        }

        let publish = |outcome: &Outcome| {
            if let Outcome::Applied(_, events) = outcome {
                for event in events {
                    self.changes.send(event.clone());
                }
            }
        };
        let outcome = self.store.write_transaction_then(|txn| {
            let local = txn
                .sync_metadata(&metadata.model_name, &metadata.model_id)
                .map(|m| m.version);
            if local.is_some_and(|v| v >= metadata.version) {
                return Ok(Outcome::Dropped(local));
            }
            if has_pending_in(txn, &metadata.model_name, &metadata.model_id) {
                return Ok(Outcome::Deferred);
            }

            let mutation_type = MutationType::from_remote(metadata.version, metadata.deleted);
            let mut events = Vec::new();
            if metadata.deleted {
                let schema = txn.registry().schema(&metadata.model_name)?.clone();
                let deleted = txn.delete(&schema, &DeleteTarget::Id(metadata.model_id.clone()), None)?;
                events.extend(
                    deleted
                        .events
                        .into_iter()
                        .filter(|e| e.model_name != metadata.model_name || e.model_id != metadata.model_id),
                );
            } else {
                txn.put_model(&remote.model)?;
            }
            txn.put_sync_metadata(metadata.clone());
            events.push(
                MutationEvent::new(&remote.model, mutation_type).with_version(Some(metadata.version)),
            );
            Ok(Outcome::Applied(mutation_type, events))
        }, publish)?;

        let key = MutationSyncMetadata::key(&metadata.model_name, &metadata.model_id);
        match outcome {
            Outcome::Dropped(local) => {
                trace!(
                    model = %metadata.model_name,
                    model_id = %metadata.model_id,
                    remote_version = metadata.version,
                    local_version = ?local,
                    "remote change dropped"
                );
                Ok(Disposition::Dropped)
            }
            Outcome::Deferred => {
                debug!(
                    model = %metadata.model_name,
                    model_id = %metadata.model_id,
                    version = metadata.version,
                    "remote change deferred behind pending mutation"
                );
                let mut deferred = self.deferred.lock();
                let keep = deferred
                    .get(&key)
                    .map_or(true, |held| held.sync_metadata.version < metadata.version);
                if keep {
                    deferred.insert(key, remote);
                }
                Ok(Disposition::Deferred)
            }
            Outcome::Applied(mutation_type, events) => {
                debug!(
                    model = %metadata.model_name,
                    model_id = %metadata.model_id,
                    version = metadata.version,
                    mutation = %mutation_type,
                    "remote change applied"
                );
                self.deferred.lock().remove(&key);
                for event in events {
                    self.hub.dispatch(HubEvent::SyncReceived(event));
                }
                Ok(Disposition::Applied(mutation_type))
            }
        }
    }

    /// Retries the change deferred for a model instance, if any.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the write.
    pub fn release(&self, model_name: &str, model_id: &str) -> SyncResult<Option<Disposition>> {
        let held = self
            .deferred
            .lock()
            .remove(&MutationSyncMetadata::key(model_name, model_id));
        match held {
            Some(remote) => self.reconcile(remote).map(Some),
            None => Ok(None),
        }
    }

    /// Stores the backend's copy of a model after its mutation was
    /// acknowledged, unless newer local writes are queued for it.
    ///
    /// With `publish` the change is also published as an update.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the write.
    pub fn adopt(&self, acknowledged: &MutationSync, publish: bool) -> SyncResult<bool> {
        let metadata = &acknowledged.sync_metadata;
        if metadata.deleted {
            return Ok(false);
        }
        self.store.write_transaction_then(
            |txn| {
                if has_pending_in(txn, &metadata.model_name, &metadata.model_id) {
                    return Ok(false);
                }
                txn.put_model(&acknowledged.model)?;
                Ok(true)
            },
            |adopted: &bool| {
                if *adopted && publish {
                    let event = MutationEvent::new(&acknowledged.model, MutationType::Update)
                        .with_version(Some(metadata.version));
                    self.changes.send(event);
                }
            },
        )
        .map_err(Into::into)
    }

    /// Forgets every deferred change.
    ///
    /// Used when the local store is wiped; a held row would otherwise land on
    /// top of data written after the wipe.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.deferred.lock()).len();
        if dropped > 0 {
            debug!(dropped, "deferred remote changes discarded");
        }
    }

    /// Number of deferred changes.
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }
}

enum Outcome {
    Dropped(Option<i64>),
    Deferred,
    Applied(MutationType, Vec<MutationEvent>),
}

#[cfg(test)]
mod tests {
    use datasync_model::predicate::field;
    use datasync_model::{FieldType, Model, ModelField, ModelRegistry, ModelSchema};

    use super::*;
    use crate::config::RetryConfig;
    use crate::hub::NoopHub;
    use crate::outbox::MutationOutbox;

    fn store() -> Arc<LocalStore> {
        let post = ModelSchema::builder("Post")
            .field(ModelField::id())
            .field(ModelField::new("title", FieldType::String))
            .field(ModelField::new("rating", FieldType::Int))
            .build()
            .unwrap();
        let registry = ModelRegistry::builder().register(post).build().unwrap();
        Arc::new(LocalStore::in_memory(registry).unwrap())
    }

    fn remote(store: &LocalStore, title: &str, version: i64, deleted: bool) -> MutationSync {
        let schema = store.registry().schema("Post").unwrap();
        let model = Model::builder(schema)
            .set("id", "p1")
            .set("title", title)
            .set("rating", 4)
            .build()
            .unwrap();
        MutationSync {
            model,
            sync_metadata: MutationSyncMetadata {
                model_id: "p1".into(),
                model_name: "Post".into(),
                version,
                deleted,
                last_changed_at: 1,
            },
        }
    }

    fn reconciler(store: &Arc<LocalStore>) -> (Reconciler, EventPublisher<MutationEvent>) {
        let changes = EventPublisher::new();
        let reconciler = Reconciler::new(store.clone(), changes.clone(), Arc::new(NoopHub), HashMap::new());
        (reconciler, changes)
    }

    fn title(store: &LocalStore) -> Option<String> {
        let schema = store.registry().schema("Post").unwrap();
        store
            .query_by_id(schema, "p1")
            .unwrap()
            .and_then(|m| m.get("title").as_str().map(str::to_string))
    }

    #[tokio::test]
    async fn lower_version_is_dropped_higher_is_applied() {
        let store = store();
        let (reconciler, changes) = reconciler(&store);
        assert_eq!(
            reconciler.reconcile(remote(&store, "v3", 3, false)).unwrap(),
            Disposition::Applied(MutationType::Update)
        );
        let mut events = changes.subscribe();

        assert_eq!(reconciler.reconcile(remote(&store, "v2", 2, false)).unwrap(), Disposition::Dropped);
        assert_eq!(title(&store).as_deref(), Some("v3"));
        assert!(events.try_recv().is_none());

        assert_eq!(
            reconciler.reconcile(remote(&store, "v5", 5, false)).unwrap(),
            Disposition::Applied(MutationType::Update)
        );
        assert_eq!(title(&store).as_deref(), Some("v5"));
        assert_eq!(store.sync_metadata("Post", "p1").unwrap().version, 5);
        assert_eq!(events.recv().await.unwrap().model_id, "p1");
    }

    #[test]
    fn deleted_remote_leaves_a_tombstone() {
        let store = store();
        let (reconciler, _) = reconciler(&store);
        reconciler.reconcile(remote(&store, "a", 1, false)).unwrap();
        assert_eq!(
            reconciler.reconcile(remote(&store, "a", 2, true)).unwrap(),
            Disposition::Applied(MutationType::Delete)
        );
        assert!(title(&store).is_none());
        let tombstone = store.sync_metadata("Post", "p1").unwrap();
        assert!(tombstone.deleted);
        assert_eq!(reconciler.reconcile(remote(&store, "a", 2, false)).unwrap(), Disposition::Dropped);
    }

    #[test]
    fn pending_outbox_entry_defers_until_released() {
        let store = store();
        let (reconciler, _) = reconciler(&store);
        let outbox = MutationOutbox::new(store.clone(), RetryConfig::default(), 1);
        let local = remote(&store, "local", 1, false).model;
        let saved = store.save(&local, None).unwrap();
        outbox.enqueue(saved.event).unwrap();

        assert_eq!(reconciler.reconcile(remote(&store, "r2", 2, false)).unwrap(), Disposition::Deferred);
        assert_eq!(reconciler.reconcile(remote(&store, "r1", 1, false)).unwrap(), Disposition::Deferred);
        assert_eq!(title(&store).as_deref(), Some("local"));
        assert_eq!(reconciler.deferred_count(), 1);

        let record = outbox.next_ready().unwrap().unwrap();
        outbox.acknowledge(record.sequence, crate::outbox::AckOutcome::Discard).unwrap();
        assert_eq!(
            reconciler.release("Post", "p1").unwrap(),
            Some(Disposition::Applied(MutationType::Update))
        );
        assert_eq!(title(&store).as_deref(), Some("r2"));
    }

    #[test]
    fn cleared_deferral_is_not_applied_after_a_new_write() {
        let store = store();
        let (reconciler, _) = reconciler(&store);
        let outbox = MutationOutbox::new(store.clone(), RetryConfig::default(), 1);
        let local = remote(&store, "local", 1, false).model;
        outbox.enqueue(store.save(&local, None).unwrap().event).unwrap();
        assert_eq!(reconciler.reconcile(remote(&store, "stale", 2, false)).unwrap(), Disposition::Deferred);

        store.clear().unwrap();
        reconciler.clear();
        assert_eq!(reconciler.deferred_count(), 0);

        let fresh = remote(&store, "fresh", 1, false).model;
        outbox.enqueue(store.save(&fresh, None).unwrap().event).unwrap();
        let record = outbox.next_ready().unwrap().unwrap();
        outbox.acknowledge(record.sequence, crate::outbox::AckOutcome::Success(None)).unwrap();
        assert_eq!(reconciler.release("Post", "p1").unwrap(), None);
        assert_eq!(title(&store).as_deref(), Some("fresh"));
        assert!(store.sync_metadata("Post", "p1").is_none());
    }

    #[tokio::test]
    async fn applied_changes_are_published_in_commit_order() {
        let store = store();
        let (reconciler, changes) = reconciler(&store);
        let reconciler = Arc::new(reconciler);
        let mut events = changes.subscribe();

        let mut tasks = Vec::new();
        for version in 1..=20 {
            let reconciler = reconciler.clone();
            let row = remote(&store, &format!("v{version}"), version, false);
            tasks.push(std::thread::spawn(move || reconciler.reconcile(row).unwrap()));
        }
        for task in tasks {
            task.join().unwrap();
        }

        let mut published = Vec::new();
        while let Some(event) = events.try_recv() {
            published.push(event.version.unwrap());
        }
        assert!(published.windows(2).all(|w| w[0] < w[1]), "{published:?}");
        let last = *published.last().unwrap();
        assert_eq!(store.sync_metadata("Post", "p1").unwrap().version, last);
    }

    #[test]
    fn sync_expression_filters_remote_rows() {
        let store = store();
        let mut expressions = HashMap::new();
        expressions.insert("Post".to_string(), field("rating").gt(10));
        let reconciler = Reconciler::new(store.clone(), EventPublisher::new(), Arc::new(NoopHub), expressions);
        assert_eq!(
            reconciler.reconcile(remote(&store, "a", 1, false)).unwrap(),
            Disposition::NotApplicable
        );
        assert_eq!(store.count("Post"), 0);
    }
}
