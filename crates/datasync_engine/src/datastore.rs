//! Application-facing entry point.
//!
//! `DataStore` writes through the local store, queues every write in the
//! outbox in the same transaction when sync is configured, publishes
//! changes to observers and starts or stops the remote sync engine.

use std::path::PathBuf;
use std::sync::Arc;

use datasync_graphql::graphql_filter_string;
use datasync_model::{
    Model, ModelRegistry, ModelSchema, MutationEvent, QueryPaginationInput, QueryPredicate,
    QuerySortDescriptor,
};
use datasync_storage::{DeleteTarget, LocalStore, Saved, StorageBackend, StoreConfig};
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::engine::RemoteSyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::hub::{HubEvent, HubSink, NoopHub};
use crate::lifecycle::EngineState;
use crate::outbox::{enqueue_in, MutationOutbox};
use crate::publisher::{EventPublisher, Subscription};
use crate::transport::{AuthProvider, GraphQLTransport, NoAuth};

enum Location {
    Memory,
    Directory(PathBuf),
    Backend(Box<dyn StorageBackend>),
}

/// Builder for [`DataStore`].
pub struct DataStoreBuilder {
    registry: ModelRegistry,
    location: Location,
    store_config: StoreConfig,
    sync_config: SyncConfig,
    transport: Option<Arc<dyn GraphQLTransport>>,
    auth: Arc<dyn AuthProvider>,
    hub: Arc<dyn HubSink>,
}

impl DataStoreBuilder {
    /// Persists to a directory instead of memory.
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.location = Location::Directory(dir.into());
        self
    }

    /// Persists to a custom backend.
    pub fn backend(mut self, backend: Box<dyn StorageBackend>) -> Self {
        self.location = Location::Backend(backend);
        self
    }

    /// Sets the store configuration.
    pub fn store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = config;
        self
    }

    /// Sets the sync configuration.
    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    /// Enables sync against `transport`.
    pub fn transport(mut self, transport: Arc<dyn GraphQLTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the authorization provider.
    pub fn auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the hub sink.
    pub fn hub(mut self, hub: Arc<dyn HubSink>) -> Self {
        self.hub = hub;
        self
    }

    /// Opens the store.
    ///
    /// With a transport this must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be opened or replayed.
    pub fn build(self) -> SyncResult<DataStore> {
        let store = Arc::new(match self.location {
            Location::Memory => LocalStore::open(
                self.registry,
                Box::new(datasync_storage::InMemoryBackend::new()),
                self.store_config,
            )?,
            Location::Directory(dir) => LocalStore::open_dir(&dir, self.registry, self.store_config)?,
            Location::Backend(backend) => LocalStore::open(self.registry, backend, self.store_config)?,
        });
        let outbox = MutationOutbox::new(
            store.clone(),
            self.sync_config.retry.clone(),
            self.sync_config.max_in_flight,
        );
        let changes = EventPublisher::new();
        let engine = self.transport.map(|transport| {
            RemoteSyncEngine::new(
                store.clone(),
                outbox.clone(),
                transport,
                self.auth,
                self.sync_config,
                changes.clone(),
                self.hub.clone(),
            )
        });
        info!(sync = engine.is_some(), "datastore opened");
        Ok(DataStore {
            store,
            outbox,
            changes,
            hub: self.hub,
            engine,
        })
    }
}

/// Local-first access to synced models.
pub struct DataStore {
    store: Arc<LocalStore>,
    outbox: MutationOutbox,
    changes: EventPublisher<MutationEvent>,
    hub: Arc<dyn HubSink>,
    engine: Option<RemoteSyncEngine>,
}

impl DataStore {
    /// Starts building a data store for `registry`.
    pub fn builder(registry: ModelRegistry) -> DataStoreBuilder {
        DataStoreBuilder {
            registry,
            location: Location::Memory,
            store_config: StoreConfig::default(),
            sync_config: SyncConfig::default(),
            transport: None,
            auth: Arc::new(NoAuth),
            hub: Arc::new(NoopHub),
        }
    }

    /// The model registry.
    pub fn registry(&self) -> &ModelRegistry {
        self.store.registry()
    }

    /// The schema named `name`.
    ///
    /// # Errors
    ///
    /// Fails when `name` is not registered.
    pub fn schema(&self, name: &str) -> SyncResult<Arc<ModelSchema>> {
        Ok(self.store.registry().schema(name)?.clone())
    }

    /// The underlying store.
    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// The outbox.
    pub fn outbox(&self) -> &MutationOutbox {
        &self.outbox
    }

    /// The sync engine, when sync is configured.
    pub fn engine(&self) -> Option<&RemoteSyncEngine> {
        self.engine.as_ref()
    }

    /// Saves `model`, failing if `condition` does not hold for the stored
    /// row.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidCondition`] when the condition fails; storage
    /// errors.
    pub fn save(&self, model: &Model, condition: Option<&QueryPredicate>) -> SyncResult<Model> {
        let condition = condition.filter(|c| !c.is_all());
        let filter = condition.map(|c| graphql_filter_string(model.schema(), c));
        let syncing = self.engine.is_some();
        let (saved, event) = self.store.write_transaction_then(
            |txn| {
                let saved = txn.save(model, condition)?;
                let event = saved.event.clone().with_graphql_filter(filter);
                if syncing {
                    enqueue_in(txn, event.clone())?;
                }
                Ok((saved, event))
            },
            |(_, event): &(Saved, MutationEvent)| {
                self.changes.send(event.clone());
            },
        )?;
        debug!(model = %event.model_name, model_id = %event.model_id, mutation = %event.mutation_type, "model saved");
        self.enqueued(vec![event]);
        Ok(saved.new)
    }

    /// Deletes `model` and the rows associated to it.
    ///
    /// Deleting a model that is not stored succeeds without effect unless a
    /// condition is given.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidCondition`] when the condition fails; storage
    /// errors.
    pub fn delete(&self, model: &Model, condition: Option<&QueryPredicate>) -> SyncResult<Vec<Model>> {
        let schema = model.schema().clone();
        self.delete_target(&schema, DeleteTarget::Id(model.identifier_string()), condition)
    }

    /// Deletes a model by identifier.
    ///
    /// # Errors
    ///
    /// See [`DataStore::delete`].
    pub fn delete_by_id(
        &self,
        schema: &Arc<ModelSchema>,
        id: &str,
        condition: Option<&QueryPredicate>,
    ) -> SyncResult<Vec<Model>> {
        self.delete_target(schema, DeleteTarget::Id(id.to_string()), condition)
    }

    /// Deletes every row of `schema` matching `predicate`.
    ///
    /// # Errors
    ///
    /// Fails if the predicate does not compile.
    pub fn delete_where(&self, schema: &Arc<ModelSchema>, predicate: &QueryPredicate) -> SyncResult<Vec<Model>> {
        self.delete_target(schema, DeleteTarget::Predicate(predicate.clone()), None)
    }

    fn delete_target(
        &self,
        schema: &Arc<ModelSchema>,
        target: DeleteTarget,
        condition: Option<&QueryPredicate>,
    ) -> SyncResult<Vec<Model>> {
        let condition = condition.filter(|c| !c.is_all());
        let filter = condition.map(|c| graphql_filter_string(schema, c));
        let syncing = self.engine.is_some();
        let (models, events) = self.store.write_transaction_then(|txn| {
            let deleted = txn.delete(schema, &target, condition)?;
            let targets: Vec<(String, String)> = deleted
                .models
                .iter()
                .map(|m| (m.model_name().to_string(), m.identifier_string()))
                .collect();
            let mut events = Vec::with_capacity(deleted.events.len());
            for event in deleted.events {
                let is_target = targets
                    .iter()
                    .any(|(name, id)| *name == event.model_name && *id == event.model_id);
                let event = if is_target {
                    event.with_graphql_filter(filter.clone())
                } else {
                    event
                };
                if syncing {
                    enqueue_in(txn, event.clone())?;
                }
                events.push(event);
            }
            Ok((deleted.models, events))
        }, |(_, events): &(Vec<Model>, Vec<MutationEvent>)| {
            for event in events {
                self.changes.send(event.clone());
            }
        })?;
        debug!(model = %schema.name(), deleted = models.len(), events = events.len(), "models deleted");
        self.enqueued(events);
        Ok(models)
    }

    /// Wakes the outbox and reports queued writes on the hub. Observers were
    /// already sent the events at commit.
    fn enqueued(&self, events: Vec<MutationEvent>) {
        if events.is_empty() || self.engine.is_none() {
            return;
        }
        self.outbox.notify();
        for event in events {
            self.hub.dispatch(HubEvent::OutboxMutationEnqueued(event));
        }
    }

    /// Queries `schema`.
    ///
    /// # Errors
    ///
    /// Fails if the predicate or sort keys do not compile.
    pub fn query(
        &self,
        schema: &ModelSchema,
        predicate: Option<&QueryPredicate>,
        sort: &[QuerySortDescriptor],
        pagination: Option<QueryPaginationInput>,
    ) -> SyncResult<Vec<Model>> {
        Ok(self.store.query(schema, predicate, sort, pagination)?)
    }

    /// Reads one model by identifier.
    ///
    /// # Errors
    ///
    /// Fails only if associations cannot be joined.
    pub fn query_by_id(&self, schema: &ModelSchema, id: &str) -> SyncResult<Option<Model>> {
        Ok(self.store.query_by_id(schema, id)?)
    }

    /// Subscribes to local and applied remote changes.
    ///
    /// Events arrive in the order their writes committed, across every
    /// caller.
    pub fn observe(&self) -> Subscription<MutationEvent> {
        self.changes.subscribe()
    }

    /// Starts the sync engine. Without a transport this does nothing.
    ///
    /// # Errors
    ///
    /// Fails if the engine is already running.
    pub fn start(&self) -> SyncResult<()> {
        match &self.engine {
            Some(engine) => engine.start(),
            None => {
                debug!("no transport configured, sync stays off");
                Ok(())
            }
        }
    }

    /// Stops the sync engine and waits for it to come to rest.
    pub async fn stop(&self) {
        if let Some(engine) = &self.engine {
            engine.stop().await;
        }
    }

    /// Lifecycle state of the sync engine.
    pub fn engine_state(&self) -> EngineState {
        self.engine
            .as_ref()
            .map_or(EngineState::Stopped, RemoteSyncEngine::state)
    }

    /// Stops syncing and deletes every local row, sync record and queued
    /// mutation.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot persist the change.
    pub async fn clear(&self) -> SyncResult<()> {
        self.stop().await;
        self.store.clear()?;
        if let Some(engine) = &self.engine {
            engine.forget_deferred();
        }
        info!("datastore cleared");
        Ok(())
    }

    /// Starts the engine and waits until it is syncing or torn down.
    ///
    /// # Errors
    ///
    /// [`SyncError::InternalOperation`] when the engine tears down.
    pub async fn start_and_wait(&self) -> SyncResult<()> {
        let Some(engine) = &self.engine else {
            return Ok(());
        };
        engine.start()?;
        match engine
            .wait_for_state(|s| matches!(s, EngineState::Syncing | EngineState::TornDown { .. }))
            .await
        {
            EngineState::TornDown { reason } => Err(SyncError::InternalOperation(reason)),
            _ => Ok(()),
        }
    }
}
