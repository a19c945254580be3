//! The local storage adapter.

use std::path::Path;

use datasync_model::{
    Model, ModelRegistry, ModelSchema, ModelSyncMetadata, MutationSyncMetadata, QueryPaginationInput,
    QueryPredicate, QuerySortDescriptor,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::StorageBackend;
use crate::compiler::{CompiledPredicate, QueryOptions, QueryPlan};
use crate::config::StoreConfig;
use crate::error::StorageResult;
use crate::file::FileBackend;
use crate::journal::Journal;
use crate::memory::InMemoryBackend;
use crate::records::OutboxRecord;
use crate::state::{Change, StoreState};
use crate::transaction::{DeleteTarget, Deleted, Saved, Transaction};

/// A journal-backed keyed store with one table per registered model plus
/// system tables for sync metadata, the outbox and sync cursors.
///
/// # Concurrency
///
/// Writes take the table lock exclusively and run one at a time; reads share
/// it and may overlap each other but never a write. A write is durable (its
/// journal frame appended) before the lock is released.
///
/// # Example
///
/// ```rust,ignore
/// let store = LocalStore::in_memory(registry)?;
/// let saved = store.save(&post, None)?;
/// let rows = store.query(&schema, Some(&field("title").eq("t")), &[], None)?;
/// ```
pub struct LocalStore {
    registry: ModelRegistry,
    config: StoreConfig,
    state: RwLock<StoreState>,
    journal: Mutex<Journal>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("models", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl LocalStore {
    /// Opens a store over `backend`, replaying its journal.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, journal corruption, or rows that no longer
    /// match their schema.
    pub fn open(
        registry: ModelRegistry,
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> StorageResult<Self> {
        let (journal, batches) = Journal::open(backend, config.sync_on_write)?;
        let mut state = StoreState::default();
        for batch in batches {
            for op in batch.ops {
                if let Some(change) = Change::from_journal(op, &registry)? {
                    state.apply(change);
                }
            }
        }
        info!(
            rows = state.row_count(),
            outbox = state.outbox.len(),
            "local store opened"
        );
        Ok(Self {
            registry,
            config,
            state: RwLock::new(state),
            journal: Mutex::new(journal),
        })
    }

    /// Opens an ephemeral store.
    ///
    /// # Errors
    ///
    /// Never fails in practice; kept fallible for symmetry with
    /// [`LocalStore::open`].
    pub fn in_memory(registry: ModelRegistry) -> StorageResult<Self> {
        Self::open(registry, Box::new(InMemoryBackend::new()), StoreConfig::default())
    }

    /// Opens (or creates) a store directory, locking it exclusively.
    ///
    /// # Errors
    ///
    /// Fails if the directory is locked by another store, or on I/O and
    /// replay errors.
    pub fn open_dir(dir: &Path, registry: ModelRegistry, config: StoreConfig) -> StorageResult<Self> {
        let backend = FileBackend::open(dir)?;
        Self::open(registry, Box::new(backend), config)
    }

    /// The registry the store was opened with.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Runs `f` as one atomic write.
    ///
    /// If `f` returns `Ok`, its changes are appended to the journal as one
    /// frame. If `f` returns `Err` or the append fails, every change is
    /// reverted and the error is returned.
    ///
    /// # Errors
    ///
    /// Propagates errors from `f` and from the journal.
    pub fn write_transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> StorageResult<T>,
    {
        self.write_transaction_then(f, |_| {})
    }

    /// Like [`LocalStore::write_transaction`], then runs `on_commit` once the
    /// journal holds the frame and before the write lock is released.
    ///
    /// `on_commit` calls therefore observe commits in commit order. It must
    /// not touch the store.
    ///
    /// # Errors
    ///
    /// Propagates errors from `f` and from the journal. `on_commit` does not
    /// run on error.
    pub fn write_transaction_then<T, F, C>(&self, f: F, on_commit: C) -> StorageResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> StorageResult<T>,
        C: FnOnce(&T),
    {
        let mut state = self.state.write();
        let mut txn = Transaction::new(&mut state, &self.registry);
        let result = f(&mut txn);
        let (batch, undo) = txn.into_parts();

        let outcome = match result {
            Ok(value) => {
                let mut journal = self.journal.lock();
                match journal.append(&batch) {
                    Ok(()) => {
                        self.maybe_compact(&mut journal, &state);
                        drop(journal);
                        on_commit(&value);
                        return Ok(value);
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        if !undo.is_empty() {
            warn!(changes = undo.len(), "rolling back write transaction");
        }
        for entry in undo.into_iter().rev() {
            state.revert(entry);
        }
        outcome
    }

    fn maybe_compact(&self, journal: &mut Journal, state: &StoreState) {
        let threshold = self.config.compaction_threshold;
        if threshold == 0 || journal.frames_since_snapshot() < threshold {
            return;
        }
        if let Err(e) = journal.compact(&state.snapshot()) {
            // The uncompacted journal is still complete.
            warn!(error = %e, "journal compaction failed");
        }
    }

    /// Conditionally saves a model.
    ///
    /// # Errors
    ///
    /// See [`Transaction::save`].
    pub fn save(&self, model: &Model, condition: Option<&QueryPredicate>) -> StorageResult<Saved> {
        self.write_transaction(|txn| txn.save(model, condition))
    }

    /// Deletes rows by id or predicate, cascading to associated children.
    ///
    /// # Errors
    ///
    /// See [`Transaction::delete`].
    pub fn delete(
        &self,
        schema: &ModelSchema,
        target: DeleteTarget,
        condition: Option<&QueryPredicate>,
    ) -> StorageResult<Deleted> {
        self.write_transaction(|txn| txn.delete(schema, &target, condition))
    }

    /// Queries rows of `schema`.
    ///
    /// Without pagination the store's default page size applies.
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
    ) -> StorageResult<Vec<Model>> {
        let options = QueryOptions {
            predicate: predicate.cloned(),
            sort: sort.to_vec(),
            pagination,
            ..QueryOptions::default()
        };
        self.query_with(schema, &options)
    }

    /// Queries rows of `schema` with full options.
    ///
    /// # Errors
    ///
    /// Fails if the predicate or sort keys do not compile.
    pub fn query_with(&self, schema: &ModelSchema, options: &QueryOptions) -> StorageResult<Vec<Model>> {
        let plan = QueryPlan::new(schema, &self.registry, options, self.config.default_page_size)?;
        let state = self.state.read();
        let Some(rows) = state.tables.get(schema.name()) else {
            return Ok(Vec::new());
        };
        let mut results = plan.execute(rows.values());
        if !plan.joins.is_empty() {
            for model in &mut results {
                for join in &plan.joins {
                    let parent = model
                        .foreign_key(&join.field)
                        .and_then(|id| state.tables.get(&join.parent)?.get(&id).cloned());
                    if let Some(parent) = parent {
                        model.attach(&join.field, parent);
                    }
                }
            }
        }
        debug!(model = %schema.name(), rows = results.len(), "query executed");
        Ok(results)
    }

    /// Reads one row by identifier, with parents joined.
    ///
    /// # Errors
    ///
    /// Fails only if the join cannot be planned.
    pub fn query_by_id(&self, schema: &ModelSchema, id: &str) -> StorageResult<Option<Model>> {
        let plan = QueryPlan::new(schema, &self.registry, &QueryOptions::default(), 1)?;
        let state = self.state.read();
        let Some(mut model) = state.tables.get(schema.name()).and_then(|t| t.get(id)).cloned() else {
            return Ok(None);
        };
        for join in &plan.joins {
            let parent = model
                .foreign_key(&join.field)
                .and_then(|pid| state.tables.get(&join.parent)?.get(&pid).cloned());
            if let Some(parent) = parent {
                model.attach(&join.field, parent);
            }
        }
        Ok(Some(model))
    }

    /// Returns whether a row exists and, if given, satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Fails if the predicate does not compile.
    pub fn exists(
        &self,
        schema: &ModelSchema,
        id: &str,
        predicate: Option<&QueryPredicate>,
    ) -> StorageResult<bool> {
        let compiled = match predicate {
            Some(p) => CompiledPredicate::compile(schema, p)?,
            None => CompiledPredicate::True,
        };
        let state = self.state.read();
        Ok(state
            .tables
            .get(schema.name())
            .and_then(|t| t.get(id))
            .is_some_and(|row| compiled.matches(row)))
    }

    /// Number of rows in a table.
    pub fn count(&self, model_name: &str) -> usize {
        self.state
            .read()
            .tables
            .get(model_name)
            .map_or(0, |t| t.len())
    }

    /// Reads sync metadata for one model instance.
    pub fn sync_metadata(&self, model_name: &str, model_id: &str) -> Option<MutationSyncMetadata> {
        self.state
            .read()
            .sync_metadata
            .get(&MutationSyncMetadata::key(model_name, model_id))
            .cloned()
    }

    /// Writes sync metadata.
    ///
    /// # Errors
    ///
    /// Fails if the journal append fails.
    pub fn save_sync_metadata(&self, metadata: MutationSyncMetadata) -> StorageResult<()> {
        self.write_transaction(|txn| {
            txn.put_sync_metadata(metadata);
            Ok(())
        })
    }

    /// Outbox rows in sequence order.
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state.read().outbox.values().cloned().collect()
    }

    /// Reads the sync cursor of a model.
    pub fn sync_state(&self, model_name: &str) -> Option<ModelSyncMetadata> {
        self.state.read().sync_state.get(model_name).cloned()
    }

    /// Writes a sync cursor.
    ///
    /// # Errors
    ///
    /// Fails if the journal append fails.
    pub fn save_sync_state(&self, state: ModelSyncMetadata) -> StorageResult<()> {
        self.write_transaction(|txn| {
            txn.put_sync_state(state);
            Ok(())
        })
    }

    /// Drops every row, metadata record, outbox entry and cursor.
    ///
    /// # Errors
    ///
    /// Fails if the journal append fails.
    pub fn clear(&self) -> StorageResult<()> {
        self.write_transaction(|txn| {
            txn.clear();
            Ok(())
        })?;
        info!("local store cleared");
        Ok(())
    }

    /// Current journal size in bytes.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot report its size.
    pub fn journal_size(&self) -> StorageResult<u64> {
        self.journal.lock().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use datasync_model::predicate::field;
    use datasync_model::{FieldType, ModelField, MutationType};
    use std::sync::Arc;

    fn registry() -> ModelRegistry {
        let post = ModelSchema::builder("Post")
            .field(ModelField::id())
            .field(ModelField::new("title", FieldType::String).required())
            .field(ModelField::new("rating", FieldType::Int))
            .field(ModelField::has_many("comments", "Comment", "post"))
            .build()
            .unwrap();
        let comment = ModelSchema::builder("Comment")
            .field(ModelField::id())
            .field(ModelField::new("content", FieldType::String))
            .field(ModelField::belongs_to("post", "Post", "postId"))
            .build()
            .unwrap();
        ModelRegistry::builder()
            .register(post)
            .register(comment)
            .build()
            .unwrap()
    }

    fn schema(store: &LocalStore, name: &str) -> Arc<ModelSchema> {
        store.registry().schema(name).unwrap().clone()
    }

    fn post(store: &LocalStore, id: &str, title: &str, rating: i64) -> Model {
        Model::builder(&schema(store, "Post"))
            .set("id", id)
            .set("title", title)
            .set("rating", rating)
            .build()
            .unwrap()
    }

    #[test]
    fn save_reports_create_then_update() {
        let store = LocalStore::in_memory(registry()).unwrap();
        let first = store.save(&post(&store, "p1", "a", 1), None).unwrap();
        assert!(first.old.is_none());
        assert_eq!(first.event.mutation_type, MutationType::Create);

        let second = store.save(&post(&store, "p1", "b", 1), None).unwrap();
        assert_eq!(second.old.unwrap().get("title").as_str(), Some("a"));
        assert_eq!(second.event.mutation_type, MutationType::Update);
    }

    #[test]
    fn commit_hook_runs_only_for_committed_writes() {
        let store = LocalStore::in_memory(registry()).unwrap();
        let (first, second) = (post(&store, "p1", "a", 1), post(&store, "p1", "b", 1));
        let mut seen = Vec::new();
        let saved = store
            .write_transaction_then(
                |txn| txn.save(&first, None),
                |saved: &Saved| seen.push(saved.event.model_id.clone()),
            )
            .unwrap();
        assert_eq!(saved.event.mutation_type, MutationType::Create);

        let cond = field("rating").gt(3);
        let failed = store.write_transaction_then(
            |txn| txn.save(&second, Some(&cond)),
            |saved: &Saved| seen.push(saved.event.model_id.clone()),
        );
        assert!(failed.is_err());
        assert_eq!(seen, vec!["p1".to_string()]);
    }

    #[test]
    fn failed_condition_leaves_store_untouched() {
        let store = LocalStore::in_memory(registry()).unwrap();
        let cond = field("rating").gt(3);

        let err = store.save(&post(&store, "p1", "a", 1), Some(&cond)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidCondition { .. }));
        assert_eq!(store.count("Post"), 0);

        store.save(&post(&store, "p1", "a", 1), None).unwrap();
        let err = store.save(&post(&store, "p1", "b", 5), Some(&cond)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidCondition { .. }));
        let s = schema(&store, "Post");
        let row = store.query_by_id(&s, "p1").unwrap().unwrap();
        assert_eq!(row.get("title").as_str(), Some("a"));

        store.save(&post(&store, "p1", "c", 5), Some(&field("rating").eq(1))).unwrap();
    }

    #[test]
    fn cascade_delete_removes_children_first() {
        let store = LocalStore::in_memory(registry()).unwrap();
        store.save(&post(&store, "p1", "a", 1), None).unwrap();
        for id in ["c1", "c2"] {
            let comment = Model::builder(&schema(&store, "Comment"))
                .set("id", id)
                .set("post", "p1")
                .build()
                .unwrap();
            store.save(&comment, None).unwrap();
        }

        let deleted = store
            .delete(&schema(&store, "Post"), DeleteTarget::Id("p1".into()), None)
            .unwrap();
        assert_eq!(deleted.models.len(), 1);
        assert_eq!(deleted.cascaded.len(), 2);
        let names: Vec<&str> = deleted.events.iter().map(|e| e.model_name.as_str()).collect();
        assert_eq!(names, vec!["Comment", "Comment", "Post"]);
        assert_eq!(store.count("Comment"), 0);
    }

    #[test]
    fn delete_missing_rows() {
        let store = LocalStore::in_memory(registry()).unwrap();
        let s = schema(&store, "Post");
        let none = store.delete(&s, DeleteTarget::Predicate(field("rating").gt(0)), None).unwrap();
        assert!(none.models.is_empty());
        let none = store.delete(&s, DeleteTarget::Id("ghost".into()), None).unwrap();
        assert!(none.events.is_empty());
        let err = store
            .delete(&s, DeleteTarget::Id("ghost".into()), Some(&field("rating").eq(1)))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidCondition { .. }));
    }

    #[test]
    fn query_joins_parent_unless_keys_only() {
        let store = LocalStore::in_memory(registry()).unwrap();
        store.save(&post(&store, "p1", "a", 1), None).unwrap();
        let comment = Model::builder(&schema(&store, "Comment"))
            .set("id", "c1")
            .set("post", "p1")
            .build()
            .unwrap();
        store.save(&comment, None).unwrap();

        let s = schema(&store, "Comment");
        let joined = store.query(&s, None, &[], None).unwrap();
        let parent = joined[0].get("post").as_model().unwrap();
        assert_eq!(parent.get("title").as_str(), Some("a"));

        let options = QueryOptions::new().with_projection(crate::Projection::PrimaryKeysOnly);
        let bare = store.query_with(&s, &options).unwrap();
        assert_eq!(bare[0].get("post").as_str(), Some("p1"));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = LocalStore::in_memory(registry()).unwrap();
        let p = post(&store, "p1", "a", 1);
        let result: StorageResult<()> = store.write_transaction(|txn| {
            txn.save(&p, None)?;
            txn.put_sync_metadata(MutationSyncMetadata {
                model_id: "p1".into(),
                model_name: "Post".into(),
                version: 1,
                deleted: false,
                last_changed_at: 0,
            });
            Err(StorageError::corrupted("boom"))
        });
        assert!(result.is_err());
        assert_eq!(store.count("Post"), 0);
        assert!(store.sync_metadata("Post", "p1").is_none());
    }

    #[test]
    fn save_event_carries_known_version() {
        let store = LocalStore::in_memory(registry()).unwrap();
        store
            .save_sync_metadata(MutationSyncMetadata {
                model_id: "p1".into(),
                model_name: "Post".into(),
                version: 7,
                deleted: false,
                last_changed_at: 0,
            })
            .unwrap();
        let saved = store.save(&post(&store, "p1", "a", 1), None).unwrap();
        assert_eq!(saved.event.version, Some(7));
    }
}
