//! Write transactions.

use datasync_model::{
    Model, ModelRegistry, ModelSchema, ModelSyncMetadata, MutationEvent, MutationSyncMetadata,
    MutationType, QueryPredicate,
};
use tracing::debug;

use crate::compiler::{CompiledPredicate, QueryPlan};
use crate::error::{StorageError, StorageResult};
use crate::journal::JournalBatch;
use crate::records::OutboxRecord;
use crate::state::{Change, StoreState, Undo};

/// Outcome of a successful save.
#[derive(Debug, Clone)]
pub struct Saved {
    /// Row before the write, if any.
    pub old: Option<Model>,
    /// Row as stored.
    pub new: Model,
    /// Event describing the write.
    pub event: MutationEvent,
}

/// Outcome of a delete.
#[derive(Debug, Clone, Default)]
pub struct Deleted {
    /// Rows selected by the caller's id or predicate.
    pub models: Vec<Model>,
    /// Child rows removed by cascade.
    pub cascaded: Vec<Model>,
    /// One event per removed row, children before their parent.
    pub events: Vec<MutationEvent>,
}

/// Selects the rows of a delete.
#[derive(Debug, Clone)]
pub enum DeleteTarget {
    /// A single row by identifier string.
    Id(String),
    /// Every row matching the predicate.
    Predicate(QueryPredicate),
}

/// A write transaction.
///
/// Changes are applied to the tables immediately so later reads in the same
/// transaction observe them. If the closure passed to
/// [`crate::LocalStore::write_transaction`] returns an error, or the journal
/// append fails, every change is reverted.
pub struct Transaction<'a> {
    state: &'a mut StoreState,
    registry: &'a ModelRegistry,
    batch: JournalBatch,
    undo: Vec<Undo>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(state: &'a mut StoreState, registry: &'a ModelRegistry) -> Self {
        Self {
            state,
            registry,
            batch: JournalBatch::default(),
            undo: Vec::new(),
        }
    }

    fn apply(&mut self, change: Change) {
        self.batch.ops.push(change.to_journal());
        let undo = self.state.apply(change);
        self.undo.push(undo);
    }

    pub(crate) fn into_parts(self) -> (JournalBatch, Vec<Undo>) {
        (self.batch, self.undo)
    }

    /// The registry the store was opened with.
    pub fn registry(&self) -> &ModelRegistry {
        self.registry
    }

    /// Reads a row.
    pub fn get(&self, model_name: &str, id: &str) -> Option<&Model> {
        self.state.tables.get(model_name).and_then(|t| t.get(id))
    }

    /// Runs a plan over one table, without joins.
    pub fn select(&self, schema: &ModelSchema, plan: &QueryPlan) -> Vec<Model> {
        match self.state.tables.get(schema.name()) {
            Some(rows) => plan.execute(rows.values()),
            None => Vec::new(),
        }
    }

    /// Inserts or replaces a row without events or condition checks.
    /// Joined parents are stored as identifiers.
    ///
    /// # Errors
    ///
    /// Fails if the model is not registered.
    pub fn put_model(&mut self, model: &Model) -> StorageResult<Option<Model>> {
        self.registry.schema(model.model_name())?;
        let prev = self
            .get(model.model_name(), &model.identifier_string())
            .cloned();
        self.apply(Change::PutModel(model.without_associations()));
        Ok(prev)
    }

    /// Removes a row without events or cascade.
    pub fn remove_model(&mut self, model_name: &str, id: &str) -> Option<Model> {
        let prev = self.get(model_name, id).cloned();
        if prev.is_some() {
            self.apply(Change::DeleteModel {
                model: model_name.to_string(),
                id: id.to_string(),
            });
        }
        prev
    }

    /// Conditionally saves a model and returns the resulting event.
    ///
    /// A condition other than [`QueryPredicate::All`] requires an existing
    /// row that satisfies it.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidCondition`] when the condition does not hold
    /// or there is no row to check it against. The tables are untouched
    /// then.
    pub fn save(&mut self, model: &Model, condition: Option<&QueryPredicate>) -> StorageResult<Saved> {
        let schema = self.registry.schema(model.model_name())?.clone();
        let id = model.identifier_string();
        let old = self.get(schema.name(), &id).cloned();

        if let Some(condition) = condition.filter(|c| !c.is_all()) {
            let compiled = CompiledPredicate::compile(&schema, condition)?;
            match &old {
                None => {
                    return Err(StorageError::invalid_condition(
                        schema.name(),
                        &id,
                        "cannot apply a condition to a model that does not exist",
                    ))
                }
                Some(row) if !compiled.matches(row) => {
                    return Err(StorageError::invalid_condition(
                        schema.name(),
                        &id,
                        "condition does not match the stored row",
                    ))
                }
                Some(_) => {}
            }
        }

        self.put_model(model)?;
        let mutation_type = if old.is_some() {
            MutationType::Update
        } else {
            MutationType::Create
        };
        let version = self.sync_metadata(schema.name(), &id).map(|m| m.version);
        let event = MutationEvent::new(model, mutation_type).with_version(version);
        debug!(model = %schema.name(), model_id = %id, kind = %mutation_type, "model saved");

        Ok(Saved {
            old,
            new: model.without_associations(),
            event,
        })
    }

    /// Deletes rows and, recursively, the children associated to them.
    ///
    /// Deleting a missing id without a condition, or a predicate matching
    /// nothing, succeeds with an empty result.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidCondition`] when a condition is given and the
    /// row is missing or does not satisfy it.
    pub fn delete(
        &mut self,
        schema: &ModelSchema,
        target: &DeleteTarget,
        condition: Option<&QueryPredicate>,
    ) -> StorageResult<Deleted> {
        let condition = condition.filter(|c| !c.is_all());
        let targets = match target {
            DeleteTarget::Id(id) => match (self.get(schema.name(), id).cloned(), condition) {
                (None, None) => Vec::new(),
                (None, Some(_)) => {
                    return Err(StorageError::invalid_condition(
                        schema.name(),
                        id,
                        "cannot apply a condition to a model that does not exist",
                    ))
                }
                (Some(row), Some(condition)) => {
                    if !CompiledPredicate::compile(schema, condition)?.matches(&row) {
                        return Err(StorageError::invalid_condition(
                            schema.name(),
                            id,
                            "condition does not match the stored row",
                        ));
                    }
                    vec![row]
                }
                (Some(row), None) => vec![row],
            },
            DeleteTarget::Predicate(predicate) => {
                let predicate = match condition {
                    Some(c) => predicate.clone() & c.clone(),
                    None => predicate.clone(),
                };
                let plan = QueryPlan::scan(schema, &predicate)?;
                self.select(schema, &plan)
            }
        };

        let mut deleted = Deleted::default();
        for row in targets {
            self.cascade(&row, &mut deleted)?;
            deleted.models.push(row);
        }
        Ok(deleted)
    }

    fn cascade(&mut self, row: &Model, deleted: &mut Deleted) -> StorageResult<()> {
        let parent_id = row.identifier_string();
        for (child_schema, fk_field) in self.registry.children_of(row.model_name()) {
            let children: Vec<Model> = self
                .state
                .tables
                .get(child_schema.name())
                .map(|rows| {
                    rows.values()
                        .filter(|c| c.foreign_key(&fk_field).as_deref() == Some(parent_id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for child in children {
                self.cascade(&child, deleted)?;
                deleted.cascaded.push(child);
            }
        }

        let id = row.identifier_string();
        if self.remove_model(row.model_name(), &id).is_some() {
            let version = self.sync_metadata(row.model_name(), &id).map(|m| m.version);
            deleted
                .events
                .push(MutationEvent::new(row, MutationType::Delete).with_version(version));
            debug!(model = %row.model_name(), model_id = %id, "model deleted");
        }
        Ok(())
    }

    /// Reads sync metadata.
    pub fn sync_metadata(&self, model_name: &str, model_id: &str) -> Option<&MutationSyncMetadata> {
        self.state
            .sync_metadata
            .get(&MutationSyncMetadata::key(model_name, model_id))
    }

    /// Writes sync metadata.
    pub fn put_sync_metadata(&mut self, metadata: MutationSyncMetadata) {
        self.apply(Change::PutSyncMetadata(metadata));
    }

    /// Removes sync metadata.
    pub fn delete_sync_metadata(&mut self, model_name: &str, model_id: &str) {
        let key = MutationSyncMetadata::key(model_name, model_id);
        if self.state.sync_metadata.contains_key(&key) {
            self.apply(Change::DeleteSyncMetadata { key });
        }
    }

    /// Outbox rows in sequence order.
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state.outbox.values().cloned().collect()
    }

    /// Sequence number for a new outbox row.
    pub fn next_outbox_sequence(&self) -> u64 {
        self.state
            .outbox
            .keys()
            .next_back()
            .map_or(1, |last| last + 1)
    }

    /// Writes an outbox row.
    pub fn put_outbox(&mut self, record: OutboxRecord) {
        self.apply(Change::PutOutbox(record));
    }

    /// Removes an outbox row.
    pub fn delete_outbox(&mut self, sequence: u64) {
        if self.state.outbox.contains_key(&sequence) {
            self.apply(Change::DeleteOutbox { sequence });
        }
    }

    /// Reads a sync cursor.
    pub fn sync_state(&self, model_name: &str) -> Option<&ModelSyncMetadata> {
        self.state.sync_state.get(model_name)
    }

    /// Writes a sync cursor.
    pub fn put_sync_state(&mut self, state: ModelSyncMetadata) {
        self.apply(Change::PutSyncState(state));
    }

    /// Drops every table.
    pub fn clear(&mut self) {
        self.apply(Change::Clear);
    }
}
