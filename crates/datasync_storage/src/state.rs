//! In-memory tables and the change/undo machinery behind transactions.

use std::collections::{BTreeMap, HashMap};

use datasync_model::{Model, ModelRegistry, ModelSyncMetadata, MutationSyncMetadata};
use tracing::warn;

use crate::error::StorageResult;
use crate::journal::{JournalBatch, JournalOp};
use crate::records::OutboxRecord;

/// All tables of a store.
#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    /// Model rows by model name, then by identifier.
    pub tables: HashMap<String, BTreeMap<String, Model>>,
    /// Sync metadata by `model|id`.
    pub sync_metadata: BTreeMap<String, MutationSyncMetadata>,
    /// Outbox rows by sequence.
    pub outbox: BTreeMap<u64, OutboxRecord>,
    /// Sync cursors by model name.
    pub sync_state: BTreeMap<String, ModelSyncMetadata>,
}

/// A decoded change, applied to [`StoreState`].
#[derive(Debug, Clone)]
pub(crate) enum Change {
    PutModel(Model),
    DeleteModel { model: String, id: String },
    PutSyncMetadata(MutationSyncMetadata),
    DeleteSyncMetadata { key: String },
    PutOutbox(OutboxRecord),
    DeleteOutbox { sequence: u64 },
    PutSyncState(ModelSyncMetadata),
    Clear,
}

impl Change {
    /// Journal form of the change.
    pub fn to_journal(&self) -> JournalOp {
        match self {
            Change::PutModel(model) => JournalOp::PutModel {
                model: model.model_name().to_string(),
                id: model.identifier_string(),
                json: model.to_json_string(),
            },
            Change::DeleteModel { model, id } => JournalOp::DeleteModel {
                model: model.clone(),
                id: id.clone(),
            },
            Change::PutSyncMetadata(meta) => JournalOp::PutSyncMetadata(meta.clone()),
            Change::DeleteSyncMetadata { key } => JournalOp::DeleteSyncMetadata { key: key.clone() },
            Change::PutOutbox(record) => JournalOp::PutOutbox(record.clone()),
            Change::DeleteOutbox { sequence } => JournalOp::DeleteOutbox {
                sequence: *sequence,
            },
            Change::PutSyncState(state) => JournalOp::PutSyncState(state.clone()),
            Change::Clear => JournalOp::Clear,
        }
    }

    /// Decodes a journal op. Rows of models that are no longer registered
    /// are skipped.
    pub fn from_journal(op: JournalOp, registry: &ModelRegistry) -> StorageResult<Option<Self>> {
        Ok(Some(match op {
            JournalOp::PutModel { model, id, json } => {
                let Ok(schema) = registry.schema(&model) else {
                    warn!(model = %model, model_id = %id, "skipping row of unregistered model");
                    return Ok(None);
                };
                Change::PutModel(Model::from_json_str(schema, registry, &json)?)
            }
            JournalOp::DeleteModel { model, id } => Change::DeleteModel { model, id },
            JournalOp::PutSyncMetadata(meta) => Change::PutSyncMetadata(meta),
            JournalOp::DeleteSyncMetadata { key } => Change::DeleteSyncMetadata { key },
            JournalOp::PutOutbox(record) => Change::PutOutbox(record),
            JournalOp::DeleteOutbox { sequence } => Change::DeleteOutbox { sequence },
            JournalOp::PutSyncState(state) => Change::PutSyncState(state),
            JournalOp::Clear => Change::Clear,
        }))
    }
}

/// Inverse of an applied change.
#[derive(Debug)]
pub(crate) enum Undo {
    Model {
        model: String,
        id: String,
        prev: Option<Model>,
    },
    SyncMetadata {
        key: String,
        prev: Option<MutationSyncMetadata>,
    },
    Outbox {
        sequence: u64,
        prev: Option<OutboxRecord>,
    },
    SyncState {
        model: String,
        prev: Option<ModelSyncMetadata>,
    },
    Everything(Box<StoreState>),
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, prev: Option<V>) {
    match prev {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl StoreState {
    /// Applies a change and returns its inverse.
    pub fn apply(&mut self, change: Change) -> Undo {
        match change {
            Change::PutModel(model) => {
                let name = model.model_name().to_string();
                let id = model.identifier_string();
                let prev = self
                    .tables
                    .entry(name.clone())
                    .or_default()
                    .insert(id.clone(), model);
                Undo::Model {
                    model: name,
                    id,
                    prev,
                }
            }
            Change::DeleteModel { model, id } => {
                let prev = self.tables.get_mut(&model).and_then(|t| t.remove(&id));
                Undo::Model { model, id, prev }
            }
            Change::PutSyncMetadata(meta) => {
                let key = meta.identifier();
                let prev = self.sync_metadata.insert(key.clone(), meta);
                Undo::SyncMetadata { key, prev }
            }
            Change::DeleteSyncMetadata { key } => {
                let prev = self.sync_metadata.remove(&key);
                Undo::SyncMetadata { key, prev }
            }
            Change::PutOutbox(record) => {
                let sequence = record.sequence;
                let prev = self.outbox.insert(sequence, record);
                Undo::Outbox { sequence, prev }
            }
            Change::DeleteOutbox { sequence } => {
                let prev = self.outbox.remove(&sequence);
                Undo::Outbox { sequence, prev }
            }
            Change::PutSyncState(state) => {
                let model = state.model_name.clone();
                let prev = self.sync_state.insert(model.clone(), state);
                Undo::SyncState { model, prev }
            }
            Change::Clear => Undo::Everything(Box::new(std::mem::take(self))),
        }
    }

    /// Reverts one change.
    pub fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Model { model, id, prev } => {
                restore(self.tables.entry(model).or_default(), id, prev);
            }
            Undo::SyncMetadata { key, prev } => restore(&mut self.sync_metadata, key, prev),
            Undo::Outbox { sequence, prev } => restore(&mut self.outbox, sequence, prev),
            Undo::SyncState { model, prev } => restore(&mut self.sync_state, model, prev),
            Undo::Everything(state) => *self = *state,
        }
    }

    /// Rebuilds the state as a single snapshot batch.
    pub fn snapshot(&self) -> JournalBatch {
        let mut ops = vec![JournalOp::Clear];
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        for name in names {
            if let Some(rows) = self.tables.get(name) {
                ops.extend(rows.values().map(|m| Change::PutModel(m.clone()).to_journal()));
            }
        }
        ops.extend(self.sync_metadata.values().cloned().map(JournalOp::PutSyncMetadata));
        ops.extend(self.outbox.values().cloned().map(JournalOp::PutOutbox));
        ops.extend(self.sync_state.values().cloned().map(JournalOp::PutSyncState));
        JournalBatch { ops }
    }

    /// Number of model rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }
}
