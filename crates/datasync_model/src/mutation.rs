//! Mutation events and sync bookkeeping records.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ModelResult;
use crate::model::Model;
use crate::registry::ModelRegistry;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Kind of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    /// A new row.
    Create,
    /// A change to an existing row.
    Update,
    /// A removal.
    Delete,
}

impl MutationType {
    /// Lowercase name (`create`, `update`, `delete`).
    pub fn as_str(self) -> &'static str {
        match self {
            MutationType::Create => "create",
            MutationType::Update => "update",
            MutationType::Delete => "delete",
        }
    }

    /// Capitalized verb used in GraphQL document names.
    pub fn verb(self) -> &'static str {
        match self {
            MutationType::Create => "Create",
            MutationType::Update => "Update",
            MutationType::Delete => "Delete",
        }
    }

    /// Infers the kind of a change received from the backend.
    pub fn from_remote(version: i64, deleted: bool) -> Self {
        if deleted {
            MutationType::Delete
        } else if version == 1 {
            MutationType::Create
        } else {
            MutationType::Update
        }
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of one successful local write.
///
/// Created by the storage adapter, queued by the outbox, and published to
/// observers. `json` is the model encoded with [`Model::to_json_string`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Unique event id.
    pub id: String,
    /// Identifier of the written model.
    pub model_id: String,
    /// Name of the written model.
    pub model_name: String,
    /// JSON encoding of the model.
    pub json: String,
    /// Kind of write.
    pub mutation_type: MutationType,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last version known to this client, sent as `_version`.
    pub version: Option<i64>,
    /// Condition sent as `$condition`, already encoded as a GraphQL filter.
    pub graphql_filter: Option<String>,
}

impl MutationEvent {
    /// Creates an event for `model`.
    pub fn new(model: &Model, mutation_type: MutationType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model.identifier_string(),
            model_name: model.model_name().to_string(),
            json: model.without_associations().to_json_string(),
            mutation_type,
            created_at: now_millis(),
            version: None,
            graphql_filter: None,
        }
    }

    /// Sets the known version.
    #[must_use]
    pub fn with_version(mut self, version: Option<i64>) -> Self {
        self.version = version;
        self
    }

    /// Sets the encoded condition.
    #[must_use]
    pub fn with_graphql_filter(mut self, filter: Option<String>) -> Self {
        self.graphql_filter = filter;
        self
    }

    /// Decodes the model carried by the event.
    ///
    /// # Errors
    ///
    /// Fails when the model is unregistered or `json` does not match it.
    pub fn decode_model(&self, registry: &ModelRegistry) -> ModelResult<Model> {
        let schema = registry.schema(&self.model_name)?;
        Model::from_json_str(schema, registry, &self.json)
    }
}

/// Server bookkeeping for one model instance.
///
/// A row with `deleted == true` is a tombstone and is kept so that late
/// remote events can still be compared against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationSyncMetadata {
    /// Identifier of the model instance.
    pub model_id: String,
    /// Model name.
    pub model_name: String,
    /// Server version. Never decreases for a given id.
    pub version: i64,
    /// Tombstone flag.
    pub deleted: bool,
    /// Last server-side change, epoch milliseconds.
    pub last_changed_at: i64,
}

impl MutationSyncMetadata {
    /// Key of the metadata row for `(model_name, model_id)`.
    pub fn key(model_name: &str, model_id: &str) -> String {
        format!("{model_name}|{model_id}")
    }

    /// Key of this row.
    pub fn identifier(&self) -> String {
        Self::key(&self.model_name, &self.model_id)
    }
}

/// A model together with its sync metadata, as returned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationSync {
    /// The model.
    pub model: Model,
    /// Server bookkeeping.
    pub sync_metadata: MutationSyncMetadata,
}

/// Per-model cursor for incremental initial sync.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelSyncMetadata {
    /// Model name.
    pub model_name: String,
    /// `startedAt` of the last completed sync, epoch milliseconds.
    pub last_sync: Option<i64>,
    /// Token of a sync that stopped part way through.
    pub next_token: Option<String>,
}

impl ModelSyncMetadata {
    /// Creates an empty cursor for `model_name`.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            last_sync: None,
            next_token: None,
        }
    }
}
