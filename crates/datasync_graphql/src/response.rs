//! Response envelopes, AppSync error classification and result decoding.

use std::fmt;
use std::sync::Arc;

use datasync_model::{JsonMap, Model, ModelRegistry, ModelSchema, MutationSync, MutationSyncMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{GraphQLError, GraphQLResult};

/// Classification of a GraphQL error by its `extensions.errorType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppSyncErrorType {
    /// The `_version` sent did not match the server's copy.
    ConflictUnhandled,
    /// The mutation's `$condition` did not hold on the server.
    ConditionalCheck,
    /// The caller is not allowed to perform the operation.
    Unauthorized,
    /// The operation is disabled on the backend.
    OperationDisabled,
    /// Anything else, with the raw type when one was present.
    Unknown(String),
}

impl AppSyncErrorType {
    /// Parses a raw `errorType` value.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "ConflictUnhandled" => AppSyncErrorType::ConflictUnhandled,
            "ConditionalCheckFailedException" => AppSyncErrorType::ConditionalCheck,
            "OperationDisabled" => AppSyncErrorType::OperationDisabled,
            other if other.contains("Unauthorized") => AppSyncErrorType::Unauthorized,
            other => AppSyncErrorType::Unknown(other.to_string()),
        }
    }

    /// Raw `errorType` value.
    pub fn as_str(&self) -> &str {
        match self {
            AppSyncErrorType::ConflictUnhandled => "ConflictUnhandled",
            AppSyncErrorType::ConditionalCheck => "ConditionalCheckFailedException",
            AppSyncErrorType::Unauthorized => "Unauthorized",
            AppSyncErrorType::OperationDisabled => "OperationDisabled",
            AppSyncErrorType::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for AppSyncErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a response's `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLResponseError {
    /// Human-readable message.
    pub message: String,
    /// Path of the failing field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Json>>,
    /// Source locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Json>>,
    /// Backend-specific details (`errorType`, `data`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<JsonMap>,
}

impl GraphQLResponseError {
    /// Creates an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            locations: None,
            extensions: None,
        }
    }

    /// Sets an extension entry.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: Json) -> Self {
        self.extensions
            .get_or_insert_with(JsonMap::new)
            .insert(key.into(), value);
        self
    }

    /// Sets `extensions.errorType`.
    #[must_use]
    pub fn with_error_type(self, error_type: &AppSyncErrorType) -> Self {
        self.with_extension("errorType", Json::String(error_type.as_str().to_string()))
    }

    /// Classification of this error.
    pub fn error_type(&self) -> AppSyncErrorType {
        match self
            .extensions
            .as_ref()
            .and_then(|e| e.get("errorType"))
            .and_then(Json::as_str)
        {
            Some(raw) => AppSyncErrorType::parse(raw),
            None => AppSyncErrorType::Unknown(String::new()),
        }
    }

    /// The server's copy of the model, sent along with a conflict.
    pub fn remote_data(&self) -> Option<&Json> {
        self.extensions
            .as_ref()
            .and_then(|e| e.get("data"))
            .filter(|d| d.is_object())
    }
}

/// A GraphQL response envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// `data` member.
    #[serde(default)]
    pub data: Option<Json>,
    /// `errors` member.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLResponseError>,
}

impl GraphQLResponse {
    /// A successful response whose `data` holds `value` under `decode_path`.
    pub fn success(decode_path: &str, value: Json) -> Self {
        let mut data = JsonMap::new();
        data.insert(decode_path.to_string(), value);
        Self {
            data: Some(Json::Object(data)),
            errors: Vec::new(),
        }
    }

    /// A response carrying only errors.
    pub fn failure(errors: Vec<GraphQLResponseError>) -> Self {
        Self { data: None, errors }
    }

    /// Parses a raw JSON envelope.
    ///
    /// # Errors
    ///
    /// Fails when the envelope is not a GraphQL response object.
    pub fn from_json(json: Json) -> GraphQLResult<Self> {
        Ok(serde_json::from_value(json)?)
    }

    /// Value at `decode_path`, or the errors.
    ///
    /// # Errors
    ///
    /// [`GraphQLError::Response`] when `errors` is non-empty,
    /// [`GraphQLError::Decoding`] when the value is missing or null.
    pub fn into_result(self, decode_path: &str) -> GraphQLResult<Json> {
        if !self.errors.is_empty() {
            return Err(GraphQLError::Response(self.errors));
        }
        match self.data {
            Some(Json::Object(mut data)) => match data.remove(decode_path) {
                Some(Json::Null) | None => Err(GraphQLError::decoding(format!(
                    "response has no value at `{decode_path}`"
                ))),
                Some(value) => Ok(value),
            },
            _ => Err(GraphQLError::decoding("response has no `data` object")),
        }
    }
}

/// Decodes one model with its conflict-resolution fields.
///
/// # Errors
///
/// [`GraphQLError::Decoding`] when `_version` is missing, `__typename`
/// names another model, or the model fields do not decode.
pub fn decode_mutation_sync(
    registry: &ModelRegistry,
    schema: &Arc<ModelSchema>,
    json: &Json,
) -> GraphQLResult<MutationSync> {
    let object = json
        .as_object()
        .ok_or_else(|| GraphQLError::decoding(format!("`{}` is not an object", schema.name())))?;
    if let Some(typename) = object.get("__typename").and_then(Json::as_str) {
        if typename != schema.name() {
            return Err(GraphQLError::decoding(format!(
                "expected `{}`, got `{typename}`",
                schema.name()
            )));
        }
    }
    let version = object
        .get("_version")
        .and_then(Json::as_i64)
        .ok_or_else(|| GraphQLError::decoding(format!("`{}` has no `_version`", schema.name())))?;
    let deleted = object
        .get("_deleted")
        .and_then(Json::as_bool)
        .unwrap_or(false);
    let last_changed_at = object
        .get("_lastChangedAt")
        .and_then(Json::as_i64)
        .unwrap_or_default();

    let model = Model::from_json(schema, registry, json)
        .map_err(|e| GraphQLError::decoding(e.to_string()))?;
    let sync_metadata = MutationSyncMetadata {
        model_id: model.identifier_string(),
        model_name: schema.name().to_string(),
        version,
        deleted,
        last_changed_at,
    };
    Ok(MutationSync {
        model,
        sync_metadata,
    })
}

/// One page of a `list` or `sync` query.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginatedList {
    /// Items of the page. Null items are skipped.
    pub items: Vec<MutationSync>,
    /// Token for the next page, if any.
    pub next_token: Option<String>,
    /// Server time the sync started at, epoch milliseconds.
    pub started_at: Option<i64>,
}

/// Decodes a `list`/`sync` connection object.
///
/// # Errors
///
/// [`GraphQLError::Decoding`] when `items` is missing or an item does not
/// decode.
pub fn decode_paginated_list(
    registry: &ModelRegistry,
    schema: &Arc<ModelSchema>,
    json: &Json,
) -> GraphQLResult<PaginatedList> {
    let items = json
        .get("items")
        .and_then(Json::as_array)
        .ok_or_else(|| GraphQLError::decoding("connection has no `items` array"))?;
    let items = items
        .iter()
        .filter(|item| !item.is_null())
        .map(|item| decode_mutation_sync(registry, schema, item))
        .collect::<GraphQLResult<Vec<_>>>()?;
    Ok(PaginatedList {
        items,
        next_token: json
            .get("nextToken")
            .and_then(Json::as_str)
            .map(str::to_string),
        started_at: json.get("startedAt").and_then(Json::as_i64),
    })
}
