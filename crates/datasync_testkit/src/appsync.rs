//! An in-process GraphQL backend with conflict detection.
//!
//! [`InMemoryAppSync`] answers the requests the engine builds: versioned
//! create/update/delete mutations with `$condition`, `get`, `list` and
//! paged `sync` queries with a `lastSync` cursor, and `on<Kind><Model>`
//! subscriptions that observe every accepted write. Writes made by "other
//! clients" go through [`InMemoryAppSync::remote_save`] and
//! [`InMemoryAppSync::remote_delete`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use datasync_engine::{
    ConnectionState, GraphQLTransport, Headers, SubscriptionEvent, SyncError, SyncResult,
};
use datasync_graphql::{
    mutation_input, AppSyncErrorType, DocumentDirective, GraphQLRequest, GraphQLResponse,
    GraphQLResponseError, OperationType,
};
use datasync_model::{
    now_millis, JsonMap, Model, ModelRegistry, ModelSchema, MutationType, COMPOSITE_KEY_SEPARATOR,
};
use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_LIMIT: usize = 100;

/// A stored row with its conflict-detection bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    /// Stored fields, belongs-to fields as foreign-key columns.
    pub data: JsonMap,
    /// Server version, starting at 1.
    pub version: i64,
    /// Tombstone flag.
    pub deleted: bool,
    /// Last change, epoch milliseconds.
    pub last_changed_at: i64,
}

impl RemoteRecord {
    /// The row as a selection set returns it.
    pub fn to_json(&self, model_name: &str) -> Json {
        let mut object = self.data.clone();
        object.insert("__typename".into(), Json::String(model_name.to_string()));
        object.insert("_version".into(), Json::from(self.version));
        object.insert("_deleted".into(), Json::Bool(self.deleted));
        object.insert("_lastChangedAt".into(), Json::from(self.last_changed_at));
        Json::Object(object)
    }
}

#[derive(Default)]
struct State {
    records: BTreeMap<String, BTreeMap<String, RemoteRecord>>,
    subscribers: Vec<(String, mpsc::UnboundedSender<SubscriptionEvent>)>,
    requests: Vec<GraphQLRequest>,
    failures: VecDeque<SyncError>,
    rejections: VecDeque<GraphQLResponseError>,
    offline: bool,
    hold_subscriptions: bool,
    clock: i64,
}

impl State {
    /// Strictly increasing server time.
    fn tick(&mut self) -> i64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    fn broadcast(&mut self, document_name: &str, value: Json) -> usize {
        let response = GraphQLResponse::success(document_name, value);
        self.subscribers.retain(|(_, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (name, tx) in &self.subscribers {
            if name == document_name && tx.send(SubscriptionEvent::Data(response.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// In-memory backend for engine tests.
pub struct InMemoryAppSync {
    registry: ModelRegistry,
    state: Mutex<State>,
}

impl InMemoryAppSync {
    /// Creates an empty backend for `registry`.
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            state: Mutex::new(State::default()),
        }
    }

    /// Stores `model` at `version` without notifying subscribers.
    pub fn seed(&self, model: &Model, version: i64) {
        let mut state = self.state.lock();
        let now = state.tick();
        state
            .records
            .entry(model.model_name().to_string())
            .or_default()
            .insert(
                model.identifier_string(),
                RemoteRecord {
                    data: mutation_input(model),
                    version,
                    deleted: false,
                    last_changed_at: now,
                },
            );
    }

    /// Writes `model` as another client would and notifies subscribers.
    ///
    /// Returns the new version.
    pub fn remote_save(&self, model: &Model) -> i64 {
        let mut state = self.state.lock();
        let now = state.tick();
        let name = model.model_name().to_string();
        let records = state.records.entry(name.clone()).or_default();
        let record = records
            .entry(model.identifier_string())
            .and_modify(|r| {
                r.data = mutation_input(model);
                r.version += 1;
                r.deleted = false;
                r.last_changed_at = now;
            })
            .or_insert_with(|| RemoteRecord {
                data: mutation_input(model),
                version: 1,
                deleted: false,
                last_changed_at: now,
            })
            .clone();
        let kind = if record.version == 1 {
            MutationType::Create
        } else {
            MutationType::Update
        };
        let document = DocumentDirective::subscription(kind).document_name(model.schema());
        state.broadcast(&document, record.to_json(&name));
        record.version
    }

    /// Deletes a row as another client would and notifies subscribers.
    ///
    /// Returns the tombstone's version, or `None` when the row is unknown.
    pub fn remote_delete(&self, model_name: &str, model_id: &str) -> Option<i64> {
        let schema = self.registry.schema(model_name).ok()?.clone();
        let mut state = self.state.lock();
        let now = state.tick();
        let record = state.records.get_mut(model_name)?.get_mut(model_id)?;
        record.deleted = true;
        record.version += 1;
        record.last_changed_at = now;
        let record = record.clone();
        let document = DocumentDirective::OnDelete.document_name(&schema);
        state.broadcast(&document, record.to_json(model_name));
        Some(record.version)
    }

    /// The stored row, tombstones included.
    pub fn record(&self, model_name: &str, model_id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .records
            .get(model_name)
            .and_then(|rows| rows.get(model_id))
            .cloned()
    }

    /// Number of live rows of `model_name`.
    pub fn live_count(&self, model_name: &str) -> usize {
        self.state
            .lock()
            .records
            .get(model_name)
            .map_or(0, |rows| rows.values().filter(|r| !r.deleted).count())
    }

    /// Every request received so far, subscriptions included.
    pub fn requests(&self) -> Vec<GraphQLRequest> {
        self.state.lock().requests.clone()
    }

    /// Mutations received so far.
    pub fn mutations(&self) -> Vec<GraphQLRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.operation_type == OperationType::Mutation)
            .cloned()
            .collect()
    }

    /// Makes every request fail with a retryable network error.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Fails the next `execute` with `error`.
    pub fn fail_next(&self, error: SyncError) {
        self.state.lock().failures.push_back(error);
    }

    /// Answers the next mutation with `error` instead of applying it.
    pub fn reject_next_mutation(&self, error: GraphQLResponseError) {
        self.state.lock().rejections.push_back(error);
    }

    /// While set, new subscriptions stay in `Connecting`.
    pub fn hold_subscriptions(&self, hold: bool) {
        self.state.lock().hold_subscriptions = hold;
    }

    /// Reports `Connected` on every open subscription.
    pub fn connect_subscriptions(&self) {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, tx)| {
            tx.send(SubscriptionEvent::Connection(ConnectionState::Connected))
                .is_ok()
        });
    }

    /// Drops every subscription with a `Disconnected` notice.
    pub fn disconnect_subscriptions(&self, error: &str) {
        let subscribers = std::mem::take(&mut self.state.lock().subscribers);
        for (_, tx) in subscribers {
            let _ = tx.send(SubscriptionEvent::Connection(ConnectionState::Disconnected {
                error: Some(error.to_string()),
            }));
        }
    }

    /// Sends a raw event to the subscriptions named `document_name`.
    pub fn emit(&self, document_name: &str, event: SubscriptionEvent) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|(name, _)| name == document_name)
            .filter(|(_, tx)| tx.send(event.clone()).is_ok())
            .count()
    }

    /// Open subscriptions.
    pub fn subscription_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.len()
    }

    fn mutate(
        &self,
        state: &mut State,
        schema: &ModelSchema,
        request: &GraphQLRequest,
    ) -> SyncResult<GraphQLResponse> {
        let path = request.decode_path.as_str();
        if let Some(error) = state.rejections.pop_front() {
            return Ok(rejected(path, error));
        }
        let kind = request
            .mutation_type()
            .ok_or_else(|| SyncError::internal(format!("`{path}` is not a mutation")))?;
        let input = request.input()?;
        let id = record_id(schema, input)?;
        let version = input.get("_version").and_then(Json::as_i64);
        let condition = request.variables.get("condition");
        let now = state.tick();
        let name = schema.name();

        let rows = state.records.entry(name.to_string()).or_default();
        let record = match (kind, rows.get_mut(&id)) {
            (MutationType::Create, Some(_)) => return Ok(conditional_check_failed(path)),
            (MutationType::Create, None) => {
                let mut data = input.clone();
                data.remove("_version");
                let record = RemoteRecord {
                    data,
                    version: 1,
                    deleted: false,
                    last_changed_at: now,
                };
                rows.insert(id.clone(), record.clone());
                record
            }
            (_, None) => return Ok(conditional_check_failed(path)),
            (_, Some(existing)) if existing.deleted || version != Some(existing.version) => {
                return Ok(conflict(path, existing.to_json(name)));
            }
            (_, Some(existing)) if condition.is_some_and(|c| !matches_filter(&existing.data, c)) => {
                return Ok(conditional_check_failed(path));
            }
            (MutationType::Update, Some(existing)) => {
                for (key, value) in input {
                    if key != "_version" {
                        existing.data.insert(key.clone(), value.clone());
                    }
                }
                existing.version += 1;
                existing.last_changed_at = now;
                existing.clone()
            }
            (MutationType::Delete, Some(existing)) => {
                existing.deleted = true;
                existing.version += 1;
                existing.last_changed_at = now;
                existing.clone()
            }
        };

        debug!(model = %name, model_id = %id, version = record.version, mutation = %kind, "backend accepted mutation");
        let value = record.to_json(name);
        state.broadcast(
            &DocumentDirective::subscription(kind).document_name(schema),
            value.clone(),
        );
        Ok(GraphQLResponse::success(path, value))
    }

    fn query(
        &self,
        state: &mut State,
        schema: &ModelSchema,
        request: &GraphQLRequest,
    ) -> SyncResult<GraphQLResponse> {
        let path = request.decode_path.as_str();
        let name = schema.name();
        let variables = &request.variables;

        if path == DocumentDirective::Get.document_name(schema) {
            let id = record_id(schema, variables)?;
            let value = state
                .records
                .get(name)
                .and_then(|rows| rows.get(&id))
                .map_or(Json::Null, |r| r.to_json(name));
            return Ok(GraphQLResponse::success(path, value));
        }

        let sync = path == DocumentDirective::Sync.document_name(schema);
        if !sync && path != DocumentDirective::List.document_name(schema) {
            return Err(SyncError::internal(format!("unsupported query `{path}`")));
        }
        let last_sync = variables.get("lastSync").and_then(Json::as_i64);
        let filter = variables.get("filter");
        let limit = variables
            .get("limit")
            .and_then(Json::as_u64)
            .map_or(DEFAULT_LIMIT, |l| usize::try_from(l).unwrap_or(usize::MAX));
        let offset = match variables.get("nextToken").and_then(Json::as_str) {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SyncError::Decoding(format!("malformed nextToken `{token}`")))?,
            None => 0,
        };
        let started_at = state.tick();

        // The limit bounds the rows scanned; the filter runs on each scanned
        // window, so a filtered page can come back short with a token.
        let scanned: Vec<&RemoteRecord> = state
            .records
            .get(name)
            .into_iter()
            .flat_map(|rows| rows.values())
            .filter(|r| last_sync.map_or(true, |since| r.last_changed_at >= since))
            .collect();
        let window: Vec<&RemoteRecord> = scanned.iter().skip(offset).take(limit).copied().collect();
        let end = offset + window.len();
        let page: Vec<Json> = window
            .into_iter()
            .filter(|r| filter.map_or(true, |f| matches_filter(&r.data, f)))
            .map(|r| r.to_json(name))
            .collect();
        let next_token = if end < scanned.len() {
            Json::String(end.to_string())
        } else {
            Json::Null
        };

        let mut connection = JsonMap::new();
        connection.insert("items".into(), Json::Array(page));
        connection.insert("nextToken".into(), next_token);
        if sync {
            connection.insert("startedAt".into(), Json::from(started_at));
        }
        Ok(GraphQLResponse::success(path, Json::Object(connection)))
    }
}

#[async_trait]
impl GraphQLTransport for InMemoryAppSync {
    async fn execute(&self, request: &GraphQLRequest, _headers: &Headers) -> SyncResult<GraphQLResponse> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        if state.offline {
            return Err(SyncError::network_retryable("backend unreachable"));
        }
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        let schema = self.registry.schema(&request.model_name)?.clone();
        match request.operation_type {
            OperationType::Mutation => self.mutate(&mut state, &schema, request),
            OperationType::Query => self.query(&mut state, &schema, request),
            OperationType::Subscription => Err(SyncError::internal(
                "subscriptions are opened with `subscribe`",
            )),
        }
    }

    async fn subscribe(
        &self,
        request: &GraphQLRequest,
        _headers: &Headers,
    ) -> SyncResult<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        if state.offline {
            return Err(SyncError::network_retryable("backend unreachable"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SubscriptionEvent::Connection(ConnectionState::Connecting));
        if !state.hold_subscriptions {
            let _ = tx.send(SubscriptionEvent::Connection(ConnectionState::Connected));
        }
        state.subscribers.push((request.decode_path.clone(), tx));
        Ok(rx)
    }
}

/// Flattens the key fields found in `object` the way model identifiers are
/// flattened.
fn record_id(schema: &ModelSchema, object: &JsonMap) -> SyncResult<String> {
    let parts = schema
        .primary_key()
        .iter()
        .map(|key| match object.get(key) {
            Some(Json::String(s)) => Ok(s.clone()),
            Some(Json::Null) | None => Err(SyncError::Decoding(format!(
                "`{}` key field `{key}` is missing",
                schema.name()
            ))),
            Some(other) => Ok(other.to_string()),
        })
        .collect::<SyncResult<Vec<_>>>()?;
    Ok(parts.join(COMPOSITE_KEY_SEPARATOR))
}

fn rejected(path: &str, error: GraphQLResponseError) -> GraphQLResponse {
    GraphQLResponse {
        data: Some(json!({ path: null })),
        errors: vec![error],
    }
}

fn conditional_check_failed(path: &str) -> GraphQLResponse {
    rejected(
        path,
        GraphQLResponseError::new("The conditional request failed")
            .with_error_type(&AppSyncErrorType::ConditionalCheck),
    )
}

fn conflict(path: &str, remote: Json) -> GraphQLResponse {
    rejected(
        path,
        GraphQLResponseError::new("Conflict resolver rejects mutation.")
            .with_error_type(&AppSyncErrorType::ConflictUnhandled)
            .with_extension("data", remote),
    )
}

/// Evaluates an encoded `Model<Name>FilterInput` against a stored row.
///
/// An empty filter matches everything.
pub fn matches_filter(record: &JsonMap, filter: &Json) -> bool {
    let Some(object) = filter.as_object() else {
        return false;
    };
    object.iter().all(|(key, body)| match key.as_str() {
        "and" => body
            .as_array()
            .is_some_and(|items| items.iter().all(|f| matches_filter(record, f))),
        "or" => body
            .as_array()
            .is_some_and(|items| items.iter().any(|f| matches_filter(record, f))),
        "not" => !matches_filter(record, body),
        field => {
            let value = record.get(field).unwrap_or(&Json::Null);
            body.as_object()
                .is_some_and(|ops| ops.iter().all(|(op, operand)| compare(value, op, operand)))
        }
    })
}

fn compare(value: &Json, op: &str, operand: &Json) -> bool {
    match op {
        "eq" => json_eq(value, operand),
        "ne" => !json_eq(value, operand),
        "lt" => ordering(value, operand) == Some(Ordering::Less),
        "le" => matches!(ordering(value, operand), Some(Ordering::Less | Ordering::Equal)),
        "gt" => ordering(value, operand) == Some(Ordering::Greater),
        "ge" => matches!(ordering(value, operand), Some(Ordering::Greater | Ordering::Equal)),
        "contains" => contains(value, operand),
        "notContains" => !contains(value, operand),
        "beginsWith" => value
            .as_str()
            .zip(operand.as_str())
            .is_some_and(|(v, prefix)| v.starts_with(prefix)),
        "between" => match operand.as_array().map(Vec::as_slice) {
            Some([low, high]) => {
                matches!(ordering(value, low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(ordering(value, high), Some(Ordering::Less | Ordering::Equal))
            }
            _ => false,
        },
        _ => false,
    }
}

fn json_eq(a: &Json, b: &Json) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn ordering(a: &Json, b: &Json) -> Option<Ordering> {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(value: &Json, needle: &Json) -> bool {
    match value {
        Json::Array(items) => items.iter().any(|item| json_eq(item, needle)),
        Json::String(haystack) => needle.as_str().is_some_and(|n| haystack.contains(n)),
        _ => false,
    }
}
