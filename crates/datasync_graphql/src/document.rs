//! Model-based GraphQL document builder.
//!
//! A [`ModelBasedDocumentBuilder`] is created for a schema and an operation
//! type, collects [`DocumentDecorator`]s, and folds them over an immutable
//! [`DocumentSpec`] when [`ModelBasedDocumentBuilder::build`] is called.
//! Each decorator only records its own concern in the spec; the document
//! text is produced from the final spec, so independent decorators can be
//! applied in any order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use datasync_model::{
    Association, FieldValue, JsonMap, Model, ModelRegistry, ModelSchema, MutationType,
    QueryPredicate,
};
use serde_json::Value as Json;
use tracing::trace;

use crate::error::{GraphQLError, GraphQLResult};
use crate::filter::graphql_filter;

/// Conflict-resolution fields appended to every selection set when sync is
/// enabled, in selection order.
pub const CONFLICT_RESOLUTION_FIELDS: [&str; 3] = ["_version", "_deleted", "_lastChangedAt"];

const TYPENAME: &str = "__typename";

/// GraphQL operation keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// `query`
    Query,
    /// `mutation`
    Mutation,
    /// `subscription`
    Subscription,
}

impl OperationType {
    /// Keyword that opens the document.
    pub fn keyword(self) -> &'static str {
        match self {
            OperationType::Query => "query",
            OperationType::Mutation => "mutation",
            OperationType::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// The root field of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentDirective {
    /// `get<Model>`
    Get,
    /// `list<Models>`
    List,
    /// `sync<Models>`
    Sync,
    /// `create<Model>`
    Create,
    /// `update<Model>`
    Update,
    /// `delete<Model>`
    Delete,
    /// `onCreate<Model>`
    OnCreate,
    /// `onUpdate<Model>`
    OnUpdate,
    /// `onDelete<Model>`
    OnDelete,
}

impl DocumentDirective {
    /// Operation type this directive belongs to.
    pub fn operation_type(self) -> OperationType {
        match self {
            DocumentDirective::Get | DocumentDirective::List | DocumentDirective::Sync => {
                OperationType::Query
            }
            DocumentDirective::Create | DocumentDirective::Update | DocumentDirective::Delete => {
                OperationType::Mutation
            }
            DocumentDirective::OnCreate
            | DocumentDirective::OnUpdate
            | DocumentDirective::OnDelete => OperationType::Subscription,
        }
    }

    /// Prefix of the root field name.
    pub fn prefix(self) -> &'static str {
        match self {
            DocumentDirective::Get => "get",
            DocumentDirective::List => "list",
            DocumentDirective::Sync => "sync",
            DocumentDirective::Create => "create",
            DocumentDirective::Update => "update",
            DocumentDirective::Delete => "delete",
            DocumentDirective::OnCreate => "onCreate",
            DocumentDirective::OnUpdate => "onUpdate",
            DocumentDirective::OnDelete => "onDelete",
        }
    }

    /// Root field name for `schema`, for example `listPosts`.
    pub fn document_name(self, schema: &ModelSchema) -> String {
        match self {
            DocumentDirective::List | DocumentDirective::Sync => {
                format!("{}{}", self.prefix(), schema.plural_name())
            }
            _ => format!("{}{}", self.prefix(), schema.name()),
        }
    }

    /// Mutation directive for a local write.
    pub fn mutation(mutation_type: MutationType) -> Self {
        match mutation_type {
            MutationType::Create => DocumentDirective::Create,
            MutationType::Update => DocumentDirective::Update,
            MutationType::Delete => DocumentDirective::Delete,
        }
    }

    /// Subscription directive for a kind of remote change.
    pub fn subscription(mutation_type: MutationType) -> Self {
        match mutation_type {
            MutationType::Create => DocumentDirective::OnCreate,
            MutationType::Update => DocumentDirective::OnUpdate,
            MutationType::Delete => DocumentDirective::OnDelete,
        }
    }

    fn is_paginated(self) -> bool {
        matches!(self, DocumentDirective::List | DocumentDirective::Sync)
    }
}

/// One cross-cutting concern contributed to a document.
#[derive(Debug, Clone)]
pub enum DocumentDecorator {
    /// Fixes the root field.
    Directive(DocumentDirective),
    /// Supplies the `input` of a create or update mutation.
    Model(Model),
    /// Supplies the key of a delete input or the arguments of a get query.
    ModelId(Vec<(String, FieldValue)>),
    /// Adds `$condition` from a predicate.
    Condition(QueryPredicate),
    /// Adds `$condition` from an already encoded filter object.
    EncodedCondition(Json),
    /// Adds the conflict-resolution fields, the known `_version` and, for
    /// sync queries, the `lastSync` cursor.
    ConflictResolution {
        /// Locally known version, sent as `_version`.
        version: Option<i64>,
        /// Cursor timestamp, sent as `$lastSync`.
        last_sync: Option<i64>,
    },
    /// Adds `$limit` and `$nextToken`.
    Pagination {
        /// Page size.
        limit: Option<u64>,
        /// Continuation token.
        next_token: Option<String>,
    },
    /// Adds `$filter`.
    Filter(QueryPredicate),
    /// Truncates nested selections to the parent's key.
    PrimaryKeysOnly,
}

impl DocumentDecorator {
    /// Key decorator for `model`.
    pub fn model_id(model: &Model) -> Self {
        DocumentDecorator::ModelId(model.identifier().fields())
    }

    /// Key decorator for a model keyed by a single `id`.
    pub fn id(id: impl Into<String>) -> Self {
        DocumentDecorator::ModelId(vec![("id".to_string(), FieldValue::String(id.into()))])
    }

    /// Conflict-resolution decorator with nothing known yet.
    pub fn conflict_resolution() -> Self {
        DocumentDecorator::ConflictResolution {
            version: None,
            last_sync: None,
        }
    }

    /// Conflict-resolution decorator carrying the known version.
    pub fn conflict_resolution_with_version(version: Option<i64>) -> Self {
        DocumentDecorator::ConflictResolution {
            version,
            last_sync: None,
        }
    }

    /// Folds this decorator into `spec`.
    ///
    /// # Errors
    ///
    /// Fails when the decorator conflicts with one applied earlier or does
    /// not fit the schema.
    pub fn apply(&self, mut spec: DocumentSpec) -> GraphQLResult<DocumentSpec> {
        match self {
            DocumentDecorator::Directive(directive) => {
                if spec.directive.is_some_and(|d| d != *directive) {
                    return Err(spec.invalid("more than one directive applied"));
                }
                spec.directive = Some(*directive);
            }
            DocumentDecorator::Model(model) => {
                if model.model_name() != spec.schema.name() {
                    return Err(spec.invalid(format!(
                        "model decorator carries a `{}`",
                        model.model_name()
                    )));
                }
                spec.model = Some(model.clone());
            }
            DocumentDecorator::ModelId(key) => {
                for (name, _) in key {
                    if !spec.schema.primary_key().contains(name) {
                        return Err(spec.invalid(format!("`{name}` is not a key field")));
                    }
                }
                spec.identifier = Some(key.clone());
            }
            DocumentDecorator::Condition(predicate) => {
                if !predicate.is_all() {
                    spec.condition = Some(graphql_filter(&spec.schema, predicate));
                }
            }
            DocumentDecorator::EncodedCondition(condition) => {
                spec.condition = Some(condition.clone());
            }
            DocumentDecorator::ConflictResolution { version, last_sync } => {
                spec.conflict_resolution = true;
                spec.version = version.or(spec.version);
                spec.last_sync = last_sync.or(spec.last_sync);
            }
            DocumentDecorator::Pagination { limit, next_token } => {
                spec.limit = limit.or(spec.limit);
                if next_token.is_some() {
                    spec.next_token = next_token.clone();
                }
            }
            DocumentDecorator::Filter(predicate) => {
                if !predicate.is_all() {
                    spec.filter = Some(graphql_filter(&spec.schema, predicate));
                }
            }
            DocumentDecorator::PrimaryKeysOnly => spec.primary_keys_only = true,
        }
        Ok(spec)
    }
}

/// The accumulated, immutable description of a document.
#[derive(Debug, Clone)]
pub struct DocumentSpec {
    schema: Arc<ModelSchema>,
    operation_type: OperationType,
    directive: Option<DocumentDirective>,
    model: Option<Model>,
    identifier: Option<Vec<(String, FieldValue)>>,
    condition: Option<Json>,
    conflict_resolution: bool,
    version: Option<i64>,
    last_sync: Option<i64>,
    limit: Option<u64>,
    next_token: Option<String>,
    filter: Option<Json>,
    primary_keys_only: bool,
}

impl DocumentSpec {
    fn new(schema: Arc<ModelSchema>, operation_type: OperationType) -> Self {
        Self {
            schema,
            operation_type,
            directive: None,
            model: None,
            identifier: None,
            condition: None,
            conflict_resolution: false,
            version: None,
            last_sync: None,
            limit: None,
            next_token: None,
            filter: None,
            primary_keys_only: false,
        }
    }

    /// Schema the document is built for.
    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    /// Directive applied so far.
    pub fn directive(&self) -> Option<DocumentDirective> {
        self.directive
    }

    /// Whether the conflict-resolution decorator was applied.
    pub fn conflict_resolution(&self) -> bool {
        self.conflict_resolution
    }

    fn invalid(&self, message: impl Into<String>) -> GraphQLError {
        GraphQLError::invalid_document(self.schema.name(), message)
    }

    fn key(&self) -> Option<Vec<(String, FieldValue)>> {
        self.identifier
            .clone()
            .or_else(|| self.model.as_ref().map(|m| m.identifier().fields()))
    }

    fn stamp_version(&self, input: &mut JsonMap) {
        if let (true, Some(version)) = (self.conflict_resolution, self.version) {
            input.insert("_version".into(), Json::from(version));
        }
    }

    fn render(self, registry: &ModelRegistry) -> GraphQLResult<GraphQLDocument> {
        let schema = Arc::clone(&self.schema);
        let directive = self
            .directive
            .ok_or_else(|| self.invalid("no directive decorator applied"))?;
        if directive.operation_type() != self.operation_type {
            return Err(self.invalid(format!(
                "`{}` is not a {} directive",
                directive.prefix(),
                self.operation_type
            )));
        }
        if !directive.is_paginated()
            && (self.filter.is_some() || self.limit.is_some() || self.next_token.is_some())
        {
            return Err(self.invalid("filter and pagination apply to list and sync only"));
        }
        if self.condition.is_some() && self.operation_type != OperationType::Mutation {
            return Err(self.invalid("conditions apply to mutations only"));
        }

        let name = directive.document_name(&schema);
        let mut inputs: BTreeMap<String, DocumentInput> = BTreeMap::new();
        match directive {
            DocumentDirective::Create | DocumentDirective::Update => {
                let model = self
                    .model
                    .as_ref()
                    .ok_or_else(|| self.invalid("mutation without a model decorator"))?;
                let mut input = mutation_input(model);
                self.stamp_version(&mut input);
                inputs.insert(
                    "input".into(),
                    DocumentInput::new(
                        format!("{}Input!", capitalize(&name)),
                        Json::Object(input),
                    ),
                );
            }
            DocumentDirective::Delete => {
                let key = self
                    .key()
                    .ok_or_else(|| self.invalid("delete without a key"))?;
                let mut input: JsonMap = key
                    .iter()
                    .map(|(field, value)| (field.clone(), value.to_json()))
                    .collect();
                self.stamp_version(&mut input);
                inputs.insert(
                    "input".into(),
                    DocumentInput::new(
                        format!("{}Input!", capitalize(&name)),
                        Json::Object(input),
                    ),
                );
            }
            DocumentDirective::Get => {
                let key = self.key().ok_or_else(|| self.invalid("get without a key"))?;
                for (field, value) in key {
                    let declared = schema.require_field(&field)?;
                    inputs.insert(
                        field,
                        DocumentInput::new(
                            format!("{}!", declared.field_type.graphql_name()),
                            value.to_json(),
                        ),
                    );
                }
            }
            DocumentDirective::List | DocumentDirective::Sync => {
                if let Some(filter) = &self.filter {
                    inputs.insert(
                        "filter".into(),
                        DocumentInput::new(
                            format!("Model{}FilterInput", schema.name()),
                            filter.clone(),
                        ),
                    );
                }
                if let Some(limit) = self.limit {
                    inputs.insert("limit".into(), DocumentInput::new("Int", Json::from(limit)));
                }
                if let Some(token) = &self.next_token {
                    inputs.insert(
                        "nextToken".into(),
                        DocumentInput::new("String", Json::String(token.clone())),
                    );
                }
                if let (DocumentDirective::Sync, Some(last_sync)) = (directive, self.last_sync) {
                    inputs.insert(
                        "lastSync".into(),
                        DocumentInput::new("AWSTimestamp", Json::from(last_sync)),
                    );
                }
            }
            DocumentDirective::OnCreate
            | DocumentDirective::OnUpdate
            | DocumentDirective::OnDelete => {}
        }
        if let Some(condition) = &self.condition {
            inputs.insert(
                "condition".into(),
                DocumentInput::new(
                    format!("Model{}ConditionInput", schema.name()),
                    condition.clone(),
                ),
            );
        }

        let mut w = Writer::default();
        let (parameters, arguments) = if inputs.is_empty() {
            (String::new(), String::new())
        } else {
            let parameters = inputs
                .iter()
                .map(|(k, input)| format!("${k}: {}", input.graphql_type))
                .collect::<Vec<_>>()
                .join(", ");
            let arguments = inputs
                .keys()
                .map(|k| format!("{k}: ${k}"))
                .collect::<Vec<_>>()
                .join(", ");
            (format!("({parameters})"), format!("({arguments})"))
        };
        w.line(
            0,
            &format!(
                "{} {}{parameters} {{",
                self.operation_type.keyword(),
                capitalize(&name)
            ),
        );
        w.line(1, &format!("{name}{arguments} {{"));
        let selection_fields = if directive.is_paginated() {
            w.line(2, "items {");
            let fields = self.write_selection(registry, &mut w, 3)?;
            w.line(2, "}");
            w.line(2, "nextToken");
            if directive == DocumentDirective::Sync || self.conflict_resolution {
                w.line(2, "startedAt");
            }
            fields
        } else {
            self.write_selection(registry, &mut w, 2)?
        };
        w.line(1, "}");
        w.line(0, "}");

        let variables: JsonMap = inputs.into_iter().map(|(k, input)| (k, input.value)).collect();
        trace!(model = %schema.name(), document = %name, "built document");
        Ok(GraphQLDocument {
            operation_type: self.operation_type,
            name: name.clone(),
            string_value: w.out,
            variables,
            decode_path: name,
            selection_fields,
        })
    }

    fn write_selection(
        &self,
        registry: &ModelRegistry,
        w: &mut Writer,
        depth: usize,
    ) -> GraphQLResult<Vec<String>> {
        let mut names = Vec::new();
        for field in self.schema.sorted_fields() {
            match &field.association {
                None => {
                    w.line(depth, &field.name);
                    names.push(field.name.clone());
                }
                Some(Association::BelongsTo { .. }) => {
                    let parent_name = field.associated_model().ok_or_else(|| {
                        self.invalid(format!("`{}` names no associated model", field.name))
                    })?;
                    let parent = registry.schema(parent_name)?;
                    w.line(depth, &format!("{} {{", field.name));
                    self.write_nested(parent, w, depth + 1);
                    w.line(depth, "}");
                    names.push(field.name.clone());
                }
                Some(Association::HasOne { .. }) | Some(Association::HasMany { .. }) => {}
            }
        }
        w.line(depth, TYPENAME);
        names.push(TYPENAME.to_string());
        if self.conflict_resolution {
            for name in CONFLICT_RESOLUTION_FIELDS {
                w.line(depth, name);
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn write_nested(&self, parent: &ModelSchema, w: &mut Writer, depth: usize) {
        if self.primary_keys_only {
            for key in parent.primary_key() {
                w.line(depth, key);
            }
        } else {
            for field in parent.sorted_fields() {
                if field.association.is_none() {
                    w.line(depth, &field.name);
                }
            }
        }
        w.line(depth, TYPENAME);
        if self.conflict_resolution {
            for name in CONFLICT_RESOLUTION_FIELDS {
                w.line(depth, name);
            }
        }
    }
}

#[derive(Debug)]
struct DocumentInput {
    graphql_type: String,
    value: Json,
}

impl DocumentInput {
    fn new(graphql_type: impl Into<String>, value: Json) -> Self {
        Self {
            graphql_type: graphql_type.into(),
            value,
        }
    }
}

#[derive(Default)]
struct Writer {
    out: String,
}

impl Writer {
    fn line(&mut self, depth: usize, text: &str) {
        if !self.out.is_empty() {
            self.out.push('\n');
        }
        for _ in 0..depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Stored fields of `model` without the read-only ones, belongs-to fields
/// written as their foreign-key column.
pub fn mutation_input(model: &Model) -> JsonMap {
    let mut input = model.to_json_map();
    for field in model.schema().fields().iter().filter(|f| f.is_read_only) {
        input.remove(&field.name);
    }
    input
}

/// A built document.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQLDocument {
    /// Operation keyword.
    pub operation_type: OperationType,
    /// Root field name, for example `createPost`.
    pub name: String,
    /// Full document text.
    pub string_value: String,
    /// Variables, keyed and sorted by name.
    pub variables: JsonMap,
    /// Key of the result under `data` in the response.
    pub decode_path: String,
    /// Field names selected on the model (on `items` for list and sync).
    pub selection_fields: Vec<String>,
}

/// Builds a document from decorators.
///
/// ```rust
/// use datasync_graphql::{DocumentDecorator, DocumentDirective, ModelBasedDocumentBuilder, OperationType};
/// use datasync_model::{FieldType, ModelField, ModelRegistry, ModelSchema};
///
/// let post = ModelSchema::builder("Post")
///     .field(ModelField::id())
///     .field(ModelField::new("title", FieldType::String))
///     .build()
///     .unwrap();
/// let registry = ModelRegistry::builder().register(post.clone()).build().unwrap();
///
/// let document = ModelBasedDocumentBuilder::new(&registry, post, OperationType::Subscription)
///     .add(DocumentDecorator::Directive(DocumentDirective::OnCreate))
///     .build()
///     .unwrap();
/// assert_eq!(
///     document.string_value,
///     "subscription OnCreatePost {\n  onCreatePost {\n    id\n    title\n    __typename\n  }\n}"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct ModelBasedDocumentBuilder<'a> {
    registry: &'a ModelRegistry,
    schema: Arc<ModelSchema>,
    operation_type: OperationType,
    decorators: Vec<DocumentDecorator>,
}

impl<'a> ModelBasedDocumentBuilder<'a> {
    /// Starts a document for `schema`.
    pub fn new(
        registry: &'a ModelRegistry,
        schema: Arc<ModelSchema>,
        operation_type: OperationType,
    ) -> Self {
        Self {
            registry,
            schema,
            operation_type,
            decorators: Vec::new(),
        }
    }

    /// Appends a decorator.
    #[must_use]
    pub fn add(mut self, decorator: DocumentDecorator) -> Self {
        self.decorators.push(decorator);
        self
    }

    /// Folds the decorators into a spec without rendering it.
    ///
    /// # Errors
    ///
    /// Fails when a decorator rejects the spec.
    pub fn spec(&self) -> GraphQLResult<DocumentSpec> {
        self.decorators.iter().try_fold(
            DocumentSpec::new(Arc::clone(&self.schema), self.operation_type),
            |spec, decorator| decorator.apply(spec),
        )
    }

    /// Builds the document.
    ///
    /// # Errors
    ///
    /// [`GraphQLError::InvalidDocument`] when the decorators do not describe
    /// a complete document for the operation type.
    pub fn build(&self) -> GraphQLResult<GraphQLDocument> {
        self.spec()?.render(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use datasync_model::predicate::field;
    use datasync_model::{FieldType, ModelField};
    use serde_json::json;

    use super::*;

    fn registry() -> ModelRegistry {
        let post = ModelSchema::builder("Post")
            .field(ModelField::id())
            .field(ModelField::new("title", FieldType::String).required())
            .field(ModelField::new("content", FieldType::String).required())
            .field(ModelField::new("createdAt", FieldType::DateTime).read_only())
            .field(ModelField::new("updatedAt", FieldType::DateTime).read_only())
            .field(ModelField::new("draft", FieldType::Bool))
            .field(ModelField::new("rating", FieldType::Double))
            .field(ModelField::has_many("comments", "Comment", "post"))
            .build()
            .unwrap();
        let comment = ModelSchema::builder("Comment")
            .field(ModelField::id())
            .field(ModelField::new("content", FieldType::String).required())
            .field(ModelField::new("createdAt", FieldType::DateTime).read_only())
            .field(ModelField::belongs_to("post", "Post", "commentPostId").required())
            .build()
            .unwrap();
        ModelRegistry::builder()
            .register(post)
            .register(comment)
            .build()
            .unwrap()
    }

    fn schema(registry: &ModelRegistry, name: &str) -> Arc<ModelSchema> {
        registry.schema(name).unwrap().clone()
    }

    fn post(registry: &ModelRegistry) -> Model {
        Model::builder(&schema(registry, "Post"))
            .set("id", "p1")
            .set("title", "title")
            .set("content", "content")
            .build()
            .unwrap()
    }

    #[test]
    fn create_mutation_with_conflict_resolution() {
        let registry = registry();
        let document =
            ModelBasedDocumentBuilder::new(&registry, schema(&registry, "Post"), OperationType::Mutation)
                .add(DocumentDecorator::Directive(DocumentDirective::Create))
                .add(DocumentDecorator::Model(post(&registry)))
                .add(DocumentDecorator::conflict_resolution())
                .build()
                .unwrap();
        let expected = "\
mutation CreatePost($input: CreatePostInput!) {
  createPost(input: $input) {
    id
    content
    createdAt
    draft
    rating
    title
    updatedAt
    __typename
    _version
    _deleted
    _lastChangedAt
  }
}";
        assert_eq!(document.string_value, expected);
        assert_eq!(document.name, "createPost");
        assert_eq!(document.decode_path, "createPost");
        let input = document.variables["input"].as_object().unwrap();
        assert_eq!(input["id"], json!("p1"));
        assert!(!input.contains_key("createdAt"));
        assert!(!input.contains_key("_version"));
    }

    #[test]
    fn belongs_to_is_nested_and_sent_as_foreign_key() {
        let registry = registry();
        let comment = Model::builder(&schema(&registry, "Comment"))
            .set("id", "c1")
            .set("content", "hi")
            .set("post", post(&registry))
            .build()
            .unwrap();
        let document = ModelBasedDocumentBuilder::new(
            &registry,
            schema(&registry, "Comment"),
            OperationType::Mutation,
        )
        .add(DocumentDecorator::Directive(DocumentDirective::Update))
        .add(DocumentDecorator::Model(comment))
        .add(DocumentDecorator::conflict_resolution_with_version(Some(4)))
        .build()
        .unwrap();
        let expected = "\
mutation UpdateComment($input: UpdateCommentInput!) {
  updateComment(input: $input) {
    id
    content
    createdAt
    post {
      id
      content
      createdAt
      draft
      rating
      title
      updatedAt
      __typename
      _version
      _deleted
      _lastChangedAt
    }
    __typename
    _version
    _deleted
    _lastChangedAt
  }
}";
        assert_eq!(document.string_value, expected);
        assert_eq!(
            document.variables["input"],
            json!({"id": "c1", "content": "hi", "commentPostId": "p1", "_version": 4})
        );
    }

    #[test]
    fn primary_keys_only_truncates_nested_selection() {
        let registry = registry();
        let document = ModelBasedDocumentBuilder::new(
            &registry,
            schema(&registry, "Comment"),
            OperationType::Subscription,
        )
        .add(DocumentDecorator::Directive(DocumentDirective::OnUpdate))
        .add(DocumentDecorator::PrimaryKeysOnly)
        .build()
        .unwrap();
        assert!(document
            .string_value
            .contains("    post {\n      id\n      __typename\n    }\n"));
    }

    #[test]
    fn delete_sends_key_and_version_only() {
        let registry = registry();
        let document =
            ModelBasedDocumentBuilder::new(&registry, schema(&registry, "Post"), OperationType::Mutation)
                .add(DocumentDecorator::Directive(DocumentDirective::Delete))
                .add(DocumentDecorator::model_id(&post(&registry)))
                .add(DocumentDecorator::conflict_resolution_with_version(Some(2)))
                .add(DocumentDecorator::Condition(field("draft").eq(true)))
                .build()
                .unwrap();
        assert!(document.string_value.starts_with(
            "mutation DeletePost($condition: ModelPostConditionInput, $input: DeletePostInput!) {\n  deletePost(condition: $condition, input: $input) {"
        ));
        assert_eq!(document.variables["input"], json!({"id": "p1", "_version": 2}));
        assert_eq!(document.variables["condition"], json!({"draft": {"eq": true}}));
    }

    #[test]
    fn get_query() {
        let registry = registry();
        let document =
            ModelBasedDocumentBuilder::new(&registry, schema(&registry, "Post"), OperationType::Query)
                .add(DocumentDecorator::Directive(DocumentDirective::Get))
                .add(DocumentDecorator::id("p1"))
                .build()
                .unwrap();
        assert!(document
            .string_value
            .starts_with("query GetPost($id: ID!) {\n  getPost(id: $id) {\n    id\n"));
        assert_eq!(document.variables["id"], json!("p1"));
    }

    #[test]
    fn sync_query_with_cursor_and_filter() {
        let registry = registry();
        let document =
            ModelBasedDocumentBuilder::new(&registry, schema(&registry, "Post"), OperationType::Query)
                .add(DocumentDecorator::Directive(DocumentDirective::Sync))
                .add(DocumentDecorator::Pagination {
                    limit: Some(1000),
                    next_token: Some("token".into()),
                })
                .add(DocumentDecorator::ConflictResolution {
                    version: None,
                    last_sync: Some(123),
                })
                .add(DocumentDecorator::Filter(field("rating").gt(2.0)))
                .build()
                .unwrap();
        let expected = "\
query SyncPosts($filter: ModelPostFilterInput, $lastSync: AWSTimestamp, $limit: Int, $nextToken: String) {
  syncPosts(filter: $filter, lastSync: $lastSync, limit: $limit, nextToken: $nextToken) {
    items {
      id
      content
      createdAt
      draft
      rating
      title
      updatedAt
      __typename
      _version
      _deleted
      _lastChangedAt
    }
    nextToken
    startedAt
  }
}";
        assert_eq!(document.string_value, expected);
        assert_eq!(document.variables["lastSync"], json!(123));
        assert_eq!(document.variables["limit"], json!(1000));
        assert_eq!(document.variables["filter"], json!({"rating": {"gt": 2.0}}));
    }

    #[test]
    fn list_query_without_sync_fields() {
        let registry = registry();
        let document =
            ModelBasedDocumentBuilder::new(&registry, schema(&registry, "Post"), OperationType::Query)
                .add(DocumentDecorator::Directive(DocumentDirective::List))
                .add(DocumentDecorator::Pagination {
                    limit: Some(10),
                    next_token: None,
                })
                .build()
                .unwrap();
        assert!(document
            .string_value
            .starts_with("query ListPosts($limit: Int) {\n  listPosts(limit: $limit) {\n    items {\n"));
        assert!(document.string_value.ends_with("    }\n    nextToken\n  }\n}"));
    }

    #[test]
    fn decorator_order_does_not_matter() {
        let registry = registry();
        let decorators = vec![
            DocumentDecorator::Directive(DocumentDirective::Update),
            DocumentDecorator::Model(post(&registry)),
            DocumentDecorator::conflict_resolution_with_version(Some(7)),
            DocumentDecorator::Condition(field("draft").eq(false)),
        ];
        let build = |order: &[usize]| {
            order
                .iter()
                .fold(
                    ModelBasedDocumentBuilder::new(
                        &registry,
                        schema(&registry, "Post"),
                        OperationType::Mutation,
                    ),
                    |b, i| b.add(decorators[*i].clone()),
                )
                .build()
                .unwrap()
        };
        let reference = build(&[0, 1, 2, 3]);
        for order in [[3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]] {
            assert_eq!(build(&order), reference);
        }
    }

    #[test]
    fn invalid_documents_are_rejected() {
        let registry = registry();
        let post_schema = schema(&registry, "Post");
        let missing = ModelBasedDocumentBuilder::new(&registry, post_schema.clone(), OperationType::Query)
            .build();
        assert!(matches!(missing, Err(GraphQLError::InvalidDocument { .. })));

        let wrong_kind =
            ModelBasedDocumentBuilder::new(&registry, post_schema.clone(), OperationType::Query)
                .add(DocumentDecorator::Directive(DocumentDirective::Create))
                .build();
        assert!(matches!(wrong_kind, Err(GraphQLError::InvalidDocument { .. })));

        let no_model = ModelBasedDocumentBuilder::new(&registry, post_schema, OperationType::Mutation)
            .add(DocumentDecorator::Directive(DocumentDirective::Create))
            .build();
        assert!(matches!(no_model, Err(GraphQLError::InvalidDocument { .. })));
    }
}
