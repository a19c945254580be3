//! Ready-to-send requests for the sync engine.
//!
//! Every constructor here enables conflict resolution, so responses carry
//! `_version`, `_deleted` and `_lastChangedAt`.

use std::sync::Arc;

use datasync_model::{
    FieldValue, JsonMap, Model, ModelRegistry, ModelSchema, MutationEvent, MutationType,
    QueryPredicate,
};
use serde::Serialize;
use serde_json::Value as Json;

use crate::document::{
    DocumentDecorator, DocumentDirective, GraphQLDocument, ModelBasedDocumentBuilder,
    OperationType,
};
use crate::error::{GraphQLError, GraphQLResult};

/// A GraphQL request as handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQLRequest {
    /// Document text.
    #[serde(rename = "query")]
    pub document: String,
    /// Variables.
    pub variables: JsonMap,
    /// Key of the result under `data`.
    #[serde(skip)]
    pub decode_path: String,
    /// Model the request concerns.
    #[serde(skip)]
    pub model_name: String,
    /// Operation keyword.
    #[serde(skip)]
    pub operation_type: OperationType,
}

impl GraphQLRequest {
    /// Wraps a built document.
    pub fn from_document(model_name: impl Into<String>, document: GraphQLDocument) -> Self {
        Self {
            document: document.string_value,
            variables: document.variables,
            decode_path: document.decode_path,
            model_name: model_name.into(),
            operation_type: document.operation_type,
        }
    }

    /// `create<Model>` mutation.
    ///
    /// # Errors
    ///
    /// Fails when the model is not registered.
    pub fn create_mutation(
        registry: &ModelRegistry,
        model: &Model,
        condition: Option<&QueryPredicate>,
        version: Option<i64>,
    ) -> GraphQLResult<Self> {
        Self::mutation(registry, model, MutationType::Create, condition, version)
    }

    /// `update<Model>` mutation.
    ///
    /// # Errors
    ///
    /// Fails when the model is not registered.
    pub fn update_mutation(
        registry: &ModelRegistry,
        model: &Model,
        condition: Option<&QueryPredicate>,
        version: Option<i64>,
    ) -> GraphQLResult<Self> {
        Self::mutation(registry, model, MutationType::Update, condition, version)
    }

    /// `delete<Model>` mutation.
    ///
    /// # Errors
    ///
    /// Fails when the model is not registered.
    pub fn delete_mutation(
        registry: &ModelRegistry,
        model: &Model,
        condition: Option<&QueryPredicate>,
        version: Option<i64>,
    ) -> GraphQLResult<Self> {
        Self::mutation(registry, model, MutationType::Delete, condition, version)
    }

    fn mutation(
        registry: &ModelRegistry,
        model: &Model,
        mutation_type: MutationType,
        condition: Option<&QueryPredicate>,
        version: Option<i64>,
    ) -> GraphQLResult<Self> {
        let schema = registry.schema(model.model_name())?.clone();
        let mut builder = mutation_builder(registry, schema, model, mutation_type, version);
        if let Some(condition) = condition {
            builder = builder.add(DocumentDecorator::Condition(condition.clone()));
        }
        Ok(Self::from_document(model.model_name(), builder.build()?))
    }

    /// Mutation for a queued local write.
    ///
    /// Uses the version stamped on the event and the condition it stores in
    /// its encoded form.
    ///
    /// # Errors
    ///
    /// Fails when the event does not decode against the registry.
    pub fn from_mutation_event(
        registry: &ModelRegistry,
        event: &MutationEvent,
    ) -> GraphQLResult<Self> {
        let model = event.decode_model(registry)?;
        let schema = model.schema().clone();
        let mut builder =
            mutation_builder(registry, schema, &model, event.mutation_type, event.version);
        if let Some(filter) = &event.graphql_filter {
            let condition: Json = serde_json::from_str(filter)?;
            builder = builder.add(DocumentDecorator::EncodedCondition(condition));
        }
        Ok(Self::from_document(&event.model_name, builder.build()?))
    }

    /// `get<Model>` query.
    ///
    /// # Errors
    ///
    /// Fails when `key` names fields outside the primary key.
    pub fn get_query(
        registry: &ModelRegistry,
        schema: &Arc<ModelSchema>,
        key: Vec<(String, FieldValue)>,
    ) -> GraphQLResult<Self> {
        let document = ModelBasedDocumentBuilder::new(registry, schema.clone(), OperationType::Query)
            .add(DocumentDecorator::Directive(DocumentDirective::Get))
            .add(DocumentDecorator::ModelId(key))
            .add(DocumentDecorator::conflict_resolution())
            .build()?;
        Ok(Self::from_document(schema.name(), document))
    }

    /// `list<Models>` query.
    ///
    /// # Errors
    ///
    /// Fails when the predicate cannot be encoded for the schema.
    pub fn list_query(
        registry: &ModelRegistry,
        schema: &Arc<ModelSchema>,
        filter: Option<&QueryPredicate>,
        limit: Option<u64>,
        next_token: Option<String>,
    ) -> GraphQLResult<Self> {
        let mut builder =
            ModelBasedDocumentBuilder::new(registry, schema.clone(), OperationType::Query)
                .add(DocumentDecorator::Directive(DocumentDirective::List))
                .add(DocumentDecorator::Pagination { limit, next_token })
                .add(DocumentDecorator::conflict_resolution());
        if let Some(filter) = filter {
            builder = builder.add(DocumentDecorator::Filter(filter.clone()));
        }
        Ok(Self::from_document(schema.name(), builder.build()?))
    }

    /// `sync<Models>` query for one page of initial sync.
    ///
    /// # Errors
    ///
    /// Fails when the predicate cannot be encoded for the schema.
    pub fn sync_query(
        registry: &ModelRegistry,
        schema: &Arc<ModelSchema>,
        filter: Option<&QueryPredicate>,
        limit: u64,
        next_token: Option<String>,
        last_sync: Option<i64>,
    ) -> GraphQLResult<Self> {
        let mut builder =
            ModelBasedDocumentBuilder::new(registry, schema.clone(), OperationType::Query)
                .add(DocumentDecorator::Directive(DocumentDirective::Sync))
                .add(DocumentDecorator::Pagination {
                    limit: Some(limit),
                    next_token,
                })
                .add(DocumentDecorator::ConflictResolution {
                    version: None,
                    last_sync,
                });
        if let Some(filter) = filter {
            builder = builder.add(DocumentDecorator::Filter(filter.clone()));
        }
        Ok(Self::from_document(schema.name(), builder.build()?))
    }

    /// `on<Kind><Model>` subscription.
    ///
    /// # Errors
    ///
    /// Fails when an association target is not registered.
    pub fn subscription(
        registry: &ModelRegistry,
        schema: &Arc<ModelSchema>,
        mutation_type: MutationType,
    ) -> GraphQLResult<Self> {
        let document =
            ModelBasedDocumentBuilder::new(registry, schema.clone(), OperationType::Subscription)
                .add(DocumentDecorator::Directive(DocumentDirective::subscription(
                    mutation_type,
                )))
                .add(DocumentDecorator::conflict_resolution())
                .build()?;
        Ok(Self::from_document(schema.name(), document))
    }

    /// The mutation kind, for mutation requests.
    pub fn mutation_type(&self) -> Option<MutationType> {
        if self.operation_type != OperationType::Mutation {
            return None;
        }
        [MutationType::Create, MutationType::Update, MutationType::Delete]
            .into_iter()
            .find(|t| self.decode_path.starts_with(t.as_str()))
    }

    /// The `input` variable, for mutation requests.
    pub fn input(&self) -> GraphQLResult<&JsonMap> {
        self.variables
            .get("input")
            .and_then(Json::as_object)
            .ok_or_else(|| GraphQLError::decoding("request has no `input` object"))
    }
}

fn mutation_builder<'a>(
    registry: &'a ModelRegistry,
    schema: Arc<ModelSchema>,
    model: &Model,
    mutation_type: MutationType,
    version: Option<i64>,
) -> ModelBasedDocumentBuilder<'a> {
    let builder = ModelBasedDocumentBuilder::new(registry, schema, OperationType::Mutation)
        .add(DocumentDecorator::Directive(DocumentDirective::mutation(
            mutation_type,
        )))
        .add(DocumentDecorator::conflict_resolution_with_version(version));
    match mutation_type {
        MutationType::Delete => builder.add(DocumentDecorator::model_id(model)),
        MutationType::Create | MutationType::Update => {
            builder.add(DocumentDecorator::Model(model.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use datasync_model::predicate::field;
    use datasync_model::{FieldType, ModelField};
    use serde_json::json;

    use super::*;
    use crate::filter::graphql_filter_string;

    fn setup() -> (ModelRegistry, Arc<ModelSchema>) {
        let post = ModelSchema::builder("Post")
            .field(ModelField::id())
            .field(ModelField::new("title", FieldType::String).required())
            .field(ModelField::new("content", FieldType::String))
            .build()
            .unwrap();
        let registry = ModelRegistry::builder().register(post.clone()).build().unwrap();
        (registry, post)
    }

    fn post(schema: &Arc<ModelSchema>) -> Model {
        Model::builder(schema)
            .set("id", "p1")
            .set("title", "t")
            .set("content", "c")
            .build()
            .unwrap()
    }

    #[test]
    fn create_mutation_carries_version_and_sync_fields() {
        let (registry, schema) = setup();
        let request =
            GraphQLRequest::create_mutation(&registry, &post(&schema), None, Some(3)).unwrap();
        assert!(request.document.contains("    _version\n    _deleted\n    _lastChangedAt\n"));
        assert_eq!(request.input().unwrap()["_version"], json!(3));
        assert_eq!(request.mutation_type(), Some(MutationType::Create));
        assert_eq!(request.decode_path, "createPost");
    }

    #[test]
    fn event_mutation_replays_condition() {
        let (registry, schema) = setup();
        let model = post(&schema);
        let condition = graphql_filter_string(&schema, &field("title").eq("t"));
        let event = MutationEvent::new(&model, MutationType::Update)
            .with_version(Some(2))
            .with_graphql_filter(Some(condition));
        let request = GraphQLRequest::from_mutation_event(&registry, &event).unwrap();
        assert_eq!(request.variables["condition"], json!({"title": {"eq": "t"}}));
        assert_eq!(request.input().unwrap()["_version"], json!(2));
        assert_eq!(request.mutation_type(), Some(MutationType::Update));
    }

    #[test]
    fn delete_event_sends_only_the_key() {
        let (registry, schema) = setup();
        let event = MutationEvent::new(&post(&schema), MutationType::Delete).with_version(Some(1));
        let request = GraphQLRequest::from_mutation_event(&registry, &event).unwrap();
        assert_eq!(request.variables["input"], json!({"id": "p1", "_version": 1}));
    }

    #[test]
    fn serializes_as_a_graphql_payload() {
        let (registry, schema) = setup();
        let request = GraphQLRequest::subscription(&registry, &schema, MutationType::Delete).unwrap();
        let payload = serde_json::to_value(&request).unwrap();
        assert!(payload["query"].as_str().unwrap().starts_with("subscription OnDeletePost {"));
        assert_eq!(payload["variables"], json!({}));
        assert_eq!(request.mutation_type(), None);
    }

    #[test]
    fn sync_query_pages() {
        let (registry, schema) = setup();
        let request =
            GraphQLRequest::sync_query(&registry, &schema, None, 1000, None, None).unwrap();
        assert_eq!(request.variables, json!({"limit": 1000}).as_object().unwrap().clone());
        assert!(request.document.starts_with("query SyncPosts($limit: Int) {"));
    }
}
