//! Document shapes expected by an AppSync backend.

use std::sync::Arc;

use datasync_graphql::{
    DocumentDecorator, DocumentDirective, GraphQLRequest, ModelBasedDocumentBuilder,
    OperationType, CONFLICT_RESOLUTION_FIELDS,
};
use datasync_model::{FieldType, FieldValue, Model, ModelField, ModelRegistry, ModelSchema};
use proptest::prelude::*;
use serde_json::json;

fn blog_registry() -> (ModelRegistry, Arc<ModelSchema>) {
    let post = ModelSchema::builder("Post")
        .field(ModelField::id())
        .field(ModelField::new("title", FieldType::String).required())
        .field(ModelField::new("content", FieldType::String).required())
        .build()
        .unwrap();
    let registry = ModelRegistry::builder().register(post.clone()).build().unwrap();
    (registry, post)
}

fn order_registry() -> (ModelRegistry, Arc<ModelSchema>) {
    let order = ModelSchema::builder("CustomerOrder")
        .field(ModelField::new("orderId", FieldType::String).primary_key())
        .field(ModelField::new("email", FieldType::String).primary_key())
        .field(ModelField::new("total", FieldType::Int))
        .build()
        .unwrap();
    let registry = ModelRegistry::builder().register(order.clone()).build().unwrap();
    (registry, order)
}

#[test]
fn subscription_documents_for_every_kind() {
    let (registry, post) = blog_registry();
    for (directive, root) in [
        (DocumentDirective::OnCreate, "onCreatePost"),
        (DocumentDirective::OnUpdate, "onUpdatePost"),
        (DocumentDirective::OnDelete, "onDeletePost"),
    ] {
        let document = ModelBasedDocumentBuilder::new(&registry, post.clone(), OperationType::Subscription)
            .add(DocumentDecorator::Directive(directive))
            .add(DocumentDecorator::conflict_resolution())
            .build()
            .unwrap();
        let expected = format!(
            "subscription {}{} {{\n  {root} {{\n    id\n    content\n    title\n    __typename\n    _version\n    _deleted\n    _lastChangedAt\n  }}\n}}",
            root[..1].to_uppercase(),
            &root[1..],
        );
        assert_eq!(document.string_value, expected);
        assert!(document.variables.is_empty());
    }
}

#[test]
fn composite_key_get_uses_one_argument_per_key_field() {
    let (registry, order) = order_registry();
    let document = GraphQLRequest::get_query(
        &registry,
        &order,
        vec![
            ("orderId".into(), FieldValue::from("o1")),
            ("email".into(), FieldValue::from("a@b.c")),
        ],
    )
    .unwrap();
    assert!(document.document.starts_with(
        "query GetCustomerOrder($email: String!, $orderId: String!) {\n  getCustomerOrder(email: $email, orderId: $orderId) {\n    orderId\n    email\n    total\n    __typename\n"
    ));
    assert_eq!(document.variables["orderId"], json!("o1"));
    assert_eq!(document.variables["email"], json!("a@b.c"));
}

#[test]
fn composite_key_delete_input() {
    let (registry, order) = order_registry();
    let model = Model::builder(&order)
        .set("orderId", "o1")
        .set("email", "a@b.c")
        .set("total", 3)
        .build()
        .unwrap();
    assert_eq!(model.identifier_string(), "o1#a@b.c");
    let request = GraphQLRequest::delete_mutation(&registry, &model, None, Some(5)).unwrap();
    assert_eq!(
        request.variables["input"],
        json!({"orderId": "o1", "email": "a@b.c", "_version": 5})
    );
}

proptest! {
    #[test]
    fn create_mutation_sends_the_known_version(
        version in 1i64..1_000_000,
        title in "[a-z ]{0,12}",
        content in "[a-z ]{0,12}",
    ) {
        let (registry, post) = blog_registry();
        let model = Model::builder(&post)
            .set("title", title.as_str())
            .set("content", content.as_str())
            .build()
            .unwrap();
        let document = ModelBasedDocumentBuilder::new(&registry, post, OperationType::Mutation)
            .add(DocumentDecorator::Directive(DocumentDirective::Create))
            .add(DocumentDecorator::Model(model.clone()))
            .add(DocumentDecorator::conflict_resolution_with_version(Some(version)))
            .build()
            .unwrap();

        for field in CONFLICT_RESOLUTION_FIELDS {
            prop_assert!(document.selection_fields.iter().any(|f| f == field));
        }
        let input = document.variables["input"].as_object().unwrap();
        prop_assert_eq!(&input["_version"], &json!(version));
        prop_assert_eq!(&input["title"], &json!(title));
        prop_assert_eq!(&input["content"], &json!(content));
        prop_assert_eq!(&input["id"], &json!(model.identifier_string()));
    }
}
