//! Predicate to GraphQL filter encoding.
//!
//! Produces the `Model<Name>FilterInput` / `Model<Name>ConditionInput`
//! shape: leaves are `{field: {operator: value}}`, groups are
//! `{"and": [...]}`, `{"or": [...]}` and `{"not": {...}}`.

use datasync_model::{
    FieldValue, JsonMap, ModelSchema, QueryOperator, QueryPredicate, QueryPredicateGroup,
    QueryPredicateGroupType, QueryPredicateOperation,
};
use serde_json::Value as Json;

/// Encodes a predicate as a GraphQL filter object.
///
/// Belongs-to fields are addressed by their foreign-key column, so a
/// predicate on `post` filters on `postId`. [`QueryPredicate::All`]
/// encodes as an empty object.
pub fn graphql_filter(schema: &ModelSchema, predicate: &QueryPredicate) -> Json {
    match predicate {
        QueryPredicate::All => Json::Object(JsonMap::new()),
        QueryPredicate::Operation(op) => operation(schema, op),
        QueryPredicate::Group(group) => self::group(schema, group),
    }
}

/// Encodes a predicate as a compact JSON string, the form stored on
/// mutation events.
pub fn graphql_filter_string(schema: &ModelSchema, predicate: &QueryPredicate) -> String {
    graphql_filter(schema, predicate).to_string()
}

fn column<'a>(schema: &'a ModelSchema, field: &'a str) -> &'a str {
    schema
        .field(field)
        .and_then(|f| f.foreign_key())
        .unwrap_or(field)
}

fn literal(value: &FieldValue) -> Json {
    match value {
        FieldValue::Model(parent) => Json::String(parent.identifier_string()),
        other => other.to_json(),
    }
}

fn operation(schema: &ModelSchema, op: &QueryPredicateOperation) -> Json {
    let value = match &op.operator {
        QueryOperator::Eq(v)
        | QueryOperator::Ne(v)
        | QueryOperator::Le(v)
        | QueryOperator::Lt(v)
        | QueryOperator::Ge(v)
        | QueryOperator::Gt(v)
        | QueryOperator::Contains(v)
        | QueryOperator::NotContains(v) => literal(v),
        QueryOperator::BeginsWith(prefix) => Json::String(prefix.clone()),
        QueryOperator::Between(start, end) => Json::Array(vec![literal(start), literal(end)]),
    };
    let mut comparison = JsonMap::new();
    comparison.insert(op.operator.graphql_name().to_string(), value);
    let mut leaf = JsonMap::new();
    leaf.insert(column(schema, &op.field).to_string(), Json::Object(comparison));
    Json::Object(leaf)
}

fn group(schema: &ModelSchema, group: &QueryPredicateGroup) -> Json {
    let children: Vec<Json> = group
        .predicates
        .iter()
        .map(|p| graphql_filter(schema, p))
        .collect();
    let body = match group.group_type {
        QueryPredicateGroupType::And | QueryPredicateGroupType::Or => Json::Array(children),
        QueryPredicateGroupType::Not => match <[Json; 1]>::try_from(children) {
            Ok([only]) => only,
            Err(children) => {
                let mut and = JsonMap::new();
                and.insert("and".into(), Json::Array(children));
                Json::Object(and)
            }
        },
    };
    let mut object = JsonMap::new();
    object.insert(group.group_type.graphql_name().to_string(), body);
    Json::Object(object)
}
