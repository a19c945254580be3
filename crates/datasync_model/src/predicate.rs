//! Query predicates.
//!
//! A predicate is a recursive tree of field comparisons
//! ([`QueryPredicateOperation`]) combined with `and`/`or`/`not` groups
//! ([`QueryPredicateGroup`]). The same tree is compiled into storage queries,
//! serialized into GraphQL filter objects, and evaluated in memory against
//! a [`Model`].
//!
//! ```
//! use datasync_model::predicate::field;
//!
//! let p = field("rating").gt(3) & (field("title").begins_with("Rust") | !field("draft").eq(true));
//! assert!(!p.is_all());
//! ```

use std::cmp::Ordering;
use std::ops::{BitAnd, BitOr, Not};

use crate::model::Model;
use crate::value::FieldValue;

/// A comparison applied to a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperator {
    /// Equal to.
    Eq(FieldValue),
    /// Not equal to.
    Ne(FieldValue),
    /// Less than or equal to.
    Le(FieldValue),
    /// Less than.
    Lt(FieldValue),
    /// Greater than or equal to.
    Ge(FieldValue),
    /// Greater than.
    Gt(FieldValue),
    /// String contains substring, or list contains element.
    Contains(FieldValue),
    /// Negation of `Contains`.
    NotContains(FieldValue),
    /// String starts with prefix.
    BeginsWith(String),
    /// Inclusive range.
    Between(FieldValue, FieldValue),
}

impl QueryOperator {
    /// Name of the operator in GraphQL filter objects.
    pub fn graphql_name(&self) -> &'static str {
        match self {
            QueryOperator::Eq(_) => "eq",
            QueryOperator::Ne(_) => "ne",
            QueryOperator::Le(_) => "le",
            QueryOperator::Lt(_) => "lt",
            QueryOperator::Ge(_) => "ge",
            QueryOperator::Gt(_) => "gt",
            QueryOperator::Contains(_) => "contains",
            QueryOperator::NotContains(_) => "notContains",
            QueryOperator::BeginsWith(_) => "beginsWith",
            QueryOperator::Between(_, _) => "between",
        }
    }

    /// Applies the operator to a stored value.
    ///
    /// Ordering comparisons against `Null` or values of an incomparable kind
    /// are false. `Ne` is true when exactly one side is `Null`.
    pub fn evaluate(&self, value: &FieldValue) -> bool {
        match self {
            QueryOperator::Eq(target) => value.loosely_equals(target),
            QueryOperator::Ne(target) => !value.loosely_equals(target),
            QueryOperator::Le(target) => {
                matches!(value.compare(target), Some(Ordering::Less | Ordering::Equal))
            }
            QueryOperator::Lt(target) => value.compare(target) == Some(Ordering::Less),
            QueryOperator::Ge(target) => {
                matches!(value.compare(target), Some(Ordering::Greater | Ordering::Equal))
            }
            QueryOperator::Gt(target) => value.compare(target) == Some(Ordering::Greater),
            QueryOperator::Contains(target) => contains(value, target),
            QueryOperator::NotContains(target) => !contains(value, target),
            QueryOperator::BeginsWith(prefix) => value
                .as_str()
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            QueryOperator::Between(start, end) => {
                matches!(value.compare(start), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(value.compare(end), Some(Ordering::Less | Ordering::Equal))
            }
        }
    }
}

fn contains(value: &FieldValue, target: &FieldValue) -> bool {
    match value {
        FieldValue::List(items) => items.iter().any(|item| item.loosely_equals(target)),
        other => match (other.as_str(), target.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
    }
}

/// A single `field operator value` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPredicateOperation {
    /// Field name. May also name the foreign-key column of a belongs-to
    /// field (`postId`).
    pub field: String,
    /// Comparison.
    pub operator: QueryOperator,
}

impl QueryPredicateOperation {
    /// Evaluates against a model. Unknown fields read as `Null`.
    pub fn evaluate(&self, model: &Model) -> bool {
        let value = field_value(model, &self.field).unwrap_or(FieldValue::Null);
        self.operator.evaluate(&value)
    }
}

/// How a group combines its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPredicateGroupType {
    /// All children hold.
    And,
    /// At least one child holds.
    Or,
    /// Not all children hold (negated conjunction).
    Not,
}

impl QueryPredicateGroupType {
    /// Key used in GraphQL filter objects.
    pub fn graphql_name(self) -> &'static str {
        match self {
            QueryPredicateGroupType::And => "and",
            QueryPredicateGroupType::Or => "or",
            QueryPredicateGroupType::Not => "not",
        }
    }
}

/// A boolean combination of predicates.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPredicateGroup {
    /// Combinator.
    pub group_type: QueryPredicateGroupType,
    /// Children, evaluated left to right.
    pub predicates: Vec<QueryPredicate>,
}

impl QueryPredicateGroup {
    /// Evaluates with short-circuiting: `and` stops at the first false
    /// child, `or` at the first true one.
    pub fn evaluate(&self, model: &Model) -> bool {
        match self.group_type {
            QueryPredicateGroupType::And => self.predicates.iter().all(|p| p.evaluate(model)),
            QueryPredicateGroupType::Or => self.predicates.iter().any(|p| p.evaluate(model)),
            QueryPredicateGroupType::Not => !self.predicates.iter().all(|p| p.evaluate(model)),
        }
    }
}

/// A predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPredicate {
    /// Matches every row.
    All,
    /// Leaf comparison.
    Operation(QueryPredicateOperation),
    /// Combination of children.
    Group(QueryPredicateGroup),
}

impl QueryPredicate {
    /// Conjunction of `predicates`.
    pub fn and(predicates: Vec<QueryPredicate>) -> Self {
        Self::group(QueryPredicateGroupType::And, predicates)
    }

    /// Disjunction of `predicates`.
    pub fn or(predicates: Vec<QueryPredicate>) -> Self {
        Self::group(QueryPredicateGroupType::Or, predicates)
    }

    /// Negation of `predicate`.
    pub fn not(predicate: QueryPredicate) -> Self {
        Self::group(QueryPredicateGroupType::Not, vec![predicate])
    }

    fn group(group_type: QueryPredicateGroupType, predicates: Vec<QueryPredicate>) -> Self {
        QueryPredicate::Group(QueryPredicateGroup {
            group_type,
            predicates,
        })
    }

    /// True for [`QueryPredicate::All`].
    pub fn is_all(&self) -> bool {
        matches!(self, QueryPredicate::All)
    }

    /// Evaluates the predicate against a model.
    pub fn evaluate(&self, model: &Model) -> bool {
        match self {
            QueryPredicate::All => true,
            QueryPredicate::Operation(op) => op.evaluate(model),
            QueryPredicate::Group(group) => group.evaluate(model),
        }
    }

    /// Field names referenced anywhere in the tree.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            QueryPredicate::All => {}
            QueryPredicate::Operation(op) => out.push(&op.field),
            QueryPredicate::Group(group) => {
                for p in &group.predicates {
                    p.collect_fields(out);
                }
            }
        }
    }
}

impl BitAnd for QueryPredicate {
    type Output = QueryPredicate;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (QueryPredicate::All, other) | (other, QueryPredicate::All) => other,
            (
                QueryPredicate::Group(QueryPredicateGroup {
                    group_type: QueryPredicateGroupType::And,
                    mut predicates,
                }),
                rhs,
            ) => {
                predicates.push(rhs);
                QueryPredicate::and(predicates)
            }
            (lhs, rhs) => QueryPredicate::and(vec![lhs, rhs]),
        }
    }
}

impl BitOr for QueryPredicate {
    type Output = QueryPredicate;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (
                QueryPredicate::Group(QueryPredicateGroup {
                    group_type: QueryPredicateGroupType::Or,
                    mut predicates,
                }),
                rhs,
            ) => {
                predicates.push(rhs);
                QueryPredicate::or(predicates)
            }
            (lhs, rhs) => QueryPredicate::or(vec![lhs, rhs]),
        }
    }
}

impl Not for QueryPredicate {
    type Output = QueryPredicate;

    fn not(self) -> Self::Output {
        QueryPredicate::not(self)
    }
}

impl From<QueryPredicateOperation> for QueryPredicate {
    fn from(op: QueryPredicateOperation) -> Self {
        QueryPredicate::Operation(op)
    }
}

/// Resolves a field by name for predicate evaluation.
///
/// Belongs-to fields resolve to the parent identifier, both under the field
/// name and under the foreign-key column name. Returns `None` for names the
/// schema does not declare.
pub fn field_value(model: &Model, name: &str) -> Option<FieldValue> {
    let schema = model.schema();
    if let Some(field) = schema.field(name) {
        if field.foreign_key().is_some() {
            return Some(model.foreign_key(name).map_or(FieldValue::Null, FieldValue::String));
        }
        return Some(model.get(name).clone());
    }
    schema
        .belongs_to_fields()
        .find(|f| f.foreign_key() == Some(name))
        .map(|f| model.foreign_key(&f.name).map_or(FieldValue::Null, FieldValue::String))
}

/// Entry point for building a comparison on `name`.
pub fn field(name: impl Into<String>) -> QueryField {
    QueryField { name: name.into() }
}

/// A field reference awaiting an operator.
#[derive(Debug, Clone)]
pub struct QueryField {
    name: String,
}

impl QueryField {
    fn op(self, operator: QueryOperator) -> QueryPredicate {
        QueryPredicate::Operation(QueryPredicateOperation {
            field: self.name,
            operator,
        })
    }

    /// `field == value`
    pub fn eq(self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Eq(value.into()))
    }

    /// `field != value`
    pub fn ne(self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Ne(value.into()))
    }

    /// `field <= value`
    pub fn le(self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Le(value.into()))
    }

    /// `field < value`
    pub fn lt(self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Lt(value.into()))
    }

    /// `field >= value`
    pub fn ge(self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Ge(value.into()))
    }

    /// `field > value`
    pub fn gt(self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Gt(value.into()))
    }

    /// Substring or list-element match.
    pub fn contains(self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Contains(value.into()))
    }

    /// Negated substring or list-element match.
    pub fn not_contains(self, value: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::NotContains(value.into()))
    }

    /// Prefix match.
    pub fn begins_with(self, prefix: impl Into<String>) -> QueryPredicate {
        self.op(QueryOperator::BeginsWith(prefix.into()))
    }

    /// Inclusive range.
    pub fn between(self, start: impl Into<FieldValue>, end: impl Into<FieldValue>) -> QueryPredicate {
        self.op(QueryOperator::Between(start.into(), end.into()))
    }
}
