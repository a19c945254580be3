//! Predicate compiler and query plans.
//!
//! [`CompiledPredicate::compile`] walks a [`QueryPredicate`] tree once,
//! resolving every field against the schema and rejecting operators that
//! cannot apply to the field's type. The result is evaluated row by row by
//! the store without further name lookups or validation.

use std::cmp::Ordering;

use datasync_model::{
    FieldType, FieldValue, Model, ModelField, ModelRegistry, ModelSchema, QueryOperator,
    QueryPaginationInput, QueryPredicate, QueryPredicateGroupType, QuerySortDescriptor,
    SortOrder,
};

use crate::error::{StorageError, StorageResult};

/// A resolved column reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    /// A scalar field, read as is.
    Field(String),
    /// A belongs-to field, read as the parent identifier.
    ForeignKey(String),
}

impl Column {
    fn resolve(schema: &ModelSchema, name: &str) -> StorageResult<(Column, FieldType)> {
        if let Some(field) = schema.field(name) {
            return column_for(schema, field);
        }
        // Foreign-key column names (`postId`) address the belongs-to field.
        if let Some(field) = schema.belongs_to_fields().find(|f| f.foreign_key() == Some(name)) {
            return column_for(schema, field);
        }
        Err(datasync_model::ModelError::unknown_field(schema.name(), name).into())
    }

    /// Reads the column from a row.
    pub fn read(&self, model: &Model) -> FieldValue {
        match self {
            Column::Field(name) => model.get(name).clone(),
            Column::ForeignKey(name) => model
                .foreign_key(name)
                .map_or(FieldValue::Null, FieldValue::String),
        }
    }
}

fn column_for(schema: &ModelSchema, field: &ModelField) -> StorageResult<(Column, FieldType)> {
    match &field.field_type {
        FieldType::Collection(_) => Err(StorageError::invalid_predicate(
            schema.name(),
            format!("cannot filter on to-many field `{}`", field.name),
        )),
        FieldType::Model(_) if field.foreign_key().is_some() => {
            Ok((Column::ForeignKey(field.name.clone()), FieldType::Id))
        }
        FieldType::Model(_) => Err(StorageError::invalid_predicate(
            schema.name(),
            format!("cannot filter on has-one field `{}`", field.name),
        )),
        other => Ok((Column::Field(field.name.clone()), other.clone())),
    }
}

/// A predicate resolved against one schema.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledPredicate {
    /// Always true.
    True,
    /// Column comparison.
    Compare {
        /// Column to read.
        column: Column,
        /// Comparison to apply.
        operator: QueryOperator,
    },
    /// All children hold (stops at the first false).
    And(Vec<CompiledPredicate>),
    /// Some child holds (stops at the first true).
    Or(Vec<CompiledPredicate>),
    /// Negation.
    Not(Box<CompiledPredicate>),
}

impl CompiledPredicate {
    /// Compiles `predicate` against `schema`.
    ///
    /// A `not` group negates the conjunction of its children. Nested groups
    /// of the same kind are flattened and single-child groups collapse into
    /// the child.
    ///
    /// # Errors
    ///
    /// Fails for unknown fields, to-many fields, and string operators
    /// applied to non-string fields.
    pub fn compile(schema: &ModelSchema, predicate: &QueryPredicate) -> StorageResult<Self> {
        match predicate {
            QueryPredicate::All => Ok(CompiledPredicate::True),
            QueryPredicate::Operation(op) => {
                let (column, field_type) = Column::resolve(schema, &op.field)?;
                check_operator(schema, &op.field, &field_type, &op.operator)?;
                let operator = normalize_operator(op.operator.clone(), &field_type);
                Ok(CompiledPredicate::Compare { column, operator })
            }
            QueryPredicate::Group(group) => {
                let children = group
                    .predicates
                    .iter()
                    .map(|p| Self::compile(schema, p))
                    .collect::<StorageResult<Vec<_>>>()?;
                Ok(match group.group_type {
                    QueryPredicateGroupType::And => Self::all(children),
                    QueryPredicateGroupType::Or => Self::any(children),
                    QueryPredicateGroupType::Not => {
                        CompiledPredicate::Not(Box::new(Self::all(children)))
                    }
                })
            }
        }
    }

    fn all(children: Vec<CompiledPredicate>) -> Self {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match child {
                CompiledPredicate::True => {}
                CompiledPredicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => CompiledPredicate::True,
            1 => flat.remove(0),
            _ => CompiledPredicate::And(flat),
        }
    }

    fn any(children: Vec<CompiledPredicate>) -> Self {
        if children.iter().any(|c| *c == CompiledPredicate::True) {
            return CompiledPredicate::True;
        }
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match child {
                CompiledPredicate::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            // An empty disjunction is false.
            CompiledPredicate::Or(flat)
        }
    }

    /// Evaluates against one row.
    pub fn matches(&self, model: &Model) -> bool {
        match self {
            CompiledPredicate::True => true,
            CompiledPredicate::Compare { column, operator } => operator.evaluate(&column.read(model)),
            CompiledPredicate::And(children) => children.iter().all(|c| c.matches(model)),
            CompiledPredicate::Or(children) => children.iter().any(|c| c.matches(model)),
            CompiledPredicate::Not(inner) => !inner.matches(model),
        }
    }
}

fn check_operator(
    schema: &ModelSchema,
    field: &str,
    field_type: &FieldType,
    operator: &QueryOperator,
) -> StorageResult<()> {
    let textual = matches!(
        field_type,
        FieldType::Id
            | FieldType::String
            | FieldType::Enum(_)
            | FieldType::Date
            | FieldType::DateTime
            | FieldType::Time
    );
    let ok = match operator {
        QueryOperator::BeginsWith(_) => textual,
        QueryOperator::Contains(_) | QueryOperator::NotContains(_) => {
            textual || matches!(field_type, FieldType::List(_))
        }
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(StorageError::invalid_predicate(
            schema.name(),
            format!(
                "operator `{}` does not apply to `{field}` of type {}",
                operator.graphql_name(),
                field_type.graphql_name()
            ),
        ))
    }
}

fn normalize_operator(operator: QueryOperator, field_type: &FieldType) -> QueryOperator {
    let n = |v: FieldValue| v.normalize(field_type);
    match operator {
        QueryOperator::Eq(v) => QueryOperator::Eq(n(v)),
        QueryOperator::Ne(v) => QueryOperator::Ne(n(v)),
        QueryOperator::Le(v) => QueryOperator::Le(n(v)),
        QueryOperator::Lt(v) => QueryOperator::Lt(n(v)),
        QueryOperator::Ge(v) => QueryOperator::Ge(n(v)),
        QueryOperator::Gt(v) => QueryOperator::Gt(n(v)),
        QueryOperator::Between(a, b) => QueryOperator::Between(n(a), n(b)),
        other => other,
    }
}

/// Which columns a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// Every field, with belongs-to parents joined one level deep.
    #[default]
    Full,
    /// Every field, parents left as identifiers.
    PrimaryKeysOnly,
}

/// Options of a local query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Row filter.
    pub predicate: Option<QueryPredicate>,
    /// Sort keys, applied in order.
    pub sort: Vec<QuerySortDescriptor>,
    /// Page to return. `None` uses the store's default page size.
    pub pagination: Option<QueryPaginationInput>,
    /// Association projection.
    pub projection: Projection,
}

impl QueryOptions {
    /// Options with no filter, default paging and full projection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the filter.
    #[must_use]
    pub fn with_predicate(mut self, predicate: QueryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Appends a sort key.
    #[must_use]
    pub fn with_sort(mut self, sort: QuerySortDescriptor) -> Self {
        self.sort.push(sort);
        self
    }

    /// Sets the page.
    #[must_use]
    pub fn with_pagination(mut self, pagination: QueryPaginationInput) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Sets the projection.
    #[must_use]
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }
}

/// A belongs-to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// Belongs-to field on the queried model.
    pub field: String,
    /// Parent model name.
    pub parent: String,
}

/// A fully resolved query.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// Row filter.
    pub predicate: CompiledPredicate,
    /// Resolved sort keys.
    pub sort: Vec<(Column, SortOrder)>,
    /// Rows to skip.
    pub offset: usize,
    /// Maximum rows, `None` for all.
    pub limit: Option<usize>,
    /// Parents to join.
    pub joins: Vec<Join>,
}

impl QueryPlan {
    /// Plans a query for `schema`.
    ///
    /// # Errors
    ///
    /// Fails if the predicate or a sort key does not compile.
    pub fn new(
        schema: &ModelSchema,
        registry: &ModelRegistry,
        options: &QueryOptions,
        default_page_size: usize,
    ) -> StorageResult<Self> {
        let predicate = match &options.predicate {
            Some(p) => CompiledPredicate::compile(schema, p)?,
            None => CompiledPredicate::True,
        };
        let sort = options
            .sort
            .iter()
            .map(|s| Ok((Column::resolve(schema, &s.field)?.0, s.order)))
            .collect::<StorageResult<Vec<_>>>()?;
        let pagination = options
            .pagination
            .unwrap_or(QueryPaginationInput::page(0, default_page_size));
        let joins = match options.projection {
            Projection::PrimaryKeysOnly => Vec::new(),
            Projection::Full => schema
                .belongs_to_fields()
                .filter_map(|f| {
                    let parent = f.associated_model()?;
                    registry.contains(parent).then(|| Join {
                        field: f.name.clone(),
                        parent: parent.to_string(),
                    })
                })
                .collect(),
        };
        Ok(Self {
            predicate,
            sort,
            offset: pagination.offset(),
            limit: Some(pagination.limit),
            joins,
        })
    }

    /// A plan returning every row matching `predicate`, unjoined and
    /// unpaged. Used internally by deletes and cascades.
    ///
    /// # Errors
    ///
    /// Fails if the predicate does not compile.
    pub fn scan(schema: &ModelSchema, predicate: &QueryPredicate) -> StorageResult<Self> {
        Ok(Self {
            predicate: CompiledPredicate::compile(schema, predicate)?,
            sort: Vec::new(),
            offset: 0,
            limit: None,
            joins: Vec::new(),
        })
    }

    /// Filters, sorts and pages rows. Rows arrive in primary-key order, which
    /// also breaks ties between equal sort keys.
    pub fn execute<'a>(&self, rows: impl Iterator<Item = &'a Model>) -> Vec<Model> {
        let mut matched: Vec<&Model> = rows.filter(|m| self.predicate.matches(m)).collect();
        if !self.sort.is_empty() {
            matched.sort_by(|a, b| self.compare(a, b));
        }
        let limit = self.limit.unwrap_or(usize::MAX);
        matched
            .into_iter()
            .skip(self.offset)
            .take(limit)
            .cloned()
            .collect()
    }

    fn compare(&self, a: &Model, b: &Model) -> Ordering {
        for (column, order) in &self.sort {
            let (va, vb) = (column.read(a), column.read(b));
            // Nulls sort first in ascending order.
            let ord = match (va.is_null(), vb.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => va.compare(&vb).unwrap_or(Ordering::Equal),
            };
            let ord = match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
