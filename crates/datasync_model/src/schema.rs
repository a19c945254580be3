//! Model schema definitions.
//!
//! A [`ModelSchema`] is the immutable description of one record type: its
//! ordered fields, which of them form the primary key, and how it relates to
//! other models. Schemas are built once, validated, and then shared by
//! reference (usually through a [`crate::ModelRegistry`]).

use std::sync::Arc;

use crate::error::{ModelError, ModelResult};

/// Semantic type of a model field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Opaque identifier (GraphQL `ID`).
    Id,
    /// UTF-8 string.
    String,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Double,
    /// Boolean.
    Bool,
    /// ISO-8601 calendar date (`AWSDate`).
    Date,
    /// ISO-8601 date and time (`AWSDateTime`).
    DateTime,
    /// ISO-8601 time of day (`AWSTime`).
    Time,
    /// Epoch seconds (`AWSTimestamp`).
    Timestamp,
    /// Enumeration, carrying the GraphQL enum name.
    Enum(String),
    /// Arbitrary JSON (`AWSJSON`).
    Json,
    /// List of scalar values.
    List(Box<FieldType>),
    /// To-one reference to another model.
    Model(String),
    /// To-many collection of another model.
    Collection(String),
}

impl FieldType {
    /// Returns the GraphQL scalar name used in operation variable declarations.
    pub fn graphql_name(&self) -> String {
        match self {
            FieldType::Id => "ID".into(),
            FieldType::String => "String".into(),
            FieldType::Int => "Int".into(),
            FieldType::Double => "Float".into(),
            FieldType::Bool => "Boolean".into(),
            FieldType::Date => "AWSDate".into(),
            FieldType::DateTime => "AWSDateTime".into(),
            FieldType::Time => "AWSTime".into(),
            FieldType::Timestamp => "AWSTimestamp".into(),
            FieldType::Enum(name) => name.clone(),
            FieldType::Json => "AWSJSON".into(),
            FieldType::List(inner) => format!("[{}]", inner.graphql_name()),
            FieldType::Model(name) => name.clone(),
            FieldType::Collection(name) => format!("[{name}]"),
        }
    }

    /// Returns true for references to other models.
    pub fn is_association(&self) -> bool {
        matches!(self, FieldType::Model(_) | FieldType::Collection(_))
    }
}

/// How a field relates to another model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Association {
    /// This model holds the foreign key. `target_name` is the column that
    /// stores the parent identifier (for example `postId`).
    BelongsTo {
        /// Foreign-key column name.
        target_name: String,
    },
    /// The associated model holds a foreign key pointing back here.
    HasOne {
        /// Field on the associated model that references this model.
        associated_with: String,
    },
    /// Many associated models point back here.
    HasMany {
        /// Field on the associated model that references this model.
        associated_with: String,
    },
}

/// A single field declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelField {
    /// Field name as it appears in GraphQL and storage.
    pub name: String,
    /// Semantic type.
    pub field_type: FieldType,
    /// Whether a value must be present.
    pub is_required: bool,
    /// Whether the field is maintained by the backend (never sent as input).
    pub is_read_only: bool,
    /// Whether the field is part of the primary key.
    pub is_primary_key: bool,
    /// Association descriptor, for `Model`/`Collection` fields.
    pub association: Option<Association>,
}

impl ModelField {
    /// Creates an optional, writable field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            is_required: false,
            is_read_only: false,
            is_primary_key: false,
            association: None,
        }
    }

    /// Creates the conventional `id` primary key field.
    pub fn id() -> Self {
        Self::new("id", FieldType::Id).required().primary_key()
    }

    /// Creates a to-one association whose foreign key lives on this model.
    pub fn belongs_to(
        name: impl Into<String>,
        target_model: impl Into<String>,
        target_name: impl Into<String>,
    ) -> Self {
        let mut field = Self::new(name, FieldType::Model(target_model.into()));
        field.association = Some(Association::BelongsTo {
            target_name: target_name.into(),
        });
        field
    }

    /// Creates a to-one association whose foreign key lives on the other model.
    pub fn has_one(
        name: impl Into<String>,
        target_model: impl Into<String>,
        associated_with: impl Into<String>,
    ) -> Self {
        let mut field = Self::new(name, FieldType::Model(target_model.into()));
        field.association = Some(Association::HasOne {
            associated_with: associated_with.into(),
        });
        field
    }

    /// Creates a to-many association.
    pub fn has_many(
        name: impl Into<String>,
        target_model: impl Into<String>,
        associated_with: impl Into<String>,
    ) -> Self {
        let mut field = Self::new(name, FieldType::Collection(target_model.into()));
        field.association = Some(Association::HasMany {
            associated_with: associated_with.into(),
        });
        field
    }

    /// Marks the field as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    /// Marks the field as read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    /// Marks the field as part of the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    /// Returns the target model name for association fields.
    pub fn associated_model(&self) -> Option<&str> {
        match &self.field_type {
            FieldType::Model(name) | FieldType::Collection(name) => Some(name),
            _ => None,
        }
    }

    /// Returns the foreign-key column for belongs-to fields.
    pub fn foreign_key(&self) -> Option<&str> {
        match &self.association {
            Some(Association::BelongsTo { target_name }) => Some(target_name),
            _ => None,
        }
    }

    /// True for fields that carry their own column (scalars and belongs-to).
    pub fn is_stored(&self) -> bool {
        match &self.association {
            None => true,
            Some(Association::BelongsTo { .. }) => true,
            Some(_) => false,
        }
    }
}

/// The immutable description of a record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSchema {
    name: String,
    plural_name: String,
    fields: Vec<ModelField>,
    primary_key: Vec<String>,
}

impl ModelSchema {
    /// Starts building a schema.
    pub fn builder(name: impl Into<String>) -> ModelSchemaBuilder {
        ModelSchemaBuilder {
            name: name.into(),
            plural_name: None,
            fields: Vec::new(),
        }
    }

    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plural model name, used by `list`/`sync` documents.
    pub fn plural_name(&self) -> &str {
        &self.plural_name
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[ModelField] {
        &self.fields
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&ModelField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a field, failing with [`ModelError::UnknownField`].
    pub fn require_field(&self, name: &str) -> ModelResult<&ModelField> {
        self.field(name)
            .ok_or_else(|| ModelError::unknown_field(&self.name, name))
    }

    /// Names of the primary-key fields, in key order.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// True when the primary key spans more than one field.
    pub fn has_composite_key(&self) -> bool {
        self.primary_key.len() > 1
    }

    /// Fields in GraphQL selection order: primary key first, then the
    /// remaining fields sorted by name.
    pub fn sorted_fields(&self) -> Vec<&ModelField> {
        let mut keys: Vec<&ModelField> = self
            .primary_key
            .iter()
            .filter_map(|name| self.field(name))
            .collect();
        let mut rest: Vec<&ModelField> = self
            .fields
            .iter()
            .filter(|f| !f.is_primary_key)
            .collect();
        rest.sort_by(|a, b| a.name.cmp(&b.name));
        keys.extend(rest);
        keys
    }

    /// Belongs-to fields (the ones carrying foreign keys).
    pub fn belongs_to_fields(&self) -> impl Iterator<Item = &ModelField> {
        self.fields.iter().filter(|f| f.foreign_key().is_some())
    }

    /// Has-one and has-many fields (children pointing back here).
    pub fn child_association_fields(&self) -> impl Iterator<Item = &ModelField> {
        self.fields.iter().filter(|f| {
            matches!(
                f.association,
                Some(Association::HasMany { .. }) | Some(Association::HasOne { .. })
            )
        })
    }
}

/// Builder for [`ModelSchema`]. Built schemas are handed out as
/// `Arc<ModelSchema>` and never mutated afterwards.
#[derive(Debug)]
pub struct ModelSchemaBuilder {
    name: String,
    plural_name: Option<String>,
    fields: Vec<ModelField>,
}

impl ModelSchemaBuilder {
    /// Overrides the plural name (defaults to `<name>s`).
    #[must_use]
    pub fn plural(mut self, plural_name: impl Into<String>) -> Self {
        self.plural_name = Some(plural_name.into());
        self
    }

    /// Appends a field.
    #[must_use]
    pub fn field(mut self, field: ModelField) -> Self {
        self.fields.push(field);
        self
    }

    /// Validates and builds the schema.
    ///
    /// # Errors
    ///
    /// Fails when field names collide, no primary key is declared, or an
    /// association field has an inconsistent type.
    pub fn build(self) -> ModelResult<Arc<ModelSchema>> {
        if self.name.is_empty() {
            return Err(ModelError::invalid_schema("", "model name is empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(ModelError::invalid_schema(
                    &self.name,
                    format!("duplicate field `{}`", field.name),
                ));
            }
            if field.field_type.is_association() != field.association.is_some() {
                return Err(ModelError::invalid_schema(
                    &self.name,
                    format!("field `{}` mixes association and scalar type", field.name),
                ));
            }
            if field.is_primary_key && field.field_type.is_association() {
                return Err(ModelError::invalid_schema(
                    &self.name,
                    format!("association `{}` cannot be a primary key", field.name),
                ));
            }
        }

        let primary_key: Vec<String> = self
            .fields
            .iter()
            .filter(|f| f.is_primary_key)
            .map(|f| f.name.clone())
            .collect();
        if primary_key.is_empty() {
            return Err(ModelError::invalid_schema(
                &self.name,
                "no primary key field declared",
            ));
        }

        let plural_name = self
            .plural_name
            .unwrap_or_else(|| format!("{}s", self.name));

        Ok(Arc::new(ModelSchema {
            name: self.name,
            plural_name,
            fields: self.fields,
            primary_key,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_schema() -> Arc<ModelSchema> {
        ModelSchema::builder("Post")
            .field(ModelField::id())
            .field(ModelField::new("title", FieldType::String).required())
            .field(ModelField::new("content", FieldType::String))
            .field(ModelField::new("createdAt", FieldType::DateTime).read_only())
            .field(ModelField::has_many("comments", "Comment", "post"))
            .build()
            .unwrap()
    }

    #[test]
    fn sorted_fields_put_key_first() {
        let schema = post_schema();
        let names: Vec<&str> = schema.sorted_fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "comments", "content", "createdAt", "title"]);
    }

    #[test]
    fn default_plural_name() {
        assert_eq!(post_schema().plural_name(), "Posts");
        let schema = ModelSchema::builder("Category")
            .plural("Categories")
            .field(ModelField::id())
            .build()
            .unwrap();
        assert_eq!(schema.plural_name(), "Categories");
    }

    #[test]
    fn rejects_missing_primary_key() {
        let result = ModelSchema::builder("Post")
            .field(ModelField::new("title", FieldType::String))
            .build();
        assert!(matches!(result, Err(ModelError::InvalidSchema { .. })));
    }

    #[test]
    fn rejects_duplicate_fields() {
        let result = ModelSchema::builder("Post")
            .field(ModelField::id())
            .field(ModelField::new("id", FieldType::String))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn composite_key() {
        let schema = ModelSchema::builder("Book")
            .field(ModelField::new("isbn", FieldType::String).required().primary_key())
            .field(ModelField::new("edition", FieldType::Int).required().primary_key())
            .build()
            .unwrap();
        assert!(schema.has_composite_key());
        assert_eq!(schema.primary_key(), &["isbn".to_string(), "edition".to_string()]);
    }

    #[test]
    fn association_helpers() {
        let comment = ModelSchema::builder("Comment")
            .field(ModelField::id())
            .field(ModelField::belongs_to("post", "Post", "postId"))
            .build()
            .unwrap();
        let field = comment.field("post").unwrap();
        assert_eq!(field.foreign_key(), Some("postId"));
        assert_eq!(field.associated_model(), Some("Post"));
        assert!(field.is_stored());
        assert!(!post_schema().field("comments").unwrap().is_stored());
    }
}
