//! Model instances and identifiers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::{ModelError, ModelResult};
use crate::registry::ModelRegistry;
use crate::schema::{Association, FieldType, ModelField, ModelSchema};
use crate::value::{json_kind, FieldValue, JsonMap};

static NULL: FieldValue = FieldValue::Null;

/// Separator used when a composite key is flattened to a single string.
pub const COMPOSITE_KEY_SEPARATOR: &str = "#";

/// The primary key of a model instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelIdentifier {
    /// Single `id` field.
    Default(String),
    /// Several key fields, in key order.
    Composite(Vec<(String, FieldValue)>),
}

impl ModelIdentifier {
    /// Flattens the identifier into the string used for outbox and sync
    /// metadata keys. Composite keys are joined with `#`.
    pub fn string_value(&self) -> String {
        match self {
            ModelIdentifier::Default(id) => id.clone(),
            ModelIdentifier::Composite(fields) => fields
                .iter()
                .map(|(_, value)| value.to_string())
                .collect::<Vec<_>>()
                .join(COMPOSITE_KEY_SEPARATOR),
        }
    }

    /// Key fields as `(name, value)` pairs.
    pub fn fields(&self) -> Vec<(String, FieldValue)> {
        match self {
            ModelIdentifier::Default(id) => vec![("id".to_string(), FieldValue::String(id.clone()))],
            ModelIdentifier::Composite(fields) => fields.clone(),
        }
    }
}

impl fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string_value())
    }
}

/// A schema-typed record.
///
/// Field values are checked against the [`ModelSchema`] when the model is
/// built or updated, never at access time. Fields that were not supplied
/// read as [`FieldValue::Null`].
///
/// To-one (belongs-to) fields hold either the parent's identifier string or,
/// after an association join, the parent [`Model`] itself.
#[derive(Clone)]
pub struct Model {
    schema: Arc<ModelSchema>,
    values: BTreeMap<String, FieldValue>,
}

impl Model {
    /// Starts building an instance of `schema`.
    pub fn builder(schema: &Arc<ModelSchema>) -> ModelBuilder {
        ModelBuilder {
            schema: Arc::clone(schema),
            values: BTreeMap::new(),
        }
    }

    /// The schema this instance conforms to.
    pub fn schema(&self) -> &Arc<ModelSchema> {
        &self.schema
    }

    /// Model name.
    pub fn model_name(&self) -> &str {
        self.schema.name()
    }

    /// Reads a field, returning `Null` when unset.
    pub fn get(&self, field: &str) -> &FieldValue {
        self.values.get(field).unwrap_or(&NULL)
    }

    /// All explicitly set values.
    pub fn values(&self) -> &BTreeMap<String, FieldValue> {
        &self.values
    }

    /// Replaces a field value after validating it.
    ///
    /// # Errors
    ///
    /// Fails for unknown fields, type mismatches, attempts to change the
    /// primary key, or nulling a required field.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> ModelResult<()> {
        let declared = self.schema.require_field(field)?;
        let value = check_value(&self.schema, declared, value.into())?;
        if declared.is_primary_key && self.values.get(field) != Some(&value) {
            return Err(ModelError::InvalidIdentifier {
                model: self.schema.name().to_string(),
                message: format!("primary key field `{field}` cannot be changed"),
            });
        }
        if declared.is_required && !declared.is_read_only && value.is_null() {
            return Err(ModelError::MissingRequiredField {
                model: self.schema.name().to_string(),
                field: field.to_string(),
            });
        }
        self.values.insert(field.to_string(), value);
        Ok(())
    }

    /// Returns a copy with `field` replaced.
    ///
    /// # Errors
    ///
    /// Same as [`Model::set`].
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> ModelResult<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    /// Primary key of this instance.
    pub fn identifier(&self) -> ModelIdentifier {
        let key = self.schema.primary_key();
        if key.len() == 1 && key[0] == "id" {
            return ModelIdentifier::Default(self.get("id").to_string());
        }
        ModelIdentifier::Composite(
            key.iter()
                .map(|name| (name.clone(), self.get(name).clone()))
                .collect(),
        )
    }

    /// Primary key flattened to a string.
    pub fn identifier_string(&self) -> String {
        self.identifier().string_value()
    }

    /// Identifier of the parent referenced by a belongs-to field.
    pub fn foreign_key(&self, field: &str) -> Option<String> {
        match self.get(field) {
            FieldValue::Model(parent) => Some(parent.identifier_string()),
            FieldValue::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Returns a copy where joined parents are replaced by their identifier.
    pub fn without_associations(&self) -> Model {
        let values = self
            .values
            .iter()
            .map(|(name, value)| match value {
                FieldValue::Model(parent) => {
                    (name.clone(), FieldValue::String(parent.identifier_string()))
                }
                other => (name.clone(), other.clone()),
            })
            .collect();
        Model {
            schema: Arc::clone(&self.schema),
            values,
        }
    }

    /// Replaces a belongs-to reference with the joined parent.
    pub fn attach(&mut self, field: &str, parent: Model) {
        self.values
            .insert(field.to_string(), FieldValue::Model(Box::new(parent)));
    }

    /// Encodes the stored fields as a JSON object.
    ///
    /// Belongs-to fields are written under their foreign-key column
    /// (`postId`), never as nested objects. Unset fields are written as
    /// `null` so that updates clear them remotely.
    pub fn to_json_map(&self) -> JsonMap {
        let mut map = JsonMap::new();
        for field in self.schema.fields().iter().filter(|f| f.is_stored()) {
            if let Some(fk) = field.foreign_key() {
                let value = self.foreign_key(&field.name).map_or(Json::Null, Json::String);
                map.insert(fk.to_string(), value);
                continue;
            }
            let value = self.get(&field.name);
            if field.is_read_only && value.is_null() {
                continue;
            }
            map.insert(field.name.clone(), value.to_json());
        }
        map
    }

    /// Encodes the stored fields as a JSON value.
    pub fn to_json(&self) -> Json {
        Json::Object(self.to_json_map())
    }

    /// Encodes the stored fields as a JSON string.
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    /// Decodes a model from JSON.
    ///
    /// Accepts both the storage shape produced by [`Model::to_json`] and the
    /// GraphQL response shape, where belongs-to parents arrive as nested
    /// objects. Keys that the schema does not declare (`__typename`,
    /// `_version`, ...) are ignored.
    ///
    /// # Errors
    ///
    /// Fails when `json` is not an object, a value has the wrong type, or a
    /// required field is missing.
    pub fn from_json(
        schema: &Arc<ModelSchema>,
        registry: &ModelRegistry,
        json: &Json,
    ) -> ModelResult<Model> {
        decode(schema, registry, json, true)
    }

    /// Decodes a model from a JSON string.
    ///
    /// # Errors
    ///
    /// Same as [`Model::from_json`], plus JSON syntax errors.
    pub fn from_json_str(
        schema: &Arc<ModelSchema>,
        registry: &ModelRegistry,
        json: &str,
    ) -> ModelResult<Model> {
        let value: Json = serde_json::from_str(json)?;
        decode(schema, registry, &value, true)
    }
}

fn decode(
    schema: &Arc<ModelSchema>,
    registry: &ModelRegistry,
    json: &Json,
    check_required: bool,
) -> ModelResult<Model> {
    let object = json.as_object().ok_or_else(|| {
        ModelError::decoding(format!(
            "`{}` must decode from an object, got {}",
            schema.name(),
            json_kind(json)
        ))
    })?;

    let mut builder = Model::builder(schema);
    for field in schema.fields() {
        match &field.association {
            Some(Association::BelongsTo { target_name }) => {
                let parent_name = field.associated_model().unwrap_or_default();
                match object.get(&field.name) {
                    Some(nested @ Json::Object(_)) => {
                        let parent_schema = registry.schema(parent_name)?;
                        let parent = decode(parent_schema, registry, nested, false)?;
                        builder = builder.set(&field.name, parent);
                    }
                    _ => {
                        if let Some(Json::String(id)) = object.get(target_name) {
                            builder = builder.set(&field.name, id.as_str());
                        }
                    }
                }
            }
            Some(_) => {}
            None => {
                if let Some(raw) = object.get(&field.name) {
                    let value = FieldValue::from_json(&field.field_type, raw).map_err(|e| {
                        ModelError::decoding(format!("{}.{}: {e}", schema.name(), field.name))
                    })?;
                    builder = builder.set(&field.name, value);
                }
            }
        }
    }
    if check_required {
        builder.build()
    } else {
        builder.build_partial()
    }
}

fn check_value(
    schema: &ModelSchema,
    field: &ModelField,
    value: FieldValue,
) -> ModelResult<FieldValue> {
    if let FieldType::Collection(_) = field.field_type {
        return Err(ModelError::TypeMismatch {
            model: schema.name().to_string(),
            field: field.name.clone(),
            expected: "lazy collection".into(),
            actual: value.kind().into(),
        });
    }
    let value = value.normalize(&field.field_type);
    if !value.matches_type(&field.field_type) {
        return Err(ModelError::TypeMismatch {
            model: schema.name().to_string(),
            field: field.name.clone(),
            expected: field.field_type.graphql_name(),
            actual: value.kind().into(),
        });
    }
    Ok(value)
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name() == other.schema.name() && self.values == other.values
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.schema.name())
            .field("values", &self.values)
            .finish()
    }
}

/// Builder for [`Model`].
#[derive(Debug)]
pub struct ModelBuilder {
    schema: Arc<ModelSchema>,
    values: BTreeMap<String, FieldValue>,
}

impl ModelBuilder {
    /// Sets a field value. Validation happens in [`ModelBuilder::build`].
    #[must_use]
    pub fn set(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.values.insert(field.to_string(), value.into());
        self
    }

    /// Validates the values and builds the model.
    ///
    /// A schema keyed by a single `id` field gets a random UUID when no id
    /// was supplied.
    ///
    /// # Errors
    ///
    /// Fails for unknown fields, type mismatches and missing required
    /// fields.
    pub fn build(self) -> ModelResult<Model> {
        self.finish(true)
    }

    fn build_partial(self) -> ModelResult<Model> {
        self.finish(false)
    }

    fn finish(mut self, check_required: bool) -> ModelResult<Model> {
        let key = self.schema.primary_key();
        if key.len() == 1
            && key[0] == "id"
            && self.values.get("id").map_or(true, FieldValue::is_null)
        {
            self.values.insert(
                "id".to_string(),
                FieldValue::String(uuid::Uuid::new_v4().to_string()),
            );
        }

        let mut values = BTreeMap::new();
        for (name, value) in self.values {
            let field = self.schema.require_field(&name)?;
            let value = check_value(&self.schema, field, value)?;
            if !value.is_null() {
                values.insert(name, value);
            }
        }

        for field in self.schema.fields() {
            let missing = !values.contains_key(&field.name);
            if field.is_primary_key && missing {
                return Err(ModelError::InvalidIdentifier {
                    model: self.schema.name().to_string(),
                    message: format!("key field `{}` is not set", field.name),
                });
            }
            if check_required
                && missing
                && field.is_required
                && !field.is_read_only
                && field.is_stored()
            {
                return Err(ModelError::MissingRequiredField {
                    model: self.schema.name().to_string(),
                    field: field.name.clone(),
                });
            }
        }

        Ok(Model {
            schema: self.schema,
            values,
        })
    }
}
