//! The model registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ModelError, ModelResult};
use crate::schema::{Association, ModelSchema};

/// The set of schemas known to a store and sync engine.
///
/// Constructed once, validated, and passed by reference (or cloned cheaply,
/// schemas are `Arc`s) to the storage adapter, document builder and sync
/// engine.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    schemas: BTreeMap<String, Arc<ModelSchema>>,
    order: Vec<String>,
}

impl ModelRegistry {
    /// Starts building a registry.
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    /// Looks up a schema by model name.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::UnknownModel`] when the name is not registered.
    pub fn schema(&self, name: &str) -> ModelResult<&Arc<ModelSchema>> {
        self.schemas
            .get(name)
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Schemas in registration order.
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<ModelSchema>> {
        self.order.iter().filter_map(|name| self.schemas.get(name))
    }

    /// Number of registered schemas.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// Returns true when no schema is registered.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Schemas ordered so that every parent precedes the models that belong
    /// to it. Initial sync follows this order so foreign keys resolve.
    pub fn sync_order(&self) -> Vec<Arc<ModelSchema>> {
        let mut ordered: Vec<Arc<ModelSchema>> = Vec::with_capacity(self.schemas.len());
        let mut placed = std::collections::HashSet::new();

        fn visit(
            registry: &ModelRegistry,
            name: &str,
            placed: &mut std::collections::HashSet<String>,
            visiting: &mut Vec<String>,
            ordered: &mut Vec<Arc<ModelSchema>>,
        ) {
            if placed.contains(name) || visiting.iter().any(|v| v == name) {
                return;
            }
            let Some(schema) = registry.schemas.get(name) else {
                return;
            };
            visiting.push(name.to_string());
            for field in schema.belongs_to_fields() {
                if let Some(parent) = field.associated_model() {
                    visit(registry, parent, placed, visiting, ordered);
                }
            }
            visiting.pop();
            placed.insert(name.to_string());
            ordered.push(Arc::clone(schema));
        }

        for name in &self.order {
            visit(self, name, &mut placed, &mut Vec::new(), &mut ordered);
        }
        ordered
    }

    /// Child associations pointing at `parent`, as
    /// `(child schema, belongs-to field name on the child)`.
    pub fn children_of(&self, parent: &str) -> Vec<(Arc<ModelSchema>, String)> {
        let Ok(schema) = self.schema(parent) else {
            return Vec::new();
        };
        schema
            .child_association_fields()
            .filter_map(|field| {
                let child = self.schemas.get(field.associated_model()?)?;
                let associated_with = match &field.association {
                    Some(Association::HasMany { associated_with })
                    | Some(Association::HasOne { associated_with }) => associated_with,
                    _ => return None,
                };
                Some((Arc::clone(child), associated_with.clone()))
            })
            .collect()
    }
}

/// Builder for [`ModelRegistry`].
#[derive(Debug, Default)]
pub struct ModelRegistryBuilder {
    schemas: Vec<Arc<ModelSchema>>,
}

impl ModelRegistryBuilder {
    /// Adds a schema.
    #[must_use]
    pub fn register(mut self, schema: Arc<ModelSchema>) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Validates cross-schema references and builds the registry.
    ///
    /// # Errors
    ///
    /// Fails on duplicate model names, associations pointing at unknown
    /// models, and has-many/has-one fields whose `associated_with` is not a
    /// belongs-to field of the target.
    pub fn build(self) -> ModelResult<ModelRegistry> {
        let mut registry = ModelRegistry::default();
        for schema in self.schemas {
            let name = schema.name().to_string();
            if registry.schemas.insert(name.clone(), schema).is_some() {
                return Err(ModelError::invalid_schema(name, "registered twice"));
            }
            registry.order.push(name);
        }

        for schema in registry.schemas.values() {
            for field in schema.fields() {
                let Some(target) = field.associated_model() else {
                    continue;
                };
                let target_schema = registry.schemas.get(target).ok_or_else(|| {
                    ModelError::invalid_schema(
                        schema.name(),
                        format!("field `{}` references unknown model `{target}`", field.name),
                    )
                })?;
                if let Some(Association::HasMany { associated_with })
                | Some(Association::HasOne { associated_with }) = &field.association
                {
                    let back = target_schema
                        .field(associated_with)
                        .and_then(|f| f.foreign_key());
                    if back.is_none() {
                        return Err(ModelError::invalid_schema(
                            schema.name(),
                            format!(
                                "field `{}` expects `{target}.{associated_with}` to be a belongs-to",
                                field.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(registry)
    }
}
