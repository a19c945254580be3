//! # datasync model
//!
//! Typed record descriptions shared by every datasync crate.
//!
//! This crate provides:
//! - [`ModelSchema`] / [`ModelField`]: immutable schema descriptions with
//!   primary keys and associations
//! - [`Model`]: a schema-validated field map with a stable [`ModelIdentifier`]
//! - [`ModelRegistry`]: the explicit set of schemas passed to storage, the
//!   document builder and the sync engine
//! - [`QueryPredicate`]: the predicate tree used for local queries, remote
//!   filters and mutation conditions
//! - [`MutationEvent`], [`MutationSyncMetadata`], [`ModelSyncMetadata`]:
//!   the records that flow between the store, the outbox and the engine
//!
//! ## Key Invariants
//!
//! - Values are validated against the schema when a model is built
//! - Schemas are immutable once built
//! - No global registry: callers pass a [`ModelRegistry`] explicitly

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod model;
pub mod predicate;
mod query;
mod registry;
mod schema;
mod mutation;
mod value;

pub use error::{ModelError, ModelResult};
pub use model::{Model, ModelBuilder, ModelIdentifier, COMPOSITE_KEY_SEPARATOR};
pub use mutation::{
    now_millis, ModelSyncMetadata, MutationEvent, MutationSync, MutationSyncMetadata, MutationType,
};
pub use predicate::{
    QueryOperator, QueryPredicate, QueryPredicateGroup, QueryPredicateGroupType,
    QueryPredicateOperation,
};
pub use query::{QueryPaginationInput, QuerySortDescriptor, SortOrder, DEFAULT_PAGE_LIMIT};
pub use registry::{ModelRegistry, ModelRegistryBuilder};
pub use schema::{Association, FieldType, ModelField, ModelSchema, ModelSchemaBuilder};
pub use value::{FieldValue, JsonMap};
