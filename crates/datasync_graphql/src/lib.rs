//! # datasync GraphQL
//!
//! GraphQL documents for the datasync engine.
//!
//! This crate provides:
//! - [`ModelBasedDocumentBuilder`]: builds query, mutation and subscription
//!   documents for a model schema from composable [`DocumentDecorator`]s
//! - [`graphql_filter`]: predicate to `Model<Name>FilterInput` encoding
//! - [`GraphQLRequest`]: the requests the sync engine sends
//! - [`GraphQLResponse`] and decoders for `MutationSync` results and sync
//!   pages, with AppSync error classification
//!
//! ## Key Invariants
//!
//! - Document text is deterministic: selection sets list the primary key,
//!   then the remaining fields by name, then `__typename` and the
//!   conflict-resolution fields
//! - Variables are sorted by name
//! - Decorators are pure; the order of independent decorators does not
//!   change the document

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod document;
mod error;
mod filter;
mod request;
mod response;

pub use document::{
    mutation_input, DocumentDecorator, DocumentDirective, DocumentSpec, GraphQLDocument,
    ModelBasedDocumentBuilder, OperationType, CONFLICT_RESOLUTION_FIELDS,
};
pub use error::{GraphQLError, GraphQLResult};
pub use filter::{graphql_filter, graphql_filter_string};
pub use request::GraphQLRequest;
pub use response::{
    decode_mutation_sync, decode_paginated_list, AppSyncErrorType, GraphQLResponse,
    GraphQLResponseError, PaginatedList,
};
