//! # datasync storage
//!
//! The local storage adapter of datasync.
//!
//! This crate provides:
//! - [`LocalStore`]: conditional save, predicate query, cascade delete and
//!   existence checks over one table per registered model
//! - System tables for sync metadata, outbox rows and sync cursors
//! - [`CompiledPredicate`] / [`QueryPlan`]: the predicate compiler and the
//!   query executor (sort, pagination, one-level association join)
//! - A checksummed CBOR journal over a [`StorageBackend`]
//!   ([`InMemoryBackend`] or the directory-locked [`FileBackend`])
//!
//! ## Key Invariants
//!
//! - A write transaction is all-or-nothing, in memory and in the journal
//! - A rejected condition never mutates the store
//! - Writes are serialized; reads share the table lock
//! - Replay discards a torn trailing frame and rejects mid-journal damage
//!
//! ## Example
//!
//! ```rust
//! use datasync_model::{FieldType, Model, ModelField, ModelRegistry, ModelSchema};
//! use datasync_model::predicate::field;
//! use datasync_storage::LocalStore;
//!
//! let post = ModelSchema::builder("Post")
//!     .field(ModelField::id())
//!     .field(ModelField::new("title", FieldType::String))
//!     .build()
//!     .unwrap();
//! let registry = ModelRegistry::builder().register(post.clone()).build().unwrap();
//! let store = LocalStore::in_memory(registry).unwrap();
//!
//! let model = Model::builder(&post).set("title", "hello").build().unwrap();
//! store.save(&model, None).unwrap();
//!
//! let rows = store.query(&post, Some(&field("title").eq("hello")), &[], None).unwrap();
//! assert_eq!(rows.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod compiler;
mod config;
mod error;
mod file;
mod journal;
mod memory;
mod records;
mod state;
mod store;
mod transaction;

pub use backend::StorageBackend;
pub use compiler::{Column, CompiledPredicate, Join, Projection, QueryOptions, QueryPlan};
pub use config::StoreConfig;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use journal::{
    compute_crc32, encode_frame, scan, FrameKind, JournalBatch, JournalOp, Replay, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};
pub use memory::InMemoryBackend;
pub use records::OutboxRecord;
pub use store::LocalStore;
pub use transaction::{DeleteTarget, Deleted, Saved, Transaction};
