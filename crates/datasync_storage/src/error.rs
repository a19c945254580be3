//! Error types for storage operations.

use std::io;

use datasync_model::ModelError;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the backend.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The journal is corrupted beyond its last frame.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store directory.
    #[error("store is locked by another process: {0}")]
    Locked(String),

    /// A conditional write was rejected.
    #[error("invalid condition on `{model}` `{model_id}`: {message}")]
    InvalidCondition {
        /// Model name.
        model: String,
        /// Model identifier.
        model_id: String,
        /// Why the condition failed.
        message: String,
    },

    /// A predicate cannot be compiled against the schema.
    #[error("invalid predicate on `{model}`: {message}")]
    InvalidPredicate {
        /// Model name.
        model: String,
        /// Description of the problem.
        message: String,
    },

    /// Schema or model validation failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// A journal record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Creates an invalid condition error.
    pub fn invalid_condition(
        model: impl Into<String>,
        model_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidCondition {
            model: model.into(),
            model_id: model_id.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid predicate error.
    pub fn invalid_predicate(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPredicate {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
