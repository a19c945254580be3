//! Error types for the sync engine.

use datasync_graphql::GraphQLError;
use datasync_model::ModelError;
use datasync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A conditional local write was rejected.
    #[error("invalid condition on `{model}` `{model_id}`: {message}")]
    InvalidCondition {
        /// Model name.
        model: String,
        /// Model identifier.
        model_id: String,
        /// Why the condition failed.
        message: String,
    },

    /// The backend rejected a mutation because of a version mismatch.
    #[error("conflict on `{model}` `{model_id}` (remote version {remote_version:?})")]
    Conflict {
        /// Model name.
        model: String,
        /// Model identifier.
        model_id: String,
        /// Version held by the backend, when reported.
        remote_version: Option<i64>,
    },

    /// Network or transport error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A response does not match the registered schemas.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// An unexpected failure inside the engine.
    #[error("internal error: {0}")]
    InternalOperation(String),

    /// The backend refused the credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The operation was cancelled by a stop.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} on {action}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Rejected action.
        action: String,
    },

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Document building or response error.
    #[error("graphql error: {0}")]
    GraphQL(GraphQLError),

    /// Schema or model validation failed.
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalOperation(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Storage(StorageError::Io(_)) => true,
            _ => false,
        }
    }

    /// Returns true if this error tears the engine down.
    ///
    /// Conditional-write and conflict errors concern one mutation and are
    /// handled where they occur.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
            && !matches!(
                self,
                SyncError::InvalidCondition { .. } | SyncError::Conflict { .. } | SyncError::Cancelled
            )
    }
}

impl From<StorageError> for SyncError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidCondition {
                model,
                model_id,
                message,
            } => SyncError::InvalidCondition {
                model,
                model_id,
                message,
            },
            other => SyncError::Storage(other),
        }
    }
}

impl From<GraphQLError> for SyncError {
    fn from(error: GraphQLError) -> Self {
        match error {
            GraphQLError::Decoding(message) => SyncError::Decoding(message),
            GraphQLError::Model(e) => SyncError::Model(e),
            other => SyncError::GraphQL(other),
        }
    }
}
