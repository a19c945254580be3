//! Error types for document building and response decoding.

use datasync_model::ModelError;
use thiserror::Error;

use crate::response::GraphQLResponseError;

/// Result type for GraphQL operations.
pub type GraphQLResult<T> = Result<T, GraphQLError>;

/// Errors raised while building documents or decoding responses.
#[derive(Debug, Error)]
pub enum GraphQLError {
    /// The decorators applied to a builder do not describe a valid document.
    #[error("invalid document for `{model}`: {message}")]
    InvalidDocument {
        /// Model name.
        model: String,
        /// Description of the problem.
        message: String,
    },

    /// A response did not have the expected shape.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The backend answered with GraphQL errors.
    #[error("backend returned {} error(s): {}", .0.len(), first_message(.0))]
    Response(Vec<GraphQLResponseError>),

    /// Model validation failed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphQLError {
    /// Creates an invalid-document error.
    pub fn invalid_document(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding(message.into())
    }
}

fn first_message(errors: &[GraphQLResponseError]) -> &str {
    errors.first().map_or("", |e| e.message.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_error_display_uses_first_message() {
        let err = GraphQLError::Response(vec![
            GraphQLResponseError::new("first"),
            GraphQLResponseError::new("second"),
        ]);
        assert_eq!(err.to_string(), "backend returned 2 error(s): first");
    }
}
