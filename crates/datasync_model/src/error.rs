//! Error types for model and schema operations.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while building schemas or validating model instances.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A schema definition is malformed.
    #[error("invalid schema `{model}`: {message}")]
    InvalidSchema {
        /// Name of the offending schema.
        model: String,
        /// Description of the problem.
        message: String,
    },

    /// A model name is not present in the registry.
    #[error("model `{0}` is not registered")]
    UnknownModel(String),

    /// A field name is not declared by the schema.
    #[error("model `{model}` has no field `{field}`")]
    UnknownField {
        /// Model name.
        model: String,
        /// Field name.
        field: String,
    },

    /// A required field has no value.
    #[error("required field `{model}.{field}` is missing")]
    MissingRequiredField {
        /// Model name.
        model: String,
        /// Field name.
        field: String,
    },

    /// A value does not match the declared field type.
    #[error("field `{model}.{field}` expects {expected}, got {actual}")]
    TypeMismatch {
        /// Model name.
        model: String,
        /// Field name.
        field: String,
        /// Declared type.
        expected: String,
        /// Kind of the supplied value.
        actual: String,
    },

    /// The primary key could not be derived from a model instance.
    #[error("invalid identifier for `{model}`: {message}")]
    InvalidIdentifier {
        /// Model name.
        model: String,
        /// Description of the problem.
        message: String,
    },

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Decoded data does not have the expected shape.
    #[error("decoding error: {0}")]
    Decoding(String),
}

impl ModelError {
    /// Creates an invalid schema error.
    pub fn invalid_schema(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown field error.
    pub fn unknown_field(model: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            model: model.into(),
            field: field.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ModelError::unknown_field("Post", "body");
        assert_eq!(err.to_string(), "model `Post` has no field `body`");

        let err = ModelError::TypeMismatch {
            model: "Post".into(),
            field: "rating".into(),
            expected: "Int".into(),
            actual: "String".into(),
        };
        assert!(err.to_string().contains("expects Int"));
    }
}
