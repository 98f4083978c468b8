//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding, decoding or reading typed fields.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The serializer failed.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Serializer message.
        message: String,
    },

    /// The input is not valid CBOR for a document value.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Deserializer message.
        message: String,
    },

    /// A required field is absent.
    #[error("missing field '{field}'")]
    MissingField {
        /// Field name.
        field: String,
    },

    /// A field holds a value of the wrong type.
    #[error("field '{field}' should be {expected}, found {found}")]
    InvalidField {
        /// Field name.
        field: String,
        /// Expected type.
        expected: &'static str,
        /// Type actually present.
        found: &'static str,
    },
}

impl CodecError {
    /// Creates an encoding error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Creates a decoding error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}
