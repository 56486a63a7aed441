//! Error types for envelope encoding and decoding.

use thiserror::Error;

/// Unified error type for codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The JSON document could not be produced or parsed.
    #[error("envelope JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The body was not valid base64.
    #[error("envelope body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The stored hash does not match the body bytes.
    #[error("integrity check failed for {id}: stored {stored}, computed {computed}")]
    Integrity {
        /// Correlation id of the offending envelope.
        id: String,
        /// Hash recorded in the envelope.
        stored: String,
        /// Hash computed over the decoded body.
        computed: String,
    },

    /// An approved response envelope arrived without a response section.
    #[error("approved response envelope {0} is missing its response section")]
    MissingResponse(String),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
