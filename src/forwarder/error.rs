//! Error types for the forwarder daemon.

use thiserror::Error;

use crate::store::StoreError;

/// Errors that abort forwarder startup or its supervisory loop.
#[derive(Debug, Error)]
pub enum ForwarderError {
    /// Rendezvous store failure.
    #[error("rendezvous error: {0}")]
    Store(#[from] StoreError),

    /// The security filter configuration was invalid.
    #[error("invalid scan pattern: {0}")]
    Filter(#[from] regex::Error),

    /// The outbound HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// The audit log could not be opened.
    #[error("failed to open audit log: {0}")]
    Audit(#[source] std::io::Error),
}

/// Failure of one outbound fetch after the retry budget is spent.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The envelope's method or headers could not be replayed.
    #[error("request cannot be replayed: {0}")]
    Malformed(String),

    /// All attempts failed at the transport level.
    #[error("upstream unreachable after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The final transport error.
        #[source]
        last: reqwest::Error,
    },

    /// A non-retryable transport error.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}
