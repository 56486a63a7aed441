//! Error types for proxy operations.

use thiserror::Error;

use crate::envelope::CodecError;
use crate::store::StoreError;

/// Unified error type for the intercepting proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid CONNECT request.
    #[error("invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// TLS error during handshake or certificate operations.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate authority operation failed.
    #[error("certificate authority error: {0}")]
    Ca(#[from] CaError),

    /// Rendezvous store failure.
    #[error("rendezvous error: {0}")]
    Store(#[from] StoreError),

    /// Envelope codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

/// Errors raised while managing the interception CA.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to create the CA directory.
    #[error("failed to create CA directory: {0}")]
    Dir(#[source] std::io::Error),

    /// Failed to read CA material from disk.
    #[error("failed to read CA material: {0}")]
    ReadFile(#[source] std::io::Error),

    /// Failed to write CA material to disk.
    #[error("failed to write CA material: {0}")]
    WriteFile(#[source] std::io::Error),

    /// Failed to set restrictive permissions.
    #[error("failed to set CA permissions: {0}")]
    Permissions(#[source] std::io::Error),

    /// Key generation or parsing failed.
    #[error("key generation failed: {0}")]
    Key(String),

    /// Certificate generation failed.
    #[error("certificate generation failed: {0}")]
    CertGeneration(String),

    /// Signing a leaf certificate failed.
    #[error("leaf signing failed: {0}")]
    Signing(String),

    /// A leaf certificate was requested without any hostname.
    #[error("no hostnames supplied for leaf certificate")]
    NoDomains,
}
