//! Error types for rendezvous store operations.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("rendezvous I/O error at {path}: {source}")]
    Io {
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An id was published twice; correlation ids are unique for the
    /// lifetime of a rendezvous root.
    #[error("envelope {id} already committed at {path}")]
    Duplicate {
        /// The repeated correlation id.
        id: String,
        /// The existing committed path.
        path: PathBuf,
    },

    /// `wait_for` reached its deadline before the file was committed.
    #[error("timed out waiting for envelope {id}")]
    Timeout {
        /// The correlation id that never arrived.
        id: String,
    },
}
