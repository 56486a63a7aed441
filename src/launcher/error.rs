//! Error types for the launcher shim.

use thiserror::Error;

use crate::proxy::{CaError, ProxyError};
use crate::store::StoreError;

/// Failures while standing up the relay or the user's program.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The program to run could not be found.
    #[error("program not found: {0}")]
    ProgramNotFound(String),

    /// The intercepting proxy failed to start.
    #[error("proxy startup failed: {0}")]
    ProxyStartup(#[source] ProxyError),

    /// The interception CA could not be prepared.
    #[error("CA setup failed: {0}")]
    Ca(#[from] CaError),

    /// The rendezvous directory could not be prepared.
    #[error("rendezvous setup failed: {0}")]
    Store(#[from] StoreError),

    /// Spawning or waiting on the child failed.
    #[error("child process error: {0}")]
    Child(#[source] std::io::Error),

    /// The async runtime could not be built.
    #[error("runtime error: {0}")]
    Runtime(#[source] std::io::Error),
}
