//! Server-level errors.

use thiserror::Error;

/// Errors that stop the server from serving at all.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Other listener I/O failure.
    #[error("listener I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Limits or listener configuration the server cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
