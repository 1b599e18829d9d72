//! Network error types.

use std::net::SocketAddr;

use crate::store::StoreError;

/// Errors that can occur in the siphon_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The shared store rejected an operation.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The listener could not bind its address.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The listener failed in a way it cannot recover from.
    #[error("Listener failed: {0}")]
    Listener(std::io::Error),

    /// The session configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}
