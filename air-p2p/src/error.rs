//! P2P error types.

use std::io;
use thiserror::Error;

use crate::store::StoreError;

/// Errors raised by the network core.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error during file or network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize a document.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The listen port is already taken by another socket.
    #[error("Port {port} is already in use")]
    PortInUse { port: u16 },

    /// Any other listener failure (bind or serve).
    #[error("Listener error: {0}")]
    Listener(String),

    /// The supervisor gave up restarting the listener.
    #[error("Maximum restart attempts ({max}) reached")]
    RestartLimitExceeded { max: u32 },

    /// A record could not be written into the shared store.
    #[error("Publish to {path} failed: {reason}")]
    Publish { path: String, reason: String },

    /// Error reported by the graph store collaborator.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// DNS resolution failed.
    #[error("DNS resolution failed for {host}: {error}")]
    DnsResolutionFailed { host: String, error: String },

    /// Invalid peer address.
    #[error("Invalid peer address: {0:?}")]
    InvalidAddress(String),

    /// A discovery strategy failed.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Configuration could not be read or persisted.
    #[error("Settings error: {0}")]
    Settings(String),
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        P2pError::Serialization(err.to_string())
    }
}

impl P2pError {
    /// Whether the supervisor should bump the port before restarting.
    pub fn is_port_in_use(&self) -> bool {
        matches!(self, P2pError::PortInUse { .. })
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;
