//! The replicated graph store seam.
//!
//! The store replicates records between peers; its wire protocol and merge
//! rules are not this crate's concern. The node only needs to hand it a
//! listener, open a session with a peer list, and put/get records.

pub mod local;

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;

pub use local::LocalGraph;

/// Errors reported by a graph store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record or snapshot could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The listener stopped accepting connections.
    #[error("Listener failed: {0}")]
    Listener(String),

    /// Snapshot could not be written.
    #[error("Persistence error: {0}")]
    Persist(String),

    /// The operation needs an open session.
    #[error("No session open")]
    NoSession,
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Key and certificate paths for a TLS listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
}

impl TlsMaterial {
    /// Create material from both paths.
    pub fn new(key: impl Into<PathBuf>, cert: impl Into<PathBuf>) -> Self {
        Self {
            key: Some(key.into()),
            cert: Some(cert.into()),
        }
    }

    /// Both paths, when both are configured.
    pub fn paths(&self) -> Option<(&Path, &Path)> {
        match (&self.key, &self.cert) {
            (Some(key), Some(cert)) => Some((key.as_path(), cert.as_path())),
            _ => None,
        }
    }

    /// Whether exactly one of the two paths is set.
    pub fn is_partial(&self) -> bool {
        self.key.is_some() != self.cert.is_some()
    }

    /// Whether both files exist on disk.
    pub fn is_available(&self) -> bool {
        self.paths()
            .map(|(key, cert)| key.exists() && cert.exists())
            .unwrap_or(false)
    }
}

/// How the served listener is exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Plaintext HTTP.
    Plain,
    /// TLS with the given key and certificate files.
    Tls { key: PathBuf, cert: PathBuf },
}

impl Transport {
    /// Pick TLS when the material is complete and present, plaintext otherwise.
    pub fn select(tls: Option<&TlsMaterial>) -> Self {
        match tls.filter(|m| m.is_available()).and_then(TlsMaterial::paths) {
            Some((key, cert)) => Transport::Tls {
                key: key.to_path_buf(),
                cert: cert.to_path_buf(),
            },
            None => Transport::Plain,
        }
    }

    /// Whether this is a TLS transport.
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }
}

/// Parameters for a peer session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Address the node's listener is bound to. `None` for a client.
    pub listen_addr: Option<SocketAddr>,
    /// Peers to connect to.
    pub peers: Vec<String>,
    /// Directory for on-disk state, if any.
    pub storage_path: Option<PathBuf>,
}

/// The distributed graph store collaborator.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Serve requests on `listener` until it fails.
    async fn serve(&self, listener: TcpListener, transport: Transport) -> StoreResult<()>;

    /// Open the peer session.
    async fn open_session(&self, session: Session) -> StoreResult<()>;

    /// Add a peer to the running session.
    async fn connect(&self, peer: &str) -> StoreResult<()>;

    /// Write a record. Object records merge field-wise into an existing one.
    async fn put(&self, path: &str, record: Value) -> StoreResult<()>;

    /// Read a record.
    async fn get(&self, path: &str) -> StoreResult<Option<Value>>;
}
