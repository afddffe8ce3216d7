//! Minimal in-process graph store.
//!
//! Records live in memory and, once a session with a storage path is open,
//! are mirrored into `graph.json` under that path. The served listener speaks
//! newline-delimited JSON:
//!
//! ```text
//! -> {"op":"get","path":"air/nodes/localhost"}
//! <- {"ok":true,"record":{...}}
//! -> {"op":"put","path":"air/ddns","record":{"host":"example.org"}}
//! <- {"ok":true}
//! -> {"op":"peers"}
//! <- {"ok":true,"peers":["a:1"]}
//! ```
//!
//! Replication between peers is out of its reach; peers are only tracked.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};

use super::{GraphStore, Session, StoreError, StoreResult, Transport};
use crate::peers::PeerSet;
use crate::persist;

/// File name of the on-disk snapshot inside the storage path.
pub const SNAPSHOT_FILE: &str = "graph.json";

/// Snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphSnapshot {
    version: u32,
    records: BTreeMap<String, Value>,
}

/// State of the open session.
#[derive(Debug)]
struct SessionState {
    listen_addr: Option<SocketAddr>,
    peers: PeerSet,
    snapshot: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Inner {
    records: RwLock<BTreeMap<String, Value>>,
    session: RwLock<Option<SessionState>>,
    /// Serializes snapshot writes.
    persist_lock: Mutex<()>,
}

/// A request on the served listener.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request {
    Get { path: String },
    Put { path: String, record: Value },
    Peers,
}

/// Reply to a request.
#[derive(Debug, Default, Serialize)]
struct Reply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Reply {
    fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// In-process [`GraphStore`] implementation.
#[derive(Debug, Clone, Default)]
pub struct LocalGraph {
    inner: Arc<Inner>,
}

impl LocalGraph {
    /// Create an empty store with no session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers of the open session, in insertion order.
    pub async fn peers(&self) -> Vec<String> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.peers.as_slice().to_vec())
            .unwrap_or_default()
    }

    /// Listen address of the open session, `None` without a session or for
    /// a client session.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.listen_addr)
    }

    async fn persist(&self) -> StoreResult<()> {
        let path = match self.inner.session.read().await.as_ref() {
            Some(SessionState {
                snapshot: Some(path),
                ..
            }) => path.clone(),
            _ => return Ok(()),
        };

        let _guard = self.inner.persist_lock.lock().await;
        let snapshot = GraphSnapshot {
            version: SNAPSHOT_VERSION,
            records: self.inner.records.read().await.clone(),
        };

        persist::save_json(&path, &snapshot)
            .await
            .map_err(|e| StoreError::Persist(e.to_string()))
    }

    async fn handle_connection(&self, stream: TcpStream) -> StoreResult<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let reply = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => Reply::error(format!("bad request: {}", e)),
            };

            let mut bytes = serde_json::to_vec(&reply)?;
            bytes.push(b'\n');
            writer.write_all(&bytes).await?;
        }

        Ok(())
    }

    async fn handle_request(&self, request: Request) -> Reply {
        match request {
            Request::Get { path } => match self.get(&path).await {
                Ok(record) => Reply {
                    record,
                    ..Reply::ok()
                },
                Err(e) => Reply::error(e.to_string()),
            },
            Request::Put { path, record } => match self.put(&path, record).await {
                Ok(()) => Reply::ok(),
                Err(e) => Reply::error(e.to_string()),
            },
            Request::Peers => Reply {
                peers: Some(self.peers().await),
                ..Reply::ok()
            },
        }
    }
}

#[async_trait]
impl GraphStore for LocalGraph {
    async fn serve(&self, listener: TcpListener, transport: Transport) -> StoreResult<()> {
        let addr = listener.local_addr()?;
        if transport.is_tls() {
            tracing::warn!(%addr, "LocalGraph does not terminate TLS, serving plaintext");
        }
        tracing::info!(%addr, "Serving graph requests");

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| StoreError::Listener(e.to_string()))?;

            let graph = self.clone();
            tokio::spawn(async move {
                if let Err(e) = graph.handle_connection(stream).await {
                    tracing::debug!(%peer, error = %e, "Graph connection closed with error");
                }
            });
        }
    }

    async fn open_session(&self, session: Session) -> StoreResult<()> {
        let snapshot = session
            .storage_path
            .as_ref()
            .map(|dir| dir.join(SNAPSHOT_FILE));

        if let Some(path) = &snapshot {
            let loaded: Option<GraphSnapshot> = persist::load_json(path)
                .await
                .map_err(|e| StoreError::Persist(e.to_string()))?;
            if let Some(loaded) = loaded {
                let mut records = self.inner.records.write().await;
                for (key, value) in loaded.records {
                    records.entry(key).or_insert(value);
                }
                tracing::info!(count = records.len(), path = ?path, "Loaded graph snapshot");
            }
        }

        let peers: PeerSet = session.peers.into_iter().collect();
        tracing::info!(
            addr = ?session.listen_addr,
            peers = peers.len(),
            "Graph session opened"
        );

        *self.inner.session.write().await = Some(SessionState {
            listen_addr: session.listen_addr,
            peers,
            snapshot,
        });

        Ok(())
    }

    async fn connect(&self, peer: &str) -> StoreResult<()> {
        let mut session = self.inner.session.write().await;
        let state = session.as_mut().ok_or(StoreError::NoSession)?;
        if state.peers.insert(peer) {
            tracing::debug!(peer, "Graph session peer added");
        }
        Ok(())
    }

    async fn put(&self, path: &str, record: Value) -> StoreResult<()> {
        {
            let mut records = self.inner.records.write().await;
            match records.entry(path.to_string()) {
                Entry::Occupied(mut slot) => match (slot.get_mut(), record) {
                    (Value::Object(existing), Value::Object(fields)) => existing.extend(fields),
                    (current, record) => *current = record,
                },
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }

        self.persist().await
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        Ok(self.inner.records.read().await.get(path).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn session(storage_path: Option<PathBuf>) -> Session {
        Session {
            listen_addr: Some("127.0.0.1:8765".parse().unwrap()),
            peers: vec!["a:1".to_string()],
            storage_path,
        }
    }

    #[tokio::test]
    async fn test_put_merges_objects() {
        let graph = LocalGraph::new();
        graph
            .put("air/nodes/n1", json!({ "name": "n1", "port": 8765 }))
            .await
            .unwrap();
        graph.put("air/nodes/n1", json!({ "alive": 42 })).await.unwrap();

        let record = graph.get("air/nodes/n1").await.unwrap().unwrap();
        assert_eq!(record["name"], "n1");
        assert_eq!(record["alive"], 42);
        assert!(graph.get("air/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_requires_session() {
        let graph = LocalGraph::new();
        assert!(matches!(graph.connect("b:2").await, Err(StoreError::NoSession)));

        graph.open_session(session(None)).await.unwrap();
        graph.connect("b:2").await.unwrap();
        graph.connect("a:1").await.unwrap();
        assert_eq!(graph.peers().await, vec!["a:1", "b:2"]);
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();

        let graph = LocalGraph::new();
        graph
            .open_session(session(Some(dir.path().to_path_buf())))
            .await
            .unwrap();
        graph.put("air/ddns", json!({ "host": "x" })).await.unwrap();
        assert!(dir.path().join(SNAPSHOT_FILE).exists());

        let reopened = LocalGraph::new();
        reopened
            .open_session(session(Some(dir.path().to_path_buf())))
            .await
            .unwrap();
        assert_eq!(reopened.get("air/ddns").await.unwrap().unwrap()["host"], "x");
    }

    #[tokio::test]
    async fn test_serve_line_protocol() {
        let graph = LocalGraph::new();
        graph.open_session(session(None)).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = graph.clone();
        let handle = tokio::spawn(async move { server.serve(listener, Transport::Plain).await });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"op\":\"put\",\"path\":\"k\",\"record\":{\"v\":1}}\n")
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["ok"], true);

        writer.write_all(b"{\"op\":\"get\",\"path\":\"k\"}\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["record"]["v"], 1);

        writer.write_all(b"{\"op\":\"peers\"}\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["peers"], json!(["a:1"]));

        writer.write_all(b"garbage\n").await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["ok"], false);

        handle.abort();
    }
}
