//! Access to the node's persisted settings.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::P2pResult;
use crate::peers::PeerSet;

/// The slice of node configuration the network core reads and mutates.
///
/// Implementations must persist every successful mutation before returning.
/// A mutation that fails to persist is kept in memory and reported as an
/// error so the caller can log it.
#[async_trait]
pub trait NodeSettings: Send + Sync {
    /// Host and port the listener should bind.
    async fn listen_addr(&self) -> (String, u16);

    /// Move the listen port up by one and persist it. Returns the new port.
    async fn bump_port(&self) -> P2pResult<u16>;

    /// Current peer set.
    async fn peers(&self) -> PeerSet;

    /// Merge `addrs` into the peer set and persist if anything changed.
    /// Returns the addresses that were not known before.
    async fn add_peers(&self, addrs: &[String]) -> P2pResult<Vec<String>>;
}

/// In-memory settings, for embedding and tests.
#[derive(Debug)]
pub struct MemorySettings {
    state: Mutex<(String, u16, PeerSet)>,
    saves: AtomicUsize,
}

impl MemorySettings {
    /// Create settings listening on `host:port` with the given peers.
    pub fn new(host: impl Into<String>, port: u16, peers: PeerSet) -> Self {
        Self {
            state: Mutex::new((host.into(), port, peers)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Override the port without counting it as a save.
    pub async fn set_port(&self, port: u16) {
        self.state.lock().await.1 = port;
    }

    /// Number of times a mutation was "persisted".
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeSettings for MemorySettings {
    async fn listen_addr(&self) -> (String, u16) {
        let state = self.state.lock().await;
        (state.0.clone(), state.1)
    }

    async fn bump_port(&self) -> P2pResult<u16> {
        let mut state = self.state.lock().await;
        state.1 = state.1.saturating_add(1);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(state.1)
    }

    async fn peers(&self) -> PeerSet {
        self.state.lock().await.2.clone()
    }

    async fn add_peers(&self, addrs: &[String]) -> P2pResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let added = state.2.extend(addrs.iter().cloned());
        if !added.is_empty() {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        Ok(added)
    }
}
