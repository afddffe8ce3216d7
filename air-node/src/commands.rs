//! Operations behind the CLI subcommands.
//!
//! Each operation returns a value for `main` to print; none of them write to
//! stdout themselves.

use std::sync::Arc;

use serde::Serialize;

use air_p2p::{
    DiscoveryReport, DiscoveryStatus, GraphStore, LocalGraph, NodeSettings, PeerDiscoveryEngine,
    Scheduler, Session,
};

use crate::config::{Config, ConfigHandle, ConfigStore};
use crate::env::EnvVars;
use crate::lock::{LockManager, LockState};
use crate::node::{Node, NodeError, RunningNode};
use crate::paths::AirPaths;
use crate::shutdown::wait_for_shutdown_signal;

/// Where the commands find their files and overrides.
#[derive(Debug, Clone)]
pub struct Context {
    pub paths: AirPaths,
    pub env: EnvVars,
}

impl Context {
    pub fn new(paths: AirPaths, env: EnvVars) -> Self {
        Self { paths, env }
    }

    fn config_store(&self) -> ConfigStore {
        ConfigStore::new(self.paths.config_file(), self.env.clone())
    }

    fn lock_manager(&self, port: u16) -> LockManager {
        LockManager::new(&self.paths, port, String::new())
    }
}

/// Lock summary for `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

impl From<LockState> for LockStatus {
    fn from(state: LockState) -> Self {
        let (label, record) = match state {
            LockState::Unlocked => ("unlocked", None),
            LockState::Locked(record) => ("running", Some(record)),
            LockState::Stale(record) => ("stale", Some(record)),
        };

        Self {
            state: label,
            pid: record.as_ref().map(|r| r.pid),
            owner: record.as_ref().map(|r| r.owner.clone()),
            port: record.as_ref().map(|r| r.port),
            started_at: record.as_ref().map(|r| r.started_at),
        }
    }
}

/// Output of `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub name: String,
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub domain: String,
    pub tls: bool,
    pub peers: usize,
    pub config_file: String,
    pub lock: LockStatus,
}

/// Start the node as a server and run it until a signal arrives.
pub async fn start(ctx: &Context) -> Result<(), NodeError> {
    run(node(ctx).start().await?).await
}

/// Join `peers` as a client and run until a signal arrives. No peers means
/// the local server.
pub async fn connect(ctx: &Context, peers: Vec<String>) -> Result<(), NodeError> {
    run(node(ctx).connect(peers).await?).await
}

/// Start as a server, or as a client of the local server when the server
/// slot is taken.
pub async fn auto(ctx: &Context) -> Result<(), NodeError> {
    run(node(ctx).auto().await?).await
}

fn node(ctx: &Context) -> Node {
    Node::new(ctx.paths.clone(), ctx.env.clone())
}

async fn run(node: RunningNode) -> Result<(), NodeError> {
    match node.local_addr() {
        Some(addr) => tracing::info!(%addr, mode = ?node.mode(), "Press Ctrl+C to stop"),
        None => tracing::info!(mode = ?node.mode(), "Press Ctrl+C to stop"),
    }
    node.run_until_signal().await
}

/// Configuration and lock summary.
pub async fn status(ctx: &Context) -> StatusReport {
    let config = ctx.config_store().load().await;
    let active = config.active();
    let lock = ctx.lock_manager(active.port).inspect();

    StatusReport {
        name: config.name.clone(),
        environment: config.environment.clone(),
        host: active.host.clone(),
        port: active.port,
        domain: active.domain.clone(),
        tls: config.tls_material().is_some_and(|t| t.is_available()),
        peers: active.peers.len(),
        config_file: ctx.paths.config_file().display().to_string(),
        lock: lock.into(),
    }
}

/// The effective configuration.
pub async fn config_show(ctx: &Context) -> Config {
    ctx.config_store().load().await
}

/// Overwrite the configuration file with defaults.
pub async fn config_reset(ctx: &Context) -> anyhow::Result<Config> {
    Ok(ctx.config_store().reset().await?)
}

/// Discovery settings and known peers.
pub async fn discovery_status(ctx: &Context) -> DiscoveryStatus {
    let (engine, _) = offline_engine(ctx).await;
    engine.status().await
}

/// Run discovery without a listener. Continuous strategies keep running
/// until Ctrl+C.
pub async fn discovery_start(ctx: &Context) -> DiscoveryReport {
    let (engine, _) = offline_engine(ctx).await;
    let scheduler = Scheduler::new();

    let report = engine.start(&scheduler).await;
    if !scheduler.task_names().is_empty() {
        tracing::info!(tasks = ?scheduler.task_names(), "Discovery running, press Ctrl+C to stop");
        wait_for_shutdown_signal().await;
    }
    scheduler.shutdown().await;

    report
}

/// Add one peer to the configuration. Returns whether it was new.
///
/// A running node merges the peer into its own configuration on its next
/// save, and its session picks it up on the next start.
pub async fn discovery_add(ctx: &Context, addr: &str) -> anyhow::Result<bool> {
    let (engine, _) = offline_engine(ctx).await;
    Ok(engine.add_peer(addr).await?)
}

/// Remove the lock and PID files regardless of owner.
pub fn lock_clean(ctx: &Context) -> anyhow::Result<LockStatus> {
    let lock = ctx.lock_manager(0);
    let before = lock.inspect();
    lock.force_cleanup()?;
    Ok(before.into())
}

/// A discovery engine over the persisted configuration, with a store that
/// only records peers.
async fn offline_engine(ctx: &Context) -> (Arc<PeerDiscoveryEngine>, ConfigHandle) {
    let store = ctx.config_store();
    let config = store.load().await;
    let active = config.active().clone();
    let handle = ConfigHandle::new(store, config.clone());

    let graph = Arc::new(LocalGraph::new());
    let session = Session {
        listen_addr: None,
        peers: handle.peers().await.into_vec(),
        storage_path: None,
    };
    if let Err(e) = graph.open_session(session).await {
        tracing::debug!(error = %e, "Offline session not opened");
    }

    let engine = PeerDiscoveryEngine::new(
        active.discovery,
        Arc::new(handle.clone()),
        graph,
        config.name.as_str(),
    )
    .with_manual_file(ctx.paths.manual_peers_file());

    (Arc::new(engine), handle)
}
