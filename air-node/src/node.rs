//! Node orchestrator.
//!
//! Runs the startup sequence in a fixed order, each phase returning a
//! `Result`:
//!
//! ```text
//! load config -> acquire lock -> start listener -> register identity -> start discovery
//! ```
//!
//! A failure after the lock was taken releases it before returning.
//!
//! [`Node::connect`] joins existing peers as a client instead, and
//! [`Node::auto`] picks between the two.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use air_p2p::registry::DEFAULT_IP_SERVICE;
use air_p2p::{
    DiscoveryReport, GraphStore, LocalGraph, NodeIdentityRecord, NodeSettings, P2pError,
    P2pResult, PeerDiscoveryEngine, PeerRegistry, RegistryConfig, RestartPolicy, Scheduler,
    ServerSupervisor, Session, SupervisorEvent, Transport,
};

use crate::config::{Config, ConfigHandle, ConfigStore};
use crate::env::EnvVars;
use crate::lock::{LockError, LockManager};
use crate::paths::AirPaths;
use crate::shutdown::{shutdown_channel, wait_for_shutdown_signal, ShutdownRx, ShutdownTx};

/// How long `auto` waits for a local server to accept a connection.
pub const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Fatal node errors. Each maps to exit code 1.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A live instance holds the singleton lock.
    #[error("Another Air instance is already running (lock {})", .path.display())]
    LockConflict { path: PathBuf },

    /// The listener could not be kept alive.
    #[error("Listener gave up after {max} restart attempts")]
    RestartLimitExceeded { max: u32 },

    /// Any other startup failure.
    #[error("Startup failed: {0}")]
    Startup(String),
}

impl From<LockError> for NodeError {
    fn from(err: LockError) -> Self {
        NodeError::Startup(err.to_string())
    }
}

impl From<P2pError> for NodeError {
    fn from(err: P2pError) -> Self {
        match err {
            P2pError::RestartLimitExceeded { max } => NodeError::RestartLimitExceeded { max },
            other => NodeError::Startup(other.to_string()),
        }
    }
}

/// How a started node takes part in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Holds the singleton lock and serves a listener.
    Server,
    /// Joins existing peers without a listener or lock.
    Client,
}

/// A node that has not started yet.
#[derive(Clone)]
pub struct Node {
    paths: AirPaths,
    env: EnvVars,
    store: Arc<dyn GraphStore>,
    policy: RestartPolicy,
    ip_service: Option<String>,
}

impl Node {
    /// Node using `paths` for its files and `env` for overrides.
    pub fn new(paths: AirPaths, env: EnvVars) -> Self {
        Self {
            paths,
            env,
            store: Arc::new(LocalGraph::new()),
            policy: RestartPolicy::default(),
            ip_service: Some(DEFAULT_IP_SERVICE.to_string()),
        }
    }

    /// Use another graph store.
    pub fn with_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = store;
        self
    }

    /// Set the listener restart policy.
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set or disable the public IP service.
    pub fn with_ip_service(mut self, url: Option<String>) -> Self {
        self.ip_service = url;
        self
    }

    /// Run the server startup sequence.
    pub async fn start(self) -> Result<RunningNode, NodeError> {
        let config_store = ConfigStore::new(self.paths.config_file(), self.env.clone());
        let config = config_store.load().await;
        let name = config.name.clone();
        let active = config.active().clone();
        tracing::info!(
            name = %name,
            environment = %config.environment,
            host = %active.host,
            port = active.port,
            "Configuration loaded"
        );

        let location = std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let lock = Arc::new(
            LockManager::new(&self.paths, active.port, location)
                .with_bypass(LockManager::bypass_requested(&self.env)),
        );
        if !lock.acquire(&name)? {
            return Err(NodeError::LockConflict {
                path: lock.lock_file().to_path_buf(),
            });
        }

        let settings = ConfigHandle::new(config_store, config.clone());
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let scheduler = Scheduler::new();

        let started = self
            .start_services(&settings, &config, &lock, &scheduler, &shutdown_tx)
            .await;

        match started {
            Ok((local_addr, supervisor, discovery, report)) => {
                tracing::info!(
                    %local_addr,
                    manual = report.manual,
                    dht = report.dht,
                    multicast = report.multicast,
                    dns = report.dns,
                    "Air node started"
                );
                Ok(RunningNode {
                    mode: NodeMode::Server,
                    local_addr: Some(local_addr),
                    owner: name,
                    lock: Some(lock),
                    settings,
                    scheduler,
                    discovery: Some(discovery),
                    supervisor: Some(supervisor),
                    shutdown_tx,
                    shutdown_rx,
                })
            }
            Err(e) => {
                let _ = shutdown_tx.send(());
                scheduler.shutdown().await;
                if let Err(release) = lock.release(&name) {
                    tracing::warn!(error = %release, "Failed to release lock");
                }
                Err(e.into())
            }
        }
    }

    /// Join `peers` as a client: no listener, no singleton lock, no
    /// discovery. The identity record is still published. An empty list
    /// means the local server on the configured port.
    pub async fn connect(self, peers: Vec<String>) -> Result<RunningNode, NodeError> {
        let config_store = ConfigStore::new(self.paths.config_file(), self.env.clone());
        let config = config_store.load().await;
        let peers = if peers.is_empty() {
            vec![local_server(config.active().port)]
        } else {
            peers
        };
        tracing::info!(name = %config.name, ?peers, "Connecting as client");

        let scheduler = Scheduler::new();
        if let Err(e) = self.start_client(&config, peers, &scheduler).await {
            scheduler.shutdown().await;
            return Err(e.into());
        }
        tracing::info!("Connected as client");

        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        Ok(RunningNode {
            mode: NodeMode::Client,
            local_addr: None,
            owner: config.name.clone(),
            lock: None,
            settings: ConfigHandle::new(config_store, config),
            scheduler,
            discovery: None,
            supervisor: None,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Start as a server when possible, otherwise join the local server as a
    /// client.
    pub async fn auto(self) -> Result<RunningNode, NodeError> {
        let fallback = self.clone();
        let error = match self.start().await {
            Ok(node) => return Ok(node),
            Err(e) => e,
        };
        tracing::info!(error = %error, "Cannot start as server, trying client mode");

        let peer = local_server(fallback.local_server_port().await);
        if is_reachable(&peer).await {
            tracing::info!(peer = %peer, "Local server found");
        } else {
            tracing::warn!(peer = %peer, "No local server reachable, connecting anyway");
        }

        fallback.connect(vec![peer]).await
    }

    /// Port of the running local server: the lock holder's, else the
    /// configured one.
    async fn local_server_port(&self) -> u16 {
        let lock = LockManager::new(&self.paths, 0, String::new());
        match lock.read() {
            Some(record) => record.port,
            None => {
                ConfigStore::new(self.paths.config_file(), self.env.clone())
                    .load()
                    .await
                    .active()
                    .port
            }
        }
    }

    fn registry_config(&self, config: &Config) -> RegistryConfig {
        RegistryConfig::new(config.name.as_str())
            .with_ddns_file(self.paths.ddns_file())
            .with_ip_service(self.ip_service.clone())
            .with_http_timeout(config.active().discovery.timeout())
    }

    async fn start_client(
        &self,
        config: &Config,
        peers: Vec<String>,
        scheduler: &Scheduler,
    ) -> P2pResult<()> {
        let active = config.active();
        self.store
            .open_session(Session {
                listen_addr: None,
                peers: peers.clone(),
                storage_path: None,
            })
            .await?;

        let registry = Arc::new(PeerRegistry::new(
            self.store.clone(),
            self.registry_config(config),
        )?);
        let identity = NodeIdentityRecord::new(
            config.name.as_str(),
            active.domain.as_str(),
            active.port,
        )
        .as_client()
        .with_peers(peers);
        registry.register(identity, scheduler).await
    }

    async fn start_services(
        &self,
        settings: &ConfigHandle,
        config: &Config,
        lock: &Arc<LockManager>,
        scheduler: &Scheduler,
        shutdown_tx: &ShutdownTx,
    ) -> P2pResult<(
        SocketAddr,
        JoinHandle<P2pResult<()>>,
        Arc<PeerDiscoveryEngine>,
        DiscoveryReport,
    )> {
        let node_settings: Arc<dyn NodeSettings> = Arc::new(settings.clone());
        let active = config.active();
        let tls = config.tls_material();
        let serving_tls = Transport::select(tls.as_ref()).is_tls();

        let (ports_tx, ports_rx) = mpsc::unbounded_channel();
        let mut supervisor = ServerSupervisor::new(self.store.clone(), node_settings.clone())
            .with_tls(tls)
            .with_policy(self.policy)
            .with_observer(Arc::new(move |event: &SupervisorEvent| {
                if let SupervisorEvent::Listening { addr, .. } = event {
                    let _ = ports_tx.send(addr.port());
                }
            }));
        let local_addr = supervisor.start().await?;

        self.store
            .open_session(Session {
                listen_addr: Some(local_addr),
                peers: node_settings.peers().await.into_vec(),
                storage_path: Some(self.paths.shared_dir()),
            })
            .await?;
        let supervisor = tokio::spawn(supervisor.run(shutdown_tx.subscribe()));

        let refresher = lock.clone();
        let registry = PeerRegistry::new(self.store.clone(), self.registry_config(config))?
            .with_heartbeat_hook(Arc::new(move || {
                if let Err(e) = refresher.refresh() {
                    tracing::warn!(error = %e, "Lock refresh failed");
                }
            }));
        let registry = Arc::new(registry);

        let identity = NodeIdentityRecord::new(
            config.name.as_str(),
            active.domain.as_str(),
            local_addr.port(),
        )
        .with_tls(serving_tls)
        .with_peers(node_settings.peers().await.into_vec());
        if let Err(e) = registry.register(identity, scheduler).await {
            supervisor.abort();
            return Err(e);
        }
        registry.track_port(ports_rx, scheduler);

        let discovery = Arc::new(
            PeerDiscoveryEngine::new(
                active.discovery.clone(),
                node_settings,
                self.store.clone(),
                config.name.as_str(),
            )
            .with_manual_file(self.paths.manual_peers_file()),
        );
        let report = discovery.start(scheduler).await;

        Ok((local_addr, supervisor, discovery, report))
    }
}

/// A started node.
pub struct RunningNode {
    mode: NodeMode,
    local_addr: Option<SocketAddr>,
    owner: String,
    lock: Option<Arc<LockManager>>,
    settings: ConfigHandle,
    scheduler: Scheduler,
    discovery: Option<Arc<PeerDiscoveryEngine>>,
    supervisor: Option<JoinHandle<P2pResult<()>>>,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
}

impl RunningNode {
    /// Whether this node serves or only connects.
    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    /// Address the listener is bound to. `None` for a client.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Live configuration.
    pub fn settings(&self) -> &ConfigHandle {
        &self.settings
    }

    /// Discovery engine of a server node.
    pub fn discovery(&self) -> Option<&Arc<PeerDiscoveryEngine>> {
        self.discovery.as_ref()
    }

    /// Sender that stops the node when fired.
    pub fn shutdown_handle(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Names of the running background tasks.
    pub fn tasks(&self) -> Vec<&'static str> {
        self.scheduler.task_names()
    }

    /// Run until SIGINT/SIGTERM or a fatal listener failure.
    pub async fn run_until_signal(self) -> Result<(), NodeError> {
        let trigger = self.shutdown_tx.clone();
        let signals = tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = trigger.send(());
        });

        let result = self.wait().await;
        signals.abort();
        result
    }

    /// Request shutdown and wait for it to finish.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        let _ = self.shutdown_tx.send(());
        self.wait().await
    }

    /// Wait for the listener task to end (or, for a client, the shutdown
    /// request), then stop everything else and release the lock.
    pub async fn wait(self) -> Result<(), NodeError> {
        let RunningNode {
            owner,
            lock,
            scheduler,
            supervisor,
            shutdown_tx,
            mut shutdown_rx,
            ..
        } = self;

        let result = match supervisor {
            Some(task) => match task.await {
                Ok(result) => result.map_err(NodeError::from),
                Err(e) => Err(NodeError::Startup(format!("listener task failed: {}", e))),
            },
            None => {
                let _ = shutdown_rx.recv().await;
                Ok(())
            }
        };

        tracing::info!("Shutting down node...");
        let _ = shutdown_tx.send(());
        scheduler.shutdown().await;

        if let Some(lock) = lock {
            if let Err(e) = lock.release(&owner) {
                tracing::warn!(error = %e, "Failed to release lock");
            }
        }

        match &result {
            Ok(()) => tracing::info!("Node shutdown complete"),
            Err(e) => tracing::error!(error = %e, "Node stopped"),
        }
        result
    }
}

fn local_server(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

async fn is_reachable(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            NodeError::from(P2pError::RestartLimitExceeded { max: 5 }),
            NodeError::RestartLimitExceeded { max: 5 }
        ));
        assert!(matches!(
            NodeError::from(P2pError::PortInUse { port: 1 }),
            NodeError::Startup(_)
        ));
    }
}
