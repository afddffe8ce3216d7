//! Node identity publication.
//!
//! The registry writes the node's identity record into the shared graph once
//! at startup and then keeps it fresh with three recurring jobs: a liveness
//! heartbeat, DDNS record publication and public IP change detection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::clock::now_millis;
use crate::error::{P2pError, P2pResult};
use crate::persist;
use crate::scheduler::Scheduler;
use crate::store::GraphStore;

/// Public IP lookup service.
pub const DEFAULT_IP_SERVICE: &str = "https://api.ipify.org?format=json";

/// Liveness heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// DDNS publication period.
pub const DDNS_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Public IP refresh period.
pub const IP_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Graph path of the shared DDNS record.
pub const DDNS_PATH: &str = "air/ddns";

/// Called after every successful heartbeat.
pub type HeartbeatHook = Arc<dyn Fn() + Send + Sync>;

/// The node's identity as published at `air/nodes/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentityRecord {
    pub name: String,
    pub domain: String,
    #[serde(rename = "hasTLS")]
    pub has_tls: bool,
    #[serde(rename = "hasPlainHTTP")]
    pub has_plain_http: bool,
    pub port: u16,
    pub peers: Vec<String>,
    /// Startup time, ms since the epoch.
    pub since: u64,
    /// Last heartbeat, ms since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<u64>,
    /// Last published public IP.
    #[serde(rename = "newIP", default, skip_serializing_if = "Option::is_none")]
    pub new_ip: Option<String>,
}

impl NodeIdentityRecord {
    /// Identity of a node starting now.
    pub fn new(name: impl Into<String>, domain: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            has_tls: false,
            has_plain_http: true,
            port,
            peers: Vec::new(),
            since: now_millis(),
            alive: None,
            new_ip: None,
        }
    }

    /// Mark the node as serving over TLS instead of plain HTTP.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.has_tls = tls;
        self.has_plain_http = !tls;
        self
    }

    /// Mark the node as a client that serves nothing.
    pub fn as_client(mut self) -> Self {
        self.has_tls = false;
        self.has_plain_http = false;
        self
    }

    /// Set the advertised peers.
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }
}

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Node name, the last segment of the identity path.
    pub name: String,
    /// Optional `ddns.json` to republish.
    pub ddns_file: Option<PathBuf>,
    /// Public IP service URL. `None` disables IP refresh.
    pub ip_service: Option<String>,
    /// Bound on every outbound HTTP request.
    pub http_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub ddns_interval: Duration,
    pub ip_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            ddns_file: None,
            ip_service: Some(DEFAULT_IP_SERVICE.to_string()),
            http_timeout: Duration::from_millis(crate::config::DEFAULT_PEER_TIMEOUT_MS),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            ddns_interval: DDNS_INTERVAL,
            ip_interval: IP_REFRESH_INTERVAL,
        }
    }
}

impl RegistryConfig {
    /// Settings for the node called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the DDNS file.
    pub fn with_ddns_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ddns_file = Some(path.into());
        self
    }

    /// Set or disable the public IP service.
    pub fn with_ip_service(mut self, url: Option<String>) -> Self {
        self.ip_service = url;
        self
    }

    /// Set the HTTP timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct IpReply {
    ip: String,
}

/// Publishes and refreshes the node identity.
pub struct PeerRegistry {
    store: Arc<dyn GraphStore>,
    config: RegistryConfig,
    http: reqwest::Client,
    last_ip: Mutex<Option<String>>,
    last_port: Mutex<Option<u16>>,
    heartbeat_hook: Option<HeartbeatHook>,
}

impl PeerRegistry {
    /// Create a registry writing into `store`.
    pub fn new(store: Arc<dyn GraphStore>, config: RegistryConfig) -> P2pResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            store,
            config,
            http,
            last_ip: Mutex::new(None),
            last_port: Mutex::new(None),
            heartbeat_hook: None,
        })
    }

    /// Run `hook` after every successful heartbeat.
    pub fn with_heartbeat_hook(mut self, hook: HeartbeatHook) -> Self {
        self.heartbeat_hook = Some(hook);
        self
    }

    /// Graph path of this node's identity record.
    pub fn node_path(&self) -> String {
        format!("air/nodes/{}", self.config.name)
    }

    /// Publish `identity`, then start the heartbeat, DDNS and IP jobs.
    ///
    /// A failed publish is a startup error and starts nothing.
    pub async fn register(
        self: &Arc<Self>,
        identity: NodeIdentityRecord,
        scheduler: &Scheduler,
    ) -> P2pResult<()> {
        let path = self.node_path();
        self.put(&path, serde_json::to_value(&identity)?).await?;
        *self.last_port.lock().await = Some(identity.port);
        tracing::info!(path = %path, port = identity.port, tls = identity.has_tls, "Node registered");

        let registry = self.clone();
        scheduler.every("heartbeat", self.config.heartbeat_interval, move || {
            let registry = registry.clone();
            async move {
                if let Err(e) = registry.heartbeat().await {
                    tracing::warn!(error = %e, "Heartbeat failed");
                }
            }
        });

        let registry = self.clone();
        scheduler.every("ddns refresh", self.config.ddns_interval, move || {
            let registry = registry.clone();
            async move {
                if let Err(e) = registry.ddns_refresh().await {
                    tracing::warn!(error = %e, "DDNS refresh failed");
                }
            }
        });

        if self.config.ip_service.is_some() {
            let registry = self.clone();
            scheduler.every("ip refresh", self.config.ip_interval, move || {
                let registry = registry.clone();
                async move {
                    if let Err(e) = registry.ip_refresh().await {
                        tracing::warn!(error = %e, "IP refresh failed");
                    }
                }
            });
        }

        Ok(())
    }

    /// Republish `port` whenever the listener comes up on a new one.
    pub fn track_port(
        self: &Arc<Self>,
        mut ports: mpsc::UnboundedReceiver<u16>,
        scheduler: &Scheduler,
    ) {
        let registry = self.clone();
        scheduler.spawn("port tracking", move |mut shutdown| async move {
            loop {
                let port = tokio::select! {
                    _ = shutdown.recv() => break,
                    port = ports.recv() => match port {
                        Some(port) => port,
                        None => break,
                    },
                };

                if let Err(e) = registry.publish_port(port).await {
                    tracing::warn!(port, error = %e, "Failed to republish port");
                }
            }
        });
    }

    /// Publish `port` unless it equals the last published value. Returns
    /// whether anything was written.
    pub async fn publish_port(&self, port: u16) -> P2pResult<bool> {
        let mut last = self.last_port.lock().await;
        if *last == Some(port) {
            return Ok(false);
        }

        self.put(&self.node_path(), json!({ "port": port })).await?;
        tracing::info!(port, previous = ?*last, "Advertised port updated");
        *last = Some(port);

        Ok(true)
    }

    /// Publish the liveness timestamp. Returns the timestamp written.
    pub async fn heartbeat(&self) -> P2pResult<u64> {
        let alive = now_millis();
        self.put(&self.node_path(), json!({ "alive": alive })).await?;
        tracing::trace!(alive, "Heartbeat");

        if let Some(hook) = &self.heartbeat_hook {
            hook();
        }

        Ok(alive)
    }

    /// Republish the DDNS file at `air/ddns`. Returns whether anything was
    /// published; a missing or empty file is not an error.
    pub async fn ddns_refresh(&self) -> P2pResult<bool> {
        let Some(path) = &self.config.ddns_file else {
            return Ok(false);
        };

        match persist::load_json::<Value>(path).await? {
            Some(Value::Object(fields)) if !fields.is_empty() => {
                self.put(DDNS_PATH, Value::Object(fields)).await?;
                tracing::debug!(path = ?path, "DDNS record published");
                Ok(true)
            }
            Some(_) => {
                tracing::debug!(path = ?path, "DDNS file is not a non-empty object, skipping");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Look up the public IP and publish it when it changed. Returns the new
    /// IP when one was published.
    pub async fn ip_refresh(&self) -> P2pResult<Option<String>> {
        let Some(url) = &self.config.ip_service else {
            return Ok(None);
        };

        let ip = self.fetch_public_ip(url).await?;
        if self.publish_ip(&ip).await? {
            Ok(Some(ip))
        } else {
            Ok(None)
        }
    }

    /// Query `url` for `{"ip": "..."}`.
    pub async fn fetch_public_ip(&self, url: &str) -> P2pResult<String> {
        let reply: IpReply = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply.ip)
    }

    /// Publish `ip` as `newIP` unless it equals the last published value.
    pub async fn publish_ip(&self, ip: &str) -> P2pResult<bool> {
        let mut last = self.last_ip.lock().await;
        if last.as_deref() == Some(ip) {
            return Ok(false);
        }

        self.put(
            &self.node_path(),
            json!({ "newIP": ip, "timestamp": now_millis() }),
        )
        .await?;
        tracing::info!(ip, previous = ?*last, "Public IP changed");
        *last = Some(ip.to_string());

        Ok(true)
    }

    async fn put(&self, path: &str, record: Value) -> P2pResult<()> {
        self.store
            .put(path, record)
            .await
            .map_err(|e| P2pError::Publish {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalGraph, Session, StoreError, StoreResult, Transport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct RejectingStore;

    #[async_trait]
    impl GraphStore for RejectingStore {
        async fn serve(&self, _listener: TcpListener, _transport: Transport) -> StoreResult<()> {
            Ok(())
        }

        async fn open_session(&self, _session: Session) -> StoreResult<()> {
            Ok(())
        }

        async fn connect(&self, _peer: &str) -> StoreResult<()> {
            Ok(())
        }

        async fn put(&self, _path: &str, _record: Value) -> StoreResult<()> {
            Err(StoreError::NoSession)
        }

        async fn get(&self, _path: &str) -> StoreResult<Option<Value>> {
            Ok(None)
        }
    }

    fn offline(name: &str) -> RegistryConfig {
        RegistryConfig::new(name).with_ip_service(None)
    }

    #[test]
    fn test_identity_wire_names() {
        let record = NodeIdentityRecord::new("n1", "example.org", 8765).with_tls(true);
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["hasTLS"], true);
        assert_eq!(value["hasPlainHTTP"], false);
        assert!(value.get("alive").is_none());
        assert!(value.get("newIP").is_none());
    }

    #[tokio::test]
    async fn test_register_publishes_and_schedules() {
        let graph = Arc::new(LocalGraph::new());
        let registry = Arc::new(PeerRegistry::new(graph.clone(), offline("n1")).unwrap());
        let scheduler = Scheduler::new();

        let identity = NodeIdentityRecord::new("n1", "localhost", 8765)
            .with_peers(vec!["a:1".to_string()]);
        registry.register(identity, &scheduler).await.unwrap();

        let record = graph.get("air/nodes/n1").await.unwrap().unwrap();
        assert_eq!(record["port"], 8765);
        assert_eq!(record["peers"][0], "a:1");

        let mut tasks = scheduler.task_names();
        tasks.sort();
        assert_eq!(tasks, vec!["ddns refresh", "heartbeat"]);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_failure_starts_nothing() {
        let registry = Arc::new(PeerRegistry::new(Arc::new(RejectingStore), offline("n1")).unwrap());
        let scheduler = Scheduler::new();

        let result = registry
            .register(NodeIdentityRecord::new("n1", "localhost", 8765), &scheduler)
            .await;
        assert!(matches!(result, Err(P2pError::Publish { .. })));
        assert!(scheduler.task_names().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_merges_and_runs_hook() {
        let graph = Arc::new(LocalGraph::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = PeerRegistry::new(graph.clone(), offline("n1"))
            .unwrap()
            .with_heartbeat_hook(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        graph
            .put("air/nodes/n1", serde_json::to_value(NodeIdentityRecord::new("n1", "d", 1)).unwrap())
            .await
            .unwrap();
        let alive = registry.heartbeat().await.unwrap();

        let record = graph.get("air/nodes/n1").await.unwrap().unwrap();
        assert_eq!(record["alive"], alive);
        assert_eq!(record["name"], "n1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ddns_refresh() {
        let dir = tempdir().unwrap();
        let ddns = dir.path().join("ddns.json");
        let graph = Arc::new(LocalGraph::new());
        let registry =
            PeerRegistry::new(graph.clone(), offline("n1").with_ddns_file(&ddns)).unwrap();

        // Missing file
        assert!(!registry.ddns_refresh().await.unwrap());

        std::fs::write(&ddns, "{}").unwrap();
        assert!(!registry.ddns_refresh().await.unwrap());

        std::fs::write(&ddns, r#"{"host":"n1.example.org"}"#).unwrap();
        assert!(registry.ddns_refresh().await.unwrap());
        assert_eq!(graph.get(DDNS_PATH).await.unwrap().unwrap()["host"], "n1.example.org");
    }

    #[tokio::test]
    async fn test_publish_ip_only_on_change() {
        let graph = Arc::new(LocalGraph::new());
        let registry = PeerRegistry::new(graph.clone(), offline("n1")).unwrap();

        assert!(registry.publish_ip("203.0.113.7").await.unwrap());
        assert!(!registry.publish_ip("203.0.113.7").await.unwrap());
        assert!(registry.publish_ip("203.0.113.8").await.unwrap());

        let record = graph.get("air/nodes/n1").await.unwrap().unwrap();
        assert_eq!(record["newIP"], "203.0.113.8");
    }

    #[test]
    fn test_client_identity_serves_nothing() {
        let record = NodeIdentityRecord::new("n1", "d", 8765).with_tls(true).as_client();
        assert!(!record.has_tls);
        assert!(!record.has_plain_http);
    }

    #[tokio::test]
    async fn test_port_changes_are_republished() {
        let graph = Arc::new(LocalGraph::new());
        let registry = Arc::new(PeerRegistry::new(graph.clone(), offline("n1")).unwrap());
        let scheduler = Scheduler::new();
        registry
            .register(NodeIdentityRecord::new("n1", "d", 8765), &scheduler)
            .await
            .unwrap();

        // Same port as registered
        assert!(!registry.publish_port(8765).await.unwrap());

        let (ports_tx, ports_rx) = mpsc::unbounded_channel();
        registry.track_port(ports_rx, &scheduler);
        ports_tx.send(8766).unwrap();

        let mut port = Value::Null;
        for _ in 0..50 {
            port = graph.get("air/nodes/n1").await.unwrap().unwrap()["port"].clone();
            if port == 8766 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(port, 8766);
        assert_eq!(
            graph.get("air/nodes/n1").await.unwrap().unwrap()["name"],
            "n1"
        );

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_ip_refresh_from_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = r#"{"ip":"198.51.100.4"}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let graph = Arc::new(LocalGraph::new());
        let config = RegistryConfig::new("n1").with_ip_service(Some(format!("http://{}/", addr)));
        let registry = PeerRegistry::new(graph.clone(), config).unwrap();

        assert_eq!(
            registry.ip_refresh().await.unwrap().as_deref(),
            Some("198.51.100.4")
        );
        assert_eq!(registry.ip_refresh().await.unwrap(), None);

        server.abort();
    }
}
