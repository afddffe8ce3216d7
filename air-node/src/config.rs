//! Node configuration.
//!
//! The configuration file holds a few top-level keys plus one sub-record per
//! environment:
//!
//! ```json
//! {
//!   "name": "node-1",
//!   "environment": "production",
//!   "production": { "host": "0.0.0.0", "port": 8765, "domain": "example.org",
//!                   "peers": [], "discovery": { ... } }
//! }
//! ```
//!
//! Loading layers environment overrides over the file over the defaults with
//! a left-wins deep merge (see [`merge`]). Every mutation of a running node
//! goes through a [`ConfigHandle`], which persists inside the same critical
//! section that changed the value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use air_p2p::{persist, DiscoveryConfig, NodeSettings, P2pError, P2pResult, PeerSet, TlsMaterial};

use crate::env::EnvVars;

pub const DEFAULT_NAME: &str = "localhost";
pub const DEFAULT_ENVIRONMENT: &str = "development";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8765;
pub const DEFAULT_DOMAIN: &str = "localhost";

/// Environment whose TLS paths default to Let's Encrypt.
pub const PRODUCTION: &str = "production";

/// Keys from older releases that are dropped on load.
const LEGACY_KEYS: &[&str] = &["manager", "ip", "ddns", "godaddy", "ipSync"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but is not a usable configuration.
    #[error("Failed to parse {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    /// The configuration violates one or more rules.
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// Writing the file failed.
    #[error("Failed to save configuration: {0}")]
    Persist(#[from] P2pError),
}

/// Settings of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvConfig {
    pub host: String,
    pub port: u16,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMaterial>,
    pub peers: PeerSet,
    pub discovery: DiscoveryConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            domain: DEFAULT_DOMAIN.to_string(),
            tls: None,
            peers: PeerSet::new(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub name: String,
    pub environment: String,
    /// Per-environment records, keyed by environment name.
    #[serde(flatten)]
    pub environments: BTreeMap<String, EnvConfig>,
    /// Records of inactive environments that did not parse. Saved back as
    /// they were read.
    #[serde(flatten)]
    pub unparsed: BTreeMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_environment(DEFAULT_ENVIRONMENT)
    }
}

impl Config {
    /// Defaults with `environment` active.
    pub fn with_environment(environment: impl Into<String>) -> Self {
        let environment = environment.into();
        let mut environments = BTreeMap::new();
        environments.insert(environment.clone(), EnvConfig::default());

        Self {
            name: DEFAULT_NAME.to_string(),
            environment,
            environments,
            unparsed: BTreeMap::new(),
        }
    }

    /// Record of the active environment.
    pub fn active(&self) -> &EnvConfig {
        static FALLBACK: OnceLock<EnvConfig> = OnceLock::new();
        self.environments
            .get(&self.environment)
            .unwrap_or_else(|| FALLBACK.get_or_init(EnvConfig::default))
    }

    /// Mutable record of the active environment, created if missing.
    pub fn active_mut(&mut self) -> &mut EnvConfig {
        self.environments
            .entry(self.environment.clone())
            .or_default()
    }

    /// TLS material to serve with. Production falls back to the Let's
    /// Encrypt layout for the configured domain.
    pub fn tls_material(&self) -> Option<TlsMaterial> {
        let env = self.active();
        if let Some(tls) = &env.tls {
            return Some(tls.clone());
        }

        (self.environment == PRODUCTION && !env.domain.is_empty()).then(|| {
            let live = Path::new("/etc/letsencrypt/live").join(&env.domain);
            TlsMaterial::new(live.join("privkey.pem"), live.join("cert.pem"))
        })
    }

    /// Check the active environment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        match self.environments.get(&self.environment) {
            None => problems.push(format!("no settings for environment {:?}", self.environment)),
            Some(env) => {
                if env.port == 0 {
                    problems.push("port must be between 1 and 65535".to_string());
                }
                if env.host.trim().is_empty() {
                    problems.push("host must not be empty".to_string());
                }
                if env.tls.as_ref().is_some_and(TlsMaterial::is_partial) {
                    problems.push("TLS needs both a key and a certificate".to_string());
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Deep merge where `left` wins.
///
/// Keys present on one side only are kept. Two arrays give `left` followed by
/// the elements of `right` it does not already contain. Two objects merge
/// recursively. Any other collision keeps `left` unless it is null or an
/// empty string.
pub fn merge(left: Value, right: Value) -> Value {
    match (left, right) {
        (Value::Object(mut left), Value::Object(right)) => {
            for (key, value) in right {
                match left.get_mut(&key) {
                    Some(existing) => {
                        let current = existing.take();
                        *existing = merge(current, value);
                    }
                    None => {
                        left.insert(key, value);
                    }
                }
            }
            Value::Object(left)
        }
        (Value::Array(mut left), Value::Array(right)) => {
            for item in right {
                if !left.contains(&item) {
                    left.push(item);
                }
            }
            Value::Array(left)
        }
        (left, right) if is_empty(&left) => right,
        (left, _) => left,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Reads and writes the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    env: EnvVars,
}

impl ConfigStore {
    /// Store for the file at `path` with overrides from `env`.
    pub fn new(path: impl Into<PathBuf>, env: EnvVars) -> Self {
        Self {
            path: path.into(),
            env,
        }
    }

    /// Path of the configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load defaults < file < environment. An unreadable file is logged and
    /// ignored; validation problems are logged as warnings.
    ///
    /// Each environment record is parsed on its own. Invalid fields of the
    /// active record fall back to their defaults, and invalid records of
    /// other environments are kept verbatim.
    pub async fn load(&self) -> Config {
        let file = match self.read_file().await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring configuration file");
                Value::Object(Map::new())
            }
        };

        let environment = self.resolve_environment(&file);
        let overrides = self.overrides(&environment);
        let defaults = defaults_value(&environment);

        let fallback = merge(overrides.clone(), defaults.clone())
            .get(&environment)
            .cloned()
            .unwrap_or(Value::Null);
        let merged = merge(merge(overrides, file), defaults);
        let config = build_config(merged, &environment, fallback);

        if let Err(e) = config.validate() {
            tracing::warn!(error = %e, "Configuration problems");
        }

        tracing::debug!(
            path = %self.path.display(),
            environment = %config.environment,
            "Configuration loaded"
        );

        config
    }

    /// Write `config` atomically as pretty JSON.
    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        persist::save_json(&self.path, config).await?;
        tracing::debug!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }

    /// Replace the file with defaults for the current environment.
    pub async fn reset(&self) -> Result<Config, ConfigError> {
        let environment = self.resolve_environment(&Value::Null);
        let config = Config::with_environment(environment);
        self.save(&config).await?;
        tracing::info!(path = %self.path.display(), "Configuration reset to defaults");
        Ok(config)
    }

    /// Raw file contents with legacy and non-environment keys removed.
    async fn read_file(&self) -> Result<Value, ConfigError> {
        let value: Option<Value> =
            persist::load_json(&self.path).await.map_err(|e| ConfigError::Parse {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        let Some(value) = value else {
            return Ok(Value::Object(Map::new()));
        };
        let Value::Object(fields) = value else {
            return Err(ConfigError::Parse {
                path: self.path.clone(),
                reason: "top level is not an object".to_string(),
            });
        };

        let kept = fields
            .into_iter()
            .filter(|(key, value)| {
                if LEGACY_KEYS.contains(&key.as_str()) {
                    tracing::debug!(key = %key, "Dropping legacy configuration key");
                    return false;
                }
                matches!(key.as_str(), "name" | "environment") || value.is_object()
            })
            .collect();

        Ok(Value::Object(kept))
    }

    fn resolve_environment(&self, file: &Value) -> String {
        self.env
            .first(&["AIR_ENV", "NODE_ENV"])
            .or_else(|| file.get("environment").and_then(Value::as_str))
            .filter(|env| !env.is_empty())
            .unwrap_or(DEFAULT_ENVIRONMENT)
            .to_string()
    }

    /// Environment variable overrides as a partial configuration.
    fn overrides(&self, environment: &str) -> Value {
        let env = &self.env;
        let mut record = Map::new();

        if let Some(host) = env.get("AIR_HOST") {
            record.insert("host".into(), json!(host));
        }
        if let Some(port) = env.parse::<u16>(&["AIR_PORT", "PORT"]) {
            record.insert("port".into(), json!(port));
        }
        if let Some(domain) = env.first(&["AIR_DOMAIN", "DOMAIN"]) {
            record.insert("domain".into(), json!(domain));
        }

        let mut tls = Map::new();
        if let Some(key) = env.get("SSL_KEY") {
            tls.insert("key".into(), json!(key));
        }
        if let Some(cert) = env.get("SSL_CERT") {
            tls.insert("cert".into(), json!(cert));
        }
        if !tls.is_empty() {
            record.insert("tls".into(), Value::Object(tls));
        }

        let discovery = self.discovery_overrides();
        if !discovery.is_empty() {
            record.insert("discovery".into(), Value::Object(discovery));
        }

        let mut root = Map::new();
        if let Some(name) = env.get("AIR_NAME") {
            root.insert("name".into(), json!(name));
        }
        if env.first(&["AIR_ENV", "NODE_ENV"]).is_some() {
            root.insert("environment".into(), json!(environment));
        }
        if !record.is_empty() {
            root.insert(environment.to_string(), Value::Object(record));
        }

        Value::Object(root)
    }

    fn discovery_overrides(&self) -> Map<String, Value> {
        let env = &self.env;
        let mut discovery = Map::new();

        if let Some(enabled) = env.flag("AIR_SCAN_ENABLED") {
            discovery.insert("enabled".into(), json!(enabled));
        }

        let mut methods = Map::new();
        for (key, method) in [
            ("AIR_MULTICAST_ENABLED", "multicast"),
            ("AIR_DHT_ENABLED", "dht"),
            ("AIR_DNS_ENABLED", "dns"),
        ] {
            if let Some(on) = env.flag(key) {
                methods.insert(method.into(), json!(on));
            }
        }
        if !methods.is_empty() {
            discovery.insert("methods".into(), Value::Object(methods));
        }

        let mut multicast = Map::new();
        if let Some(addr) = env.parse::<std::net::Ipv4Addr>(&["AIR_MULTICAST_ADDR"]) {
            multicast.insert("address".into(), json!(addr.to_string()));
        }
        if let Some(port) = env.parse::<u16>(&["AIR_MULTICAST_PORT"]) {
            multicast.insert("port".into(), json!(port));
        }
        if !multicast.is_empty() {
            discovery.insert("multicast".into(), Value::Object(multicast));
        }

        let mut dns = Map::new();
        if let Some(domain) = env.get("AIR_DNS_DOMAIN") {
            dns.insert("domain".into(), json!(domain));
        }
        if let Some(prefix) = env.get("AIR_DNS_PREFIX") {
            dns.insert("prefix".into(), json!(prefix));
        }
        if !dns.is_empty() {
            discovery.insert("dns".into(), Value::Object(dns));
        }

        if let Some(bootstrap) = env.list("AIR_DHT_BOOTSTRAP") {
            discovery.insert("dht".into(), json!({ "bootstrap": bootstrap }));
        }

        let mut limits = Map::new();
        if let Some(max) = env.parse::<usize>(&["AIR_MAX_PEERS"]) {
            limits.insert("maxPeers".into(), json!(max));
        }
        if let Some(timeout) = env.parse::<u64>(&["AIR_PEER_TIMEOUT"]) {
            limits.insert("timeoutMs".into(), json!(timeout));
        }
        if !limits.is_empty() {
            discovery.insert("limits".into(), Value::Object(limits));
        }

        discovery
    }
}

/// Typed configuration from the merged value.
fn build_config(merged: Value, environment: &str, fallback: Value) -> Config {
    let mut config = Config::with_environment(environment);
    config.environments.clear();

    let Value::Object(fields) = merged else {
        config.active_mut();
        return config;
    };

    for (key, value) in fields {
        if key == "environment" {
            continue;
        }
        if key == "name" {
            match value {
                Value::String(name) if !name.trim().is_empty() => config.name = name,
                other => tracing::warn!(value = %other, "Ignoring invalid node name"),
            }
            continue;
        }

        match serde_json::from_value::<EnvConfig>(value.clone()) {
            Ok(record) => {
                config.environments.insert(key, record);
            }
            Err(e) if key == environment => {
                tracing::warn!(environment = %key, error = %e, "Active environment has invalid values");
                let record = salvage_record(&key, value, fallback.clone());
                config.environments.insert(key, record);
            }
            Err(e) => {
                tracing::warn!(environment = %key, error = %e, "Keeping unparseable environment as is");
                config.unparsed.insert(key, value);
            }
        }
    }

    config.active_mut();
    config
}

/// Take the fields of `value` one at a time over `fallback`, dropping those
/// that do not parse.
fn salvage_record(environment: &str, value: Value, fallback: Value) -> EnvConfig {
    let mut record = match fallback {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };

    if let Value::Object(fields) = value {
        for (field, field_value) in fields {
            let mut candidate = record.clone();
            candidate.insert(field.clone(), field_value);
            if serde_json::from_value::<EnvConfig>(Value::Object(candidate.clone())).is_ok() {
                record = candidate;
            } else {
                tracing::warn!(environment, field = %field, "Invalid value replaced by default");
            }
        }
    }

    serde_json::from_value(Value::Object(record)).unwrap_or_default()
}

fn defaults_value(environment: &str) -> Value {
    serde_json::to_value(Config::with_environment(environment))
        .unwrap_or_else(|_| Value::Object(Map::new()))
}

/// Shared, single-writer access to the live configuration.
///
/// Every mutation happens under one async mutex and is saved before the lock
/// is released, so concurrent writers cannot persist stale snapshots. When a
/// save fails the in-memory change is kept and the error returned.
#[derive(Clone)]
pub struct ConfigHandle {
    config: Arc<Mutex<Config>>,
    store: Arc<ConfigStore>,
}

impl ConfigHandle {
    /// Wrap a loaded configuration.
    pub fn new(store: ConfigStore, config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            store: Arc::new(store),
        }
    }

    /// Copy of the current configuration.
    pub async fn snapshot(&self) -> Config {
        self.config.lock().await.clone()
    }

    /// Apply `change` and save the result.
    pub async fn update<F, T>(&self, change: F) -> Result<T, ConfigError>
    where
        F: FnOnce(&mut Config) -> T,
    {
        let mut config = self.config.lock().await;
        let result = change(&mut config);
        self.save_locked(&mut config).await?;
        Ok(result)
    }

    /// Save with the peers another process added to the file merged in, so
    /// a save never drops a peer.
    async fn save_locked(&self, config: &mut Config) -> Result<(), ConfigError> {
        let on_disk = self.store.load().await;
        let adopted = config
            .active_mut()
            .peers
            .extend(on_disk.active().peers.iter().cloned());
        if !adopted.is_empty() {
            tracing::info!(peers = ?adopted, "Adopted peers added by another writer");
        }

        self.store.save(config).await
    }
}

#[async_trait]
impl NodeSettings for ConfigHandle {
    async fn listen_addr(&self) -> (String, u16) {
        let config = self.config.lock().await;
        let env = config.active();
        (env.host.clone(), env.port)
    }

    async fn bump_port(&self) -> P2pResult<u16> {
        self.update(|config| {
            let env = config.active_mut();
            env.port = env.port.saturating_add(1);
            env.port
        })
        .await
        .map_err(|e| P2pError::Settings(e.to_string()))
    }

    async fn peers(&self) -> PeerSet {
        self.config.lock().await.active().peers.clone()
    }

    async fn add_peers(&self, addrs: &[String]) -> P2pResult<Vec<String>> {
        let mut config = self.config.lock().await;
        let added = config.active_mut().peers.extend(addrs.iter().cloned());

        if !added.is_empty() {
            self.save_locked(&mut config)
                .await
                .map_err(|e| P2pError::Settings(e.to_string()))?;
        }

        Ok(added)
    }
}
