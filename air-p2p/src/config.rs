//! Discovery configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default multicast group for local-subnet discovery.
pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);

/// Default multicast port.
pub const DEFAULT_MULTICAST_PORT: u16 = 8766;

/// Default subdomain prefix enumerated by DNS discovery.
pub const DEFAULT_DNS_PREFIX: &str = "air-node";

/// Default DHT bootstrap peers.
pub const DEFAULT_DHT_BOOTSTRAP: &[&str] = &["gun.eco/gun", "gunjs.herokuapp.com/gun"];

/// Default cap on the number of peers a strategy may report in one pass.
pub const DEFAULT_MAX_PEERS: usize = 50;

/// Default timeout for outbound discovery and lookup requests.
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 5000;

/// Discovery settings for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    /// Master switch for all strategies.
    pub enabled: bool,

    /// Per-strategy toggles.
    pub methods: DiscoveryMethods,

    /// Multicast group parameters.
    pub multicast: MulticastConfig,

    /// DNS enumeration parameters.
    pub dns: DnsConfig,

    /// DHT bootstrap parameters.
    pub dht: DhtConfig,

    /// Limits shared by all strategies.
    pub limits: DiscoveryLimits,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: DiscoveryMethods::default(),
            multicast: MulticastConfig::default(),
            dns: DnsConfig::default(),
            dht: DhtConfig::default(),
            limits: DiscoveryLimits::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Enable or disable every strategy at once.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Replace the strategy toggles.
    pub fn with_methods(mut self, methods: DiscoveryMethods) -> Self {
        self.methods = methods;
        self
    }

    /// Set the DNS domain to enumerate.
    pub fn with_dns_domain(mut self, domain: impl Into<String>) -> Self {
        self.dns.domain = domain.into();
        self
    }

    /// Set the DHT bootstrap list.
    pub fn with_bootstrap(mut self, bootstrap: Vec<String>) -> Self {
        self.dht.bootstrap = bootstrap;
        self
    }

    /// Whether DNS discovery would actually run.
    ///
    /// An empty domain disables it even when the strategy flag is set.
    pub fn dns_active(&self) -> bool {
        self.enabled && self.methods.dns && self.dns.is_configured()
    }

    /// Request timeout derived from the limits.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.limits.timeout_ms)
    }
}

/// Which strategies are switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryMethods {
    pub multicast: bool,
    pub dht: bool,
    pub dns: bool,
    pub manual: bool,
}

impl Default for DiscoveryMethods {
    fn default() -> Self {
        Self {
            multicast: true,
            dht: true,
            dns: false,
            manual: true,
        }
    }
}

impl DiscoveryMethods {
    /// Every strategy off.
    pub fn none() -> Self {
        Self {
            multicast: false,
            dht: false,
            dns: false,
            manual: false,
        }
    }
}

/// Multicast group used for local-subnet announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_MULTICAST_ADDR,
            port: DEFAULT_MULTICAST_PORT,
        }
    }
}

/// Operator-configured DNS zone to enumerate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Zone to search. Empty means DNS discovery is skipped.
    pub domain: String,
    /// Fixed subdomain prefix of node records.
    pub prefix: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            prefix: DEFAULT_DNS_PREFIX.to_string(),
        }
    }
}

impl DnsConfig {
    /// Whether a domain has been configured.
    pub fn is_configured(&self) -> bool {
        !self.domain.trim().is_empty()
    }
}

/// Static DHT entry points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub bootstrap: Vec<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bootstrap: DEFAULT_DHT_BOOTSTRAP.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Limits applied to discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryLimits {
    pub max_peers: usize,
    pub timeout_ms: u64,
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
        }
    }
}
