//! Peer discovery.
//!
//! This module provides:
//! - Manual peer list loading
//! - DHT bootstrap seeding
//! - Local multicast announcements
//! - DNS enumeration of numbered node names
//!
//! Every strategy funnels into [`PeerDiscoveryEngine::add_peer`] or its batch
//! form, which persists the peer set through [`NodeSettings`] and tells the
//! graph store about new peers. Peers are never removed.

pub mod dns;
pub mod manual;
pub mod multicast;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::{DiscoveryConfig, DiscoveryMethods, DnsConfig, MulticastConfig};
use crate::error::{P2pError, P2pResult};
use crate::scheduler::Scheduler;
use crate::settings::NodeSettings;
use crate::store::GraphStore;

pub use dns::{DnsScanner, DNS_SCAN_INTERVAL};
pub use manual::{load_manual_peers, MANUAL_PEERS_FILE};
pub use multicast::{parse_announcement, Announcement, MulticastBeacon, ANNOUNCE_INTERVAL};

/// What `start` set up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// New peers from the manual list.
    pub manual: usize,
    /// New peers from the DHT bootstrap list.
    pub dht: usize,
    /// Whether the multicast beacon is running.
    pub multicast: bool,
    /// Whether DNS scanning is scheduled.
    pub dns: bool,
}

/// Snapshot of discovery settings and the current peer set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStatus {
    pub enabled: bool,
    pub methods: DiscoveryMethods,
    pub multicast: MulticastConfig,
    pub dns: DnsConfig,
    pub dht_bootstrap: Vec<String>,
    pub multicast_active: bool,
    pub dns_active: bool,
    pub peers: Vec<String>,
}

/// Coordinates the discovery strategies.
pub struct PeerDiscoveryEngine {
    config: DiscoveryConfig,
    settings: Arc<dyn NodeSettings>,
    store: Arc<dyn GraphStore>,
    node_name: String,
    manual_file: Option<PathBuf>,
    multicast_active: AtomicBool,
    dns_active: AtomicBool,
}

impl PeerDiscoveryEngine {
    /// Create an engine for the node `node_name`.
    pub fn new(
        config: DiscoveryConfig,
        settings: Arc<dyn NodeSettings>,
        store: Arc<dyn GraphStore>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            config,
            settings,
            store,
            node_name: node_name.into(),
            manual_file: None,
            multicast_active: AtomicBool::new(false),
            dns_active: AtomicBool::new(false),
        }
    }

    /// Read manual peers from `path`.
    pub fn with_manual_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.manual_file = Some(path.into());
        self
    }

    /// Discovery settings in use.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Run the enabled strategies. One-shot strategies finish before this
    /// returns; continuous ones are handed to `scheduler`.
    ///
    /// Strategy failures are logged and leave the others running.
    pub async fn start(self: &Arc<Self>, scheduler: &Scheduler) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        if !self.config.enabled {
            tracing::info!("Peer discovery disabled");
            return report;
        }

        let methods = self.config.methods;

        if methods.manual {
            match self.seed_manual().await {
                Ok(added) => report.manual = added,
                Err(e) => tracing::warn!(error = %e, "Manual peer list ignored"),
            }
        }

        if methods.dht {
            match self.seed_dht().await {
                Ok(added) => report.dht = added,
                Err(e) => tracing::warn!(error = %e, "DHT bootstrap seeding failed"),
            }
        }

        if methods.multicast {
            match MulticastBeacon::bind(&self.config.multicast).await {
                Ok(beacon) => {
                    self.spawn_multicast(beacon, scheduler);
                    report.multicast = true;
                }
                Err(e) => tracing::warn!(error = %e, "Multicast discovery unavailable"),
            }
        }

        if self.config.dns_active() {
            self.spawn_dns(scheduler);
            report.dns = true;
        } else if methods.dns {
            tracing::debug!("DNS discovery enabled without a domain, skipping");
        }

        self.multicast_active.store(report.multicast, Ordering::SeqCst);
        self.dns_active.store(report.dns, Ordering::SeqCst);

        tracing::info!(
            manual = report.manual,
            dht = report.dht,
            multicast = report.multicast,
            dns = report.dns,
            "Peer discovery started"
        );

        report
    }

    /// Add one peer. Returns whether it was new.
    pub async fn add_peer(&self, addr: &str) -> P2pResult<bool> {
        let addr = addr.trim();
        if addr.is_empty() || addr.chars().any(char::is_whitespace) {
            return Err(P2pError::InvalidAddress(addr.to_string()));
        }

        let added = self.merge_peers(&[addr.to_string()]).await?;
        if added.is_empty() {
            tracing::trace!(peer = addr, "Peer already known");
            return Ok(false);
        }

        tracing::info!(peer = addr, "Peer added");
        Ok(true)
    }

    /// Current strategy flags and peers.
    pub async fn status(&self) -> DiscoveryStatus {
        DiscoveryStatus {
            enabled: self.config.enabled,
            methods: self.config.methods,
            multicast: self.config.multicast,
            dns: self.config.dns.clone(),
            dht_bootstrap: self.config.dht.bootstrap.clone(),
            multicast_active: self.multicast_active.load(Ordering::SeqCst),
            dns_active: self.dns_active.load(Ordering::SeqCst),
            peers: self.settings.peers().await.into_vec(),
        }
    }

    async fn seed_manual(&self) -> P2pResult<usize> {
        let Some(path) = &self.manual_file else {
            return Ok(0);
        };

        let peers = load_manual_peers(path).await?;
        let added = self.merge_peers(&peers).await?;
        tracing::debug!(listed = peers.len(), added = added.len(), "Manual peers loaded");
        Ok(added.len())
    }

    async fn seed_dht(&self) -> P2pResult<usize> {
        let added = self.merge_peers(&self.config.dht.bootstrap).await?;
        tracing::debug!(
            bootstrap = self.config.dht.bootstrap.len(),
            added = added.len(),
            "DHT bootstrap seeded"
        );
        Ok(added.len())
    }

    /// Persist `addrs` into the peer set and connect the store to the new
    /// ones.
    async fn merge_peers(&self, addrs: &[String]) -> P2pResult<Vec<String>> {
        let added = self.settings.add_peers(addrs).await?;

        for peer in &added {
            if let Err(e) = self.store.connect(peer).await {
                tracing::warn!(peer = %peer, error = %e, "Store could not connect to peer");
            }
        }

        Ok(added)
    }

    fn spawn_multicast(self: &Arc<Self>, beacon: MulticastBeacon, scheduler: &Scheduler) {
        let engine = self.clone();
        scheduler.spawn("multicast beacon", move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let (_, port) = engine.settings.listen_addr().await;
                        let announcement = Announcement::new(engine.node_name.as_str(), port);
                        if let Err(e) = beacon.announce(&announcement).await {
                            tracing::debug!(error = %e, "Multicast announcement failed");
                        }
                    }
                    found = beacon.next_peer(&engine.node_name) => match found {
                        Ok(peer) => {
                            if let Err(e) = engine.add_peer(&peer).await {
                                tracing::warn!(peer = %peer, error = %e, "Failed to add multicast peer");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Multicast receiver stopped");
                            break;
                        }
                    },
                }
            }
        });
    }

    fn spawn_dns(self: &Arc<Self>, scheduler: &Scheduler) {
        let engine = self.clone();
        let scanner = Arc::new(DnsScanner::new(&self.config));

        scheduler.every("dns scan", DNS_SCAN_INTERVAL, move || {
            let engine = engine.clone();
            let scanner = scanner.clone();
            async move {
                let (_, port) = engine.settings.listen_addr().await;
                let found = scanner.scan(port).await;
                if found.is_empty() {
                    return;
                }

                match engine.merge_peers(&found).await {
                    Ok(added) if !added.is_empty() => {
                        tracing::info!(count = added.len(), "Peers discovered via DNS");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to record DNS peers"),
                }
            }
        });
    }
}
