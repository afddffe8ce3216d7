//! DNS peer enumeration.
//!
//! Nodes of a deployment are published as `<prefix>.<domain>`,
//! `<prefix>-1.<domain>`, `<prefix>-2.<domain>` and so on. The scanner walks
//! that sequence until the first name that does not resolve.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::DiscoveryConfig;
use crate::error::{P2pError, P2pResult};

/// Period between DNS scans.
pub const DNS_SCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Resolver for the numbered node names of one domain.
pub struct DnsScanner {
    resolver: TokioAsyncResolver,
    prefix: String,
    domain: String,
    max_names: usize,
}

impl DnsScanner {
    /// Create a scanner from the discovery settings.
    pub fn new(config: &DiscoveryConfig) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = config.timeout();

        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            prefix: config.dns.prefix.clone(),
            domain: config.dns.domain.trim().to_string(),
            max_names: config.limits.max_peers,
        }
    }

    /// The `n`-th candidate name. `0` is the bare prefix.
    pub fn hostname(&self, n: usize) -> String {
        candidate_name(&self.prefix, &self.domain, n)
    }

    /// Resolve one hostname.
    pub async fn resolve(&self, hostname: &str) -> P2pResult<Vec<IpAddr>> {
        tracing::trace!(hostname, "Resolving peer name");

        let response = self
            .resolver
            .lookup_ip(hostname)
            .await
            .map_err(|e| P2pError::DnsResolutionFailed {
                host: hostname.to_string(),
                error: e.to_string(),
            })?;

        Ok(response.iter().collect())
    }

    /// Walk the candidate names and return every address as `ip:port`.
    pub async fn scan(&self, port: u16) -> Vec<String> {
        let found = scan_with(&self.prefix, &self.domain, self.max_names, port, |host| async move {
            match self.resolve(&host).await {
                Ok(ips) => Some(ips),
                Err(e) => {
                    tracing::debug!(error = %e, "Peer name did not resolve");
                    None
                }
            }
        })
        .await;

        tracing::debug!(
            domain = %self.domain,
            count = found.len(),
            "DNS scan complete"
        );

        found
    }
}

fn candidate_name(prefix: &str, domain: &str, n: usize) -> String {
    if n == 0 {
        format!("{}.{}", prefix, domain)
    } else {
        format!("{}-{}.{}", prefix, n, domain)
    }
}

/// Scan candidates `0..=max_names` through `lookup`, stopping at the first
/// miss. An empty answer counts as a miss.
async fn scan_with<F, Fut>(
    prefix: &str,
    domain: &str,
    max_names: usize,
    port: u16,
    mut lookup: F,
) -> Vec<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Option<Vec<IpAddr>>>,
{
    let mut found = Vec::new();

    for n in 0..=max_names {
        let ips = match lookup(candidate_name(prefix, domain, n)).await {
            Some(ips) if !ips.is_empty() => ips,
            _ => break,
        };

        for ip in ips {
            let addr = SocketAddr::new(ip, port).to_string();
            if !found.contains(&addr) {
                found.push(addr);
            }
        }
    }

    found
}
