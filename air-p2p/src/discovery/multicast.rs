//! Local network discovery over UDP multicast.
//!
//! Every node joins the configured group, periodically announces its name
//! and listen port, and reports the announcements of other nodes as
//! `<sender ip>:<port>`.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use crate::config::MulticastConfig;
use crate::error::{P2pError, P2pResult};

/// Service tag carried by every announcement.
pub const SERVICE_TAG: &str = "air";

/// Period between announcements.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 1024;

/// Announcement datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub service: String,
    pub name: String,
    pub port: u16,
}

impl Announcement {
    /// Announcement for the node `name` listening on `port`.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            service: SERVICE_TAG.to_string(),
            name: name.into(),
            port,
        }
    }

    /// Encode as JSON bytes.
    pub fn encode(&self) -> P2pResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Decode a datagram from `src` into a peer address.
///
/// Returns `None` for foreign traffic, malformed datagrams and our own
/// announcements.
pub fn parse_announcement(bytes: &[u8], src: SocketAddr, own_name: &str) -> Option<String> {
    let announcement: Announcement = serde_json::from_slice(bytes).ok()?;
    if announcement.service != SERVICE_TAG || announcement.name == own_name || announcement.port == 0 {
        return None;
    }
    Some(SocketAddr::new(src.ip(), announcement.port).to_string())
}

/// A socket joined to the discovery group.
pub struct MulticastBeacon {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl MulticastBeacon {
    /// Bind the group port and join the group on all interfaces.
    pub async fn bind(config: &MulticastConfig) -> P2pResult<Self> {
        if !config.address.is_multicast() {
            return Err(P2pError::Discovery(format!(
                "{} is not a multicast address",
                config.address
            )));
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).await?;
        socket.join_multicast_v4(config.address, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;

        tracing::debug!(group = %config.address, port = config.port, "Joined multicast group");

        Ok(Self {
            socket,
            group: SocketAddrV4::new(config.address, config.port),
        })
    }

    /// Send one announcement to the group.
    pub async fn announce(&self, announcement: &Announcement) -> P2pResult<()> {
        let bytes = announcement.encode()?;
        self.socket.send_to(&bytes, self.group).await?;
        tracing::trace!(name = %announcement.name, port = announcement.port, "Multicast announcement sent");
        Ok(())
    }

    /// Wait for the next datagram that names a foreign peer.
    pub async fn next_peer(&self, own_name: &str) -> P2pResult<String> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            if let Some(peer) = parse_announcement(&buf[..len], src, own_name) {
                return Ok(peer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> SocketAddr {
        "192.168.1.20:8766".parse().unwrap()
    }

    #[test]
    fn test_parse_foreign_announcement() {
        let bytes = Announcement::new("other", 8765).encode().unwrap();
        assert_eq!(
            parse_announcement(&bytes, src(), "me"),
            Some("192.168.1.20:8765".to_string())
        );
    }

    #[test]
    fn test_ignore_own_and_foreign_traffic() {
        let own = Announcement::new("me", 8765).encode().unwrap();
        assert_eq!(parse_announcement(&own, src(), "me"), None);

        let other_service = br#"{"service":"mdns","name":"x","port":1}"#;
        assert_eq!(parse_announcement(other_service, src(), "me"), None);

        assert_eq!(parse_announcement(b"not json", src(), "me"), None);

        let zero_port = Announcement::new("other", 0).encode().unwrap();
        assert_eq!(parse_announcement(&zero_port, src(), "me"), None);
    }

    #[tokio::test]
    async fn test_rejects_unicast_group() {
        let config = MulticastConfig {
            address: Ipv4Addr::new(10, 0, 0, 1),
            port: 0,
        };
        assert!(matches!(
            MulticastBeacon::bind(&config).await,
            Err(P2pError::Discovery(_))
        ));
    }
}
