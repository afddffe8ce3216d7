//! Shared test helpers for air-node integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use air_node::env::EnvVars;
use air_node::node::Node;
use air_node::paths::AirPaths;
use air_p2p::{LocalGraph, RestartPolicy};

/// Environment for a loopback node on an ephemeral port with the network
/// strategies switched off.
pub fn test_env() -> EnvVars {
    EnvVars::from_pairs([
        ("AIR_NAME", "test-node"),
        ("AIR_HOST", "127.0.0.1"),
        ("AIR_PORT", "0"),
        ("AIR_MULTICAST_ENABLED", "false"),
        ("AIR_DHT_ENABLED", "false"),
    ])
}

/// A node rooted at `root` that makes no outbound requests.
pub fn test_node(root: &Path, env: EnvVars, store: Arc<LocalGraph>) -> Node {
    Node::new(AirPaths::in_dir(root), env)
        .with_store(store)
        .with_ip_service(None)
        .with_restart_policy(
            RestartPolicy::default()
                .with_max_restarts(2)
                .with_delay(Duration::from_millis(10)),
        )
}
