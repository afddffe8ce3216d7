//! Operator-maintained peer list.

use std::path::Path;

use crate::error::P2pResult;
use crate::persist;

/// File name of the manual peer list inside the config directory.
pub const MANUAL_PEERS_FILE: &str = "manual-peers.json";

/// Read a JSON array of peer addresses. A missing file yields no peers.
pub async fn load_manual_peers(path: &Path) -> P2pResult<Vec<String>> {
    let peers: Vec<String> = persist::load_json(path).await?.unwrap_or_default();

    Ok(peers
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect())
}
