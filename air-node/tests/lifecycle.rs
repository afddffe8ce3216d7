//! Node startup, singleton lock and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use air_node::commands::{self, Context};
use air_node::config::ConfigStore;
use air_node::lock::{LockManager, LockState};
use air_node::node::{NodeError, NodeMode};
use air_node::paths::AirPaths;
use air_p2p::{GraphStore, LocalGraph};
use tempfile::tempdir;
use tokio::net::TcpStream;

use common::{test_env, test_node};

#[tokio::test]
async fn test_start_registers_and_shuts_down() {
    let dir = tempdir().unwrap();
    let store = Arc::new(LocalGraph::new());

    let node = test_node(dir.path(), test_env(), store.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(node.mode(), NodeMode::Server);
    let addr = node.local_addr().unwrap();
    assert_ne!(addr.port(), 0);
    assert!(TcpStream::connect(addr).await.is_ok());

    assert_eq!(store.listen_addr().await, Some(addr));
    let record = store.get("air/nodes/test-node").await.unwrap().unwrap();
    assert_eq!(record["port"], addr.port());
    assert_eq!(record["hasTLS"], false);

    let tasks = node.tasks();
    assert!(tasks.contains(&"heartbeat"));
    assert!(tasks.contains(&"ddns refresh"));
    assert!(tasks.contains(&"port tracking"));
    assert!(!tasks.contains(&"ip refresh"));
    assert!(!tasks.contains(&"multicast beacon"));

    let lock = LockManager::new(&AirPaths::in_dir(dir.path()), 0, "");
    assert!(matches!(lock.inspect(), LockState::Locked(r) if r.owner == "test-node"));

    node.shutdown().await.unwrap();
    assert_eq!(lock.inspect(), LockState::Unlocked);
    assert!(!lock.pid_file().exists());
}

#[tokio::test]
async fn test_second_instance_is_refused() {
    let dir = tempdir().unwrap();

    let first = test_node(dir.path(), test_env(), Arc::new(LocalGraph::new()))
        .start()
        .await
        .unwrap();

    let second = test_node(dir.path(), test_env(), Arc::new(LocalGraph::new()))
        .start()
        .await;
    assert!(matches!(second, Err(NodeError::LockConflict { .. })));

    first.shutdown().await.unwrap();

    let third = test_node(dir.path(), test_env(), Arc::new(LocalGraph::new()))
        .start()
        .await
        .unwrap();
    third.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_forced_start_ignores_lock() {
    let dir = tempdir().unwrap();

    let first = test_node(dir.path(), test_env(), Arc::new(LocalGraph::new()))
        .start()
        .await
        .unwrap();

    let forced = test_node(
        dir.path(),
        test_env().with("FORCE_AIR", "true"),
        Arc::new(LocalGraph::new()),
    )
    .start()
    .await
    .unwrap();
    assert_ne!(forced.local_addr(), first.local_addr());

    forced.shutdown().await.unwrap();
    first.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_added_peer_is_persisted() {
    let dir = tempdir().unwrap();
    let store = Arc::new(LocalGraph::new());

    let node = test_node(dir.path(), test_env(), store.clone())
        .start()
        .await
        .unwrap();

    assert!(node.discovery().unwrap().add_peer("c:3").await.unwrap());
    assert!(store.peers().await.contains(&"c:3".to_string()));

    let saved = ConfigStore::new(AirPaths::in_dir(dir.path()).config_file(), test_env())
        .load()
        .await;
    assert!(saved.active().peers.contains("c:3"));
    assert!(node.settings().snapshot().await.active().peers.contains("c:3"));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_limit_is_fatal_and_releases_lock() {
    let dir = tempdir().unwrap();
    let env = test_env().with("AIR_HOST", "192.0.2.1").with("AIR_PORT", "9");

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        test_node(dir.path(), env, Arc::new(LocalGraph::new())).start(),
    )
    .await
    .unwrap();
    assert!(matches!(
        result,
        Err(NodeError::RestartLimitExceeded { max: 2 })
    ));

    let lock = LockManager::new(&AirPaths::in_dir(dir.path()), 0, "");
    assert_eq!(lock.inspect(), LockState::Unlocked);
}

#[tokio::test]
async fn test_status_reports_running_node() {
    let dir = tempdir().unwrap();
    let node = test_node(dir.path(), test_env(), Arc::new(LocalGraph::new()))
        .start()
        .await
        .unwrap();

    let ctx = Context::new(AirPaths::in_dir(dir.path()), test_env());
    let status = commands::status(&ctx).await;
    assert_eq!(status.name, "test-node");
    assert_eq!(status.lock.state, "running");
    assert_eq!(status.lock.pid, Some(std::process::id()));

    node.shutdown().await.unwrap();
    assert_eq!(commands::status(&ctx).await.lock.state, "unlocked");
}

/// A free loopback port, for tests that need the configured port to be the
/// bound one.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_client_takes_no_lock_and_serves_nothing() {
    let dir = tempdir().unwrap();
    let store = Arc::new(LocalGraph::new());

    let client = test_node(dir.path(), test_env(), store.clone())
        .connect(vec!["127.0.0.1:9".to_string()])
        .await
        .unwrap();
    assert_eq!(client.mode(), NodeMode::Client);
    assert!(client.local_addr().is_none());
    assert!(client.discovery().is_none());

    assert_eq!(store.peers().await, vec!["127.0.0.1:9"]);
    assert_eq!(store.listen_addr().await, None);
    let record = store.get("air/nodes/test-node").await.unwrap().unwrap();
    assert_eq!(record["hasPlainHTTP"], false);
    assert_eq!(record["hasTLS"], false);
    assert!(client.tasks().contains(&"heartbeat"));

    let lock = LockManager::new(&AirPaths::in_dir(dir.path()), 0, "");
    assert_eq!(lock.inspect(), LockState::Unlocked);

    // A server can still start next to the client
    let server = test_node(dir.path(), test_env(), Arc::new(LocalGraph::new()))
        .start()
        .await
        .unwrap();
    server.shutdown().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), client.shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_client_defaults_to_local_server() {
    let dir = tempdir().unwrap();
    let port = free_port();
    let store = Arc::new(LocalGraph::new());

    let client = test_node(
        dir.path(),
        test_env().with("AIR_PORT", port.to_string()),
        store.clone(),
    )
    .connect(Vec::new())
    .await
    .unwrap();
    assert_eq!(store.peers().await, vec![format!("127.0.0.1:{}", port)]);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_auto_starts_server_when_slot_is_free() {
    let dir = tempdir().unwrap();

    let node = test_node(dir.path(), test_env(), Arc::new(LocalGraph::new()))
        .auto()
        .await
        .unwrap();
    assert_eq!(node.mode(), NodeMode::Server);
    assert!(node.local_addr().is_some());

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_auto_joins_running_server_as_client() {
    let dir = tempdir().unwrap();
    let env = test_env().with("AIR_PORT", free_port().to_string());

    let server = test_node(dir.path(), env.clone(), Arc::new(LocalGraph::new()))
        .start()
        .await
        .unwrap();
    let server_addr = server.local_addr().unwrap();

    let store = Arc::new(LocalGraph::new());
    let client = test_node(dir.path(), env, store.clone())
        .auto()
        .await
        .unwrap();
    assert_eq!(client.mode(), NodeMode::Client);
    assert_eq!(
        store.peers().await,
        vec![format!("127.0.0.1:{}", server_addr.port())]
    );

    client.shutdown().await.unwrap();

    // The client never touched the server's lock
    let lock = LockManager::new(&AirPaths::in_dir(dir.path()), 0, "");
    assert!(matches!(lock.inspect(), LockState::Locked(_)));
    server.shutdown().await.unwrap();
}
