//! Listener supervision.
//!
//! The supervisor owns the node's network listener. It binds the configured
//! address, hands the socket to the graph store, and when binding or serving
//! fails it restarts after a fixed delay, up to a bounded number of times.
//! An address-in-use failure moves the port up by one (persisted through
//! [`NodeSettings`]) before the restart.
//!
//! ```text
//! Idle -> Binding -> Listening -> (Failed -> Binding)* -> Terminated
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::{P2pError, P2pResult};
use crate::scheduler::ShutdownRx;
use crate::settings::NodeSettings;
use crate::store::{GraphStore, StoreResult, TlsMaterial, Transport};

/// Default number of restarts before giving up.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Default delay before each restart.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(5000);

/// Bounded restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed since the last successful bind.
    pub max_restarts: u32,
    /// Wait before each restart.
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            delay: DEFAULT_RESTART_DELAY,
        }
    }
}

impl RestartPolicy {
    /// Set the restart limit.
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Set the restart delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Lifecycle state of the supervised listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Binding,
    Listening,
    Failed,
    Terminated,
}

/// Transition notifications delivered to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// About to bind `host:port`.
    Binding { host: String, port: u16 },
    /// Bound and serving.
    Listening { addr: SocketAddr, tls: bool },
    /// Binding or serving failed.
    Failed { error: String },
    /// The port moved after an address-in-use failure.
    PortBumped { from: u16, to: u16 },
    /// A restart is scheduled after `delay`.
    Restarting { attempt: u32, max: u32, delay: Duration },
    /// The restart limit was reached.
    GaveUp { max: u32 },
    /// The listener was closed.
    Closed,
}

/// Callback invoked on every supervisor transition.
pub type SupervisorObserver = Arc<dyn Fn(&SupervisorEvent) + Send + Sync>;

/// Keeps the node's listener alive across failures.
pub struct ServerSupervisor {
    store: Arc<dyn GraphStore>,
    settings: Arc<dyn NodeSettings>,
    tls: Option<TlsMaterial>,
    policy: RestartPolicy,
    observer: Option<SupervisorObserver>,
    state: SupervisorState,
    restarts: u32,
    local_addr: Option<SocketAddr>,
    serving: Option<JoinHandle<StoreResult<()>>>,
}

impl ServerSupervisor {
    /// Create a supervisor serving `store` on the address from `settings`.
    pub fn new(store: Arc<dyn GraphStore>, settings: Arc<dyn NodeSettings>) -> Self {
        Self {
            store,
            settings,
            tls: None,
            policy: RestartPolicy::default(),
            observer: None,
            state: SupervisorState::Idle,
            restarts: 0,
            local_addr: None,
            serving: None,
        }
    }

    /// Use TLS when this material is complete and present on disk.
    pub fn with_tls(mut self, tls: Option<TlsMaterial>) -> Self {
        self.tls = tls;
        self
    }

    /// Set the restart policy.
    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a transition observer.
    pub fn with_observer(mut self, observer: SupervisorObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Restarts since the last successful bind.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Address of the current listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Close any previous listener, bind the configured address and start
    /// serving on it.
    pub async fn init(&mut self) -> P2pResult<SocketAddr> {
        self.close_listener();

        let (host, port) = self.settings.listen_addr().await;
        let transport = Transport::select(self.tls.as_ref());

        self.state = SupervisorState::Binding;
        self.emit(SupervisorEvent::Binding {
            host: host.clone(),
            port,
        });

        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| classify_bind_error(&host, port, e))?;
        let addr = listener.local_addr()?;
        let tls = transport.is_tls();

        let store = self.store.clone();
        self.serving = Some(tokio::spawn(
            async move { store.serve(listener, transport).await },
        ));
        self.local_addr = Some(addr);
        self.restarts = 0;
        self.state = SupervisorState::Listening;

        tracing::info!(%addr, tls, "Listener started");
        self.emit(SupervisorEvent::Listening { addr, tls });

        Ok(addr)
    }

    /// React to a bind or serve failure: bump the port when it was taken,
    /// then go through [`restart`](Self::restart).
    pub async fn handle_failure(&mut self, error: &P2pError) -> P2pResult<()> {
        tracing::warn!(error = %error, "Listener failed");
        self.state = SupervisorState::Failed;
        self.emit(SupervisorEvent::Failed {
            error: error.to_string(),
        });

        if let P2pError::PortInUse { port } = error {
            match self.settings.bump_port().await {
                Ok(next) => {
                    tracing::info!(from = port, to = next, "Port in use, moving to next port");
                    self.emit(SupervisorEvent::PortBumped {
                        from: *port,
                        to: next,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to persist bumped port");
                }
            }
        }

        self.restart().await
    }

    /// Count a restart and wait the policy delay, or fail once the limit is
    /// reached.
    pub async fn restart(&mut self) -> P2pResult<()> {
        let max = self.policy.max_restarts;
        if self.restarts >= max {
            tracing::error!(max, "Maximum restart attempts reached");
            self.emit(SupervisorEvent::GaveUp { max });
            return Err(P2pError::RestartLimitExceeded { max });
        }

        self.restarts += 1;
        let delay = self.policy.delay;
        tracing::info!(
            attempt = self.restarts,
            max,
            delay_ms = delay.as_millis() as u64,
            "Restarting listener"
        );
        self.emit(SupervisorEvent::Restarting {
            attempt: self.restarts,
            max,
            delay,
        });

        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// Bind, retrying per the policy, until the listener is up.
    pub async fn start(&mut self) -> P2pResult<SocketAddr> {
        loop {
            match self.init().await {
                Ok(addr) => return Ok(addr),
                Err(e) => self.handle_failure(&e).await?,
            }
        }
    }

    /// Supervise the listener until `shutdown` fires or restarts run out.
    pub async fn run(mut self, mut shutdown: ShutdownRx) -> P2pResult<()> {
        let outcome = self.supervise(&mut shutdown).await;
        self.close();
        self.state = SupervisorState::Terminated;
        outcome
    }

    /// Stop serving.
    pub fn close(&mut self) {
        if self.close_listener() {
            tracing::info!("Listener closed");
            self.emit(SupervisorEvent::Closed);
        }
    }

    async fn supervise(&mut self, shutdown: &mut ShutdownRx) -> P2pResult<()> {
        loop {
            let failure = match self.serving {
                Some(_) => tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    failure = self.serving_failure() => failure,
                },
                None => match self.init().await {
                    Ok(_) => continue,
                    Err(e) => e,
                },
            };

            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                result = self.handle_failure(&failure) => result?,
            }
        }
    }

    /// Wait for the serve task to end and describe why it did.
    async fn serving_failure(&mut self) -> P2pError {
        let Some(handle) = self.serving.as_mut() else {
            return std::future::pending().await;
        };

        let failure = match handle.await {
            Ok(Ok(())) => P2pError::Listener("listener stopped".to_string()),
            Ok(Err(e)) => P2pError::Listener(e.to_string()),
            Err(e) => P2pError::Listener(format!("serve task ended: {}", e)),
        };
        self.serving = None;
        failure
    }

    fn close_listener(&mut self) -> bool {
        match self.serving.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        tracing::debug!(?event, "Supervisor transition");
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }
}

impl Drop for ServerSupervisor {
    fn drop(&mut self) {
        self.close_listener();
    }
}

fn classify_bind_error(host: &str, port: u16, error: io::Error) -> P2pError {
    if error.kind() == io::ErrorKind::AddrInUse {
        P2pError::PortInUse { port }
    } else {
        P2pError::Listener(format!("bind {}:{} failed: {}", host, port, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::PeerSet;
    use crate::settings::MemorySettings;
    use crate::store::LocalGraph;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    fn recording() -> (SupervisorObserver, Arc<Mutex<Vec<SupervisorEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let observer: SupervisorObserver = Arc::new(move |event: &SupervisorEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        (observer, events)
    }

    fn no_delay() -> RestartPolicy {
        RestartPolicy::default().with_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_successful_bind_resets_restarts() {
        let settings = Arc::new(MemorySettings::new("127.0.0.1", 0, PeerSet::new()));
        let mut supervisor = ServerSupervisor::new(Arc::new(LocalGraph::new()), settings)
            .with_policy(no_delay());

        supervisor.restart().await.unwrap();
        assert_eq!(supervisor.restarts(), 1);

        let addr = supervisor.init().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(supervisor.restarts(), 0);
        assert_eq!(supervisor.state(), SupervisorState::Listening);
    }

    #[tokio::test]
    async fn test_port_in_use_bumps_and_restarts() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let settings = Arc::new(MemorySettings::new("127.0.0.1", port, PeerSet::new()));
        let (observer, events) = recording();
        let mut supervisor =
            ServerSupervisor::new(Arc::new(LocalGraph::new()), settings.clone())
                .with_policy(no_delay())
                .with_observer(observer);

        let error = supervisor.init().await.unwrap_err();
        assert!(error.is_port_in_use());

        supervisor.handle_failure(&error).await.unwrap();
        assert_eq!(settings.listen_addr().await.1, port + 1);
        assert_eq!(settings.saves(), 1);
        assert_eq!(supervisor.restarts(), 1);

        let events = events.lock().unwrap().clone();
        assert!(events.contains(&SupervisorEvent::PortBumped {
            from: port,
            to: port + 1
        }));

        // Next init on a free port succeeds and clears the counter
        settings.set_port(0).await;
        supervisor.init().await.unwrap();
        assert_eq!(supervisor.restarts(), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_restarts() {
        // TEST-NET-1 is never assigned locally, so every bind fails
        let settings = Arc::new(MemorySettings::new("192.0.2.1", 8765, PeerSet::new()));
        let (observer, events) = recording();
        let mut supervisor = ServerSupervisor::new(Arc::new(LocalGraph::new()), settings.clone())
            .with_policy(no_delay())
            .with_observer(observer);

        let result = supervisor.start().await;
        assert!(matches!(
            result,
            Err(P2pError::RestartLimitExceeded { max: 5 })
        ));

        let events = events.lock().unwrap().clone();
        let binds = events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Binding { .. }))
            .count();
        let restarts = events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Restarting { .. }))
            .count();
        assert_eq!(binds, 6);
        assert_eq!(restarts, 5);
        assert_eq!(events.last(), Some(&SupervisorEvent::GaveUp { max: 5 }));

        // Not an address-in-use failure, so the port never moved
        assert_eq!(settings.listen_addr().await.1, 8765);
        assert_eq!(settings.saves(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_delay_precedes_next_bind() {
        let settings = Arc::new(MemorySettings::new("192.0.2.1", 8765, PeerSet::new()));
        let binds = Arc::new(Mutex::new(Vec::new()));
        let sink = binds.clone();
        let observer: SupervisorObserver = Arc::new(move |event: &SupervisorEvent| {
            if matches!(event, SupervisorEvent::Binding { .. }) {
                sink.lock().unwrap().push(tokio::time::Instant::now());
            }
        });
        let mut supervisor = ServerSupervisor::new(Arc::new(LocalGraph::new()), settings)
            .with_policy(RestartPolicy::default().with_max_restarts(1))
            .with_observer(observer);
        assert_eq!(RestartPolicy::default().delay, Duration::from_millis(5000));

        let result = supervisor.start().await;
        assert!(matches!(
            result,
            Err(P2pError::RestartLimitExceeded { max: 1 })
        ));

        let binds = binds.lock().unwrap().clone();
        assert_eq!(binds.len(), 2);
        let gap = binds[1] - binds[0];
        assert!(gap >= Duration::from_millis(5000), "gap was {:?}", gap);
        assert!(gap < Duration::from_millis(5100), "gap was {:?}", gap);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let settings = Arc::new(MemorySettings::new("127.0.0.1", 0, PeerSet::new()));
        let (observer, events) = recording();
        let supervisor = ServerSupervisor::new(Arc::new(LocalGraph::new()), settings)
            .with_policy(no_delay())
            .with_observer(observer);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(supervisor.run(shutdown_rx));

        for _ in 0..50 {
            let listening = events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, SupervisorEvent::Listening { .. }));
            if listening {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&SupervisorEvent::Closed)
        );
    }
}
