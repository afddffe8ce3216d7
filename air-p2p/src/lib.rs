//! Network core of an Air node.
//!
//! This crate owns everything that touches the peer-to-peer network:
//!
//! - Listener supervision with a bounded restart policy
//! - Publication of the node identity record and its liveness heartbeat
//! - Peer discovery through a manual list, DHT bootstrap seeding, local
//!   multicast announcements and DNS enumeration
//! - The [`GraphStore`] seam behind which the replicated graph store lives
//!
//! # Architecture
//!
//! Every recurring job runs as its own tokio task owned by a [`Scheduler`].
//! Tasks reschedule themselves only after the previous run has finished and
//! stop as soon as the scheduler is shut down.
//!
//! ```text
//! Node (air-node)
//! ├── ServerSupervisor task (bind / serve / restart)
//! ├── Scheduler
//! │   ├── heartbeat        (60 s)
//! │   ├── ddns refresh     (5 min)
//! │   ├── ip refresh       (5 min)
//! │   ├── multicast beacon (continuous)
//! │   └── dns scan         (5 min)
//! └── GraphStore (LocalGraph by default)
//! ```
//!
//! Configuration persistence is reached through the [`NodeSettings`] trait so
//! the core never depends on the on-disk configuration format.

pub mod clock;
pub mod config;
pub mod error;
pub mod peers;
pub mod persist;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod registry;
pub mod discovery;

// Re-export main types
pub use config::{
    DhtConfig, DiscoveryConfig, DiscoveryLimits, DiscoveryMethods, DnsConfig, MulticastConfig,
};
pub use discovery::{DiscoveryReport, DiscoveryStatus, PeerDiscoveryEngine};
pub use error::{P2pError, P2pResult};
pub use peers::PeerSet;
pub use registry::{NodeIdentityRecord, PeerRegistry, RegistryConfig};
pub use scheduler::Scheduler;
pub use settings::{MemorySettings, NodeSettings};
pub use store::{GraphStore, LocalGraph, Session, StoreError, StoreResult, TlsMaterial, Transport};
pub use supervisor::{
    RestartPolicy, ServerSupervisor, SupervisorEvent, SupervisorObserver, SupervisorState,
};
