//! Mesh topology and NAT coordination for EdgeLink.
//!
//! Registers devices into virtual networks, allocates their addresses,
//! classifies their NAT behavior, decides how each pair connects (direct
//! hole-punch or TURN relay) and generates the `WireGuard` peer entries both
//! sides install. [`TopologyEngine`] is the entry point.
//!
//! ```no_run
//! use edge_topology::{EngineConfig, NewVirtualNetwork, OrganizationId, TopologyEngine};
//!
//! let engine = TopologyEngine::new(EngineConfig::default());
//! let network = engine.create_virtual_network(NewVirtualNetwork {
//!     organization_id: OrganizationId::new(),
//!     name: "office".to_string(),
//!     cidr: "10.100.0.0/24".parse()?,
//!     gateway: "10.100.0.1".parse()?,
//!     dns_servers: Vec::new(),
//!     relay_region: None,
//! })?;
//! # let _ = network;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]

pub mod allocation;
pub mod clock;
pub mod config;
pub mod error;
pub mod nat;
pub mod peer;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod strategy;
pub mod tasks;
pub mod topology;
pub mod types;

pub use allocation::{AddressAllocator, AllocationError, PoolStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use error::{Result, TopologyError};
pub use nat::{Classification, NatClassifier, NatError, ProbeReport, ProbeSource};
pub use peer::{PeerConfigError, PeerConfiguration, PeerView};
pub use relay::{RelayAssignment, RelayError, RelayHealthCheck, RelayPool, RelayServer};
pub use scheduler::{ScheduledTask, Scheduler, SchedulerHandle};
pub use session::{EndReason, PeerMetrics, Session, SessionState, SessionStats};
pub use strategy::{ConnectivityPlan, Strategy};
pub use tasks::{NatCachePurgeTask, ReevaluationTask, RelayProbeTask, SessionSweepTask};
pub use topology::{
    DeviceStatus, HeartbeatOutcome, HeartbeatReport, NewVirtualNetwork, ReevaluationSummary,
    RegisterDevice, Registration, RevocationSummary, SweepSummary, TopologyEngine,
};
pub use types::{
    ConnectionType, Device, DeviceId, DevicePair, NatCategory, OrganizationId, Platform,
    RelayServerId, SessionId, VirtualNetwork, VirtualNetworkId,
};
