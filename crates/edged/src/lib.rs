//! # edged
//!
//! Control-plane daemon for an EdgeLink mesh.
//!
//! Loads a TOML configuration, seeds the topology engine with the configured
//! virtual networks and relay servers, and drives the periodic maintenance
//! tasks (session sweep, re-evaluation, relay probing and NAT cache purge)
//! until shutdown.

#![forbid(unsafe_code)]

pub mod config;
pub mod daemon;
pub mod health;

pub use config::{DaemonConfig, NetworkSeed, RelaySeed, ScheduleConfig};
pub use daemon::{run, scheduler, seed};
pub use health::TcpConnectCheck;
