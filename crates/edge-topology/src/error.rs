//! Crate-level error type.

use ipnet::Ipv4Net;

use crate::allocation::AllocationError;
use crate::config::ConfigError;
use crate::nat::NatError;
use crate::peer::PeerConfigError;
use crate::relay::RelayError;
use crate::session::SessionError;
use crate::types::{DeviceId, NetworkError, VirtualNetworkId};

/// Errors returned by the topology engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// Address allocation failed.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// The virtual network definition is invalid.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// NAT probing failed.
    #[error(transparent)]
    Nat(#[from] NatError),
    /// Relay pool failure.
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// Peer configuration could not be generated.
    #[error(transparent)]
    PeerConfig(#[from] PeerConfigError),
    /// Session bookkeeping failure.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Key or client config failure.
    #[error(transparent)]
    WireGuard(#[from] edge_wireguard::WireGuardError),
    /// The virtual network does not exist.
    #[error("virtual network {id} not found")]
    NetworkNotFound {
        /// The network.
        id: VirtualNetworkId,
    },
    /// A sibling network already uses part of the address space.
    #[error("CIDR {cidr} overlaps network {existing} ({existing_cidr})")]
    NetworkOverlap {
        /// The requested CIDR.
        cidr: Ipv4Net,
        /// The network it collides with.
        existing: VirtualNetworkId,
        /// That network's CIDR.
        existing_cidr: Ipv4Net,
    },
    /// The device does not exist.
    #[error("device {id} not found")]
    DeviceNotFound {
        /// The device.
        id: DeviceId,
    },
    /// The device has been revoked.
    #[error("device {id} is revoked")]
    DeviceRevoked {
        /// The device.
        id: DeviceId,
    },
    /// Another active device already uses the public key.
    #[error("public key is already registered to device {existing}")]
    PublicKeyInUse {
        /// The device holding the key.
        existing: DeviceId,
    },
    /// The supplied private key does not match the registered public key.
    #[error("private key does not belong to device {id}")]
    KeyMismatch {
        /// The device.
        id: DeviceId,
    },
}

impl TopologyError {
    /// A stable machine-readable code for API responses.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Allocation(AllocationError::Exhausted { .. }) => "allocation_exhausted",
            Self::Allocation(_) => "allocation_failed",
            Self::Network(_) => "invalid_network",
            Self::Nat(_) => "nat_probe_failed",
            Self::Relay(RelayError::NoHealthyRelay) => "no_healthy_relay",
            Self::Relay(_) => "relay_error",
            Self::PeerConfig(PeerConfigError::InvalidAllowedIps { .. }) => "invalid_allowed_ips",
            Self::PeerConfig(_) => "peer_config_error",
            Self::Session(_) => "session_error",
            Self::Config(_) => "invalid_config",
            Self::WireGuard(_) => "invalid_key",
            Self::NetworkNotFound { .. } => "network_not_found",
            Self::NetworkOverlap { .. } => "network_overlap",
            Self::DeviceNotFound { .. } => "device_not_found",
            Self::DeviceRevoked { .. } => "device_revoked",
            Self::PublicKeyInUse { .. } => "public_key_in_use",
            Self::KeyMismatch { .. } => "key_mismatch",
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, TopologyError>;
