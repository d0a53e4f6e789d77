//! Core types for the EdgeLink mesh.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use chrono::{DateTime, Utc};
use edge_wireguard::PublicKey;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from a UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a registered device.
    DeviceId
);
uuid_id!(
    /// Unique identifier for a virtual network.
    VirtualNetworkId
);
uuid_id!(
    /// Unique identifier for the organization owning virtual networks.
    OrganizationId
);
uuid_id!(
    /// Unique identifier for a peer session.
    SessionId
);
uuid_id!(
    /// Unique identifier for a TURN relay server.
    RelayServerId
);

/// NAT behavior class of a device, as seen by the probe servers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NatCategory {
    /// Any external host may reach the mapped port.
    FullCone,
    /// Only hosts the device has contacted may reach it, on any port.
    RestrictedCone,
    /// Only the exact address and port the device contacted may reach it.
    PortRestrictedCone,
    /// The external mapping changes per destination.
    Symmetric,
    /// Not yet classified, or probing was inconclusive.
    #[default]
    Unknown,
}

impl NatCategory {
    /// Every category, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::FullCone,
        Self::RestrictedCone,
        Self::PortRestrictedCone,
        Self::Symmetric,
        Self::Unknown,
    ];

    /// Returns true for the three cone categories, where hole punching works.
    #[must_use]
    pub const fn is_cone(self) -> bool {
        matches!(
            self,
            Self::FullCone | Self::RestrictedCone | Self::PortRestrictedCone
        )
    }
}

impl fmt::Display for NatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FullCone => "full_cone",
            Self::RestrictedCone => "restricted_cone",
            Self::PortRestrictedCone => "port_restricted_cone",
            Self::Symmetric => "symmetric",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// How the tunnel between two devices is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// UDP hole punched straight between the two devices.
    P2pDirect,
    /// Traffic forwarded through a TURN relay.
    TurnRelay,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::P2pDirect => f.write_str("p2p_direct"),
            Self::TurnRelay => f.write_str("turn_relay"),
        }
    }
}

/// Operating system family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Linux.
    Linux,
    /// macOS.
    MacOs,
    /// Windows.
    Windows,
    /// iOS.
    Ios,
    /// Android.
    Android,
    /// Anything else.
    Other,
}

/// Errors raised while validating a virtual network definition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The CIDR lies outside the private IPv4 ranges.
    #[error("CIDR {cidr} is not inside a private IPv4 range")]
    NotPrivate {
        /// The rejected CIDR.
        cidr: Ipv4Net,
    },
    /// The CIDR leaves no room for a gateway and at least one device.
    #[error("CIDR {cidr} is too small; use a prefix of /30 or shorter")]
    TooSmall {
        /// The rejected CIDR.
        cidr: Ipv4Net,
    },
    /// The gateway is outside the CIDR or is its network/broadcast address.
    #[error("gateway {gateway} is not a usable host address in {cidr}")]
    InvalidGateway {
        /// The rejected gateway.
        gateway: Ipv4Addr,
        /// The network CIDR.
        cidr: Ipv4Net,
    },
    /// The name is empty.
    #[error("virtual network name must not be empty")]
    EmptyName,
}

const PRIVATE_RANGES: [(Ipv4Addr, u8); 3] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// Returns true if the whole CIDR lies inside one RFC 1918 block.
#[must_use]
pub fn is_private_cidr(cidr: &Ipv4Net) -> bool {
    PRIVATE_RANGES.iter().any(|(addr, prefix)| {
        Ipv4Net::new(*addr, *prefix).is_ok_and(|block| block.contains(cidr))
    })
}

/// An isolated private IPv4 address space owned by one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNetwork {
    /// Network identifier.
    pub id: VirtualNetworkId,
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// Human readable name.
    pub name: String,
    /// Address space, e.g. `10.100.0.0/16`.
    pub cidr: Ipv4Net,
    /// Gateway address, never handed to a device.
    pub gateway: Ipv4Addr,
    /// DNS servers pushed to clients.
    pub dns_servers: Vec<IpAddr>,
    /// Preferred relay region for sessions in this network.
    pub relay_region: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl VirtualNetwork {
    /// Validates and builds a virtual network.
    ///
    /// # Errors
    ///
    /// Returns a [`NetworkError`] if the CIDR is not private or too small,
    /// or the gateway is not a usable host inside it.
    pub fn new(
        organization_id: OrganizationId,
        name: impl Into<String>,
        cidr: Ipv4Net,
        gateway: Ipv4Addr,
        created_at: DateTime<Utc>,
    ) -> Result<Self, NetworkError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(NetworkError::EmptyName);
        }
        let cidr = cidr.trunc();
        if !is_private_cidr(&cidr) {
            return Err(NetworkError::NotPrivate { cidr });
        }
        if cidr.prefix_len() > 30 {
            return Err(NetworkError::TooSmall { cidr });
        }
        if !cidr.contains(&gateway) || gateway == cidr.network() || gateway == cidr.broadcast() {
            return Err(NetworkError::InvalidGateway { gateway, cidr });
        }

        Ok(Self {
            id: VirtualNetworkId::new(),
            organization_id,
            name,
            cidr,
            gateway,
            dns_servers: Vec::new(),
            relay_region: None,
            created_at,
        })
    }

    /// Sets the DNS servers.
    #[must_use]
    pub fn with_dns_servers(mut self, dns_servers: Vec<IpAddr>) -> Self {
        self.dns_servers = dns_servers;
        self
    }

    /// Sets the preferred relay region.
    #[must_use]
    pub fn with_relay_region(mut self, region: impl Into<String>) -> Self {
        self.relay_region = Some(region.into());
        self
    }

    /// Returns true if the two address spaces share any address.
    #[must_use]
    pub fn overlaps(&self, other: &Ipv4Net) -> bool {
        self.cidr.contains(other) || other.contains(&self.cidr)
    }
}

/// A registered endpoint holding one `WireGuard` key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device identifier.
    pub id: DeviceId,
    /// Network the device belongs to.
    pub virtual_network_id: VirtualNetworkId,
    /// Display name.
    pub name: String,
    /// Operating system family.
    pub platform: Platform,
    /// Address inside the virtual network.
    pub virtual_ip: Ipv4Addr,
    /// `WireGuard` public key.
    pub public_key: PublicKey,
    /// Current NAT classification.
    pub nat_category: NatCategory,
    /// Public address as observed by the probe servers.
    pub public_endpoint: Option<SocketAddr>,
    /// LAN address reported by the device.
    pub local_address: Option<SocketAddr>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat time.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Set once the device is revoked.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Device {
    /// Returns true once the device has been revoked.
    #[must_use]
    pub const fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Returns true if the device heartbeated within `window` of `now`.
    #[must_use]
    pub fn is_online(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        !self.is_revoked() && self.last_seen_at.is_some_and(|seen| now - seen <= window)
    }
}

/// An unordered pair of distinct devices, stored smallest id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePair {
    first: DeviceId,
    second: DeviceId,
}

impl DevicePair {
    /// Builds the canonical pair, or `None` if both ids are the same device.
    #[must_use]
    pub fn new(x: DeviceId, y: DeviceId) -> Option<Self> {
        match x.cmp(&y) {
            std::cmp::Ordering::Less => Some(Self { first: x, second: y }),
            std::cmp::Ordering::Greater => Some(Self { first: y, second: x }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// The device with the smaller id.
    #[must_use]
    pub const fn first(&self) -> DeviceId {
        self.first
    }

    /// The device with the larger id.
    #[must_use]
    pub const fn second(&self) -> DeviceId {
        self.second
    }

    /// Returns true if the device is one side of the pair.
    #[must_use]
    pub fn contains(&self, device: DeviceId) -> bool {
        self.first == device || self.second == device
    }

    /// Returns the other side of the pair.
    #[must_use]
    pub fn other(&self, device: DeviceId) -> Option<DeviceId> {
        if device == self.first {
            Some(self.second)
        } else if device == self.second {
            Some(self.first)
        } else {
            None
        }
    }
}

impl fmt::Display for DevicePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.first, self.second)
    }
}
