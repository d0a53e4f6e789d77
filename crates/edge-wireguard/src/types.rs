//! Address types shared by peer and interface configuration.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};

/// An allowed IP address or network in CIDR notation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllowedIp { network: IpNet }

impl AllowedIp {
    /// Creates a new allowed IP from an `IpNet`.
    #[must_use]
    pub fn new(network: IpNet) -> Self { Self { network } }

    /// Creates a single-host entry (`/32` or `/128`).
    #[must_use]
    pub fn host(ip: IpAddr) -> Self { Self { network: IpNet::from(ip) } }

    /// Returns the network.
    #[must_use]
    pub fn network(&self) -> &IpNet { &self.network }

    /// Creates an allowed IP from CIDR notation.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR notation is invalid.
    pub fn from_cidr(s: &str) -> Result<Self> {
        let network = s.parse::<IpNet>().map_err(|e| WireGuardError::InvalidCidr(e.to_string()))?;
        Ok(Self { network })
    }

    /// Returns the CIDR string representation.
    #[must_use]
    pub fn to_cidr(&self) -> String { self.network.to_string() }
}

impl FromStr for AllowedIp {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> { Self::from_cidr(s) }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.network) }
}

/// A `WireGuard` peer endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint { address: SocketAddr }

impl Endpoint {
    /// Creates a new endpoint from a socket address.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self { Self { address } }

    /// Returns the socket address.
    #[must_use]
    pub fn address(&self) -> &SocketAddr { &self.address }
}

impl FromStr for Endpoint {
    type Err = WireGuardError;
    fn from_str(s: &str) -> Result<Self> {
        let address = s.parse::<SocketAddr>().map_err(|e| WireGuardError::InvalidEndpoint(e.to_string()))?;
        Ok(Self { address })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.address) }
}
