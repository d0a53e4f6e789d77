//! WireGuard client configuration generation.
//!
//! Produces the INI-style format consumed by `wg-quick`. Output is fully
//! determined by the input, so clients can diff successive renders.

use std::collections::HashSet;
use std::fmt::Write as FmtWrite;
use std::net::IpAddr;

use crate::error::{Result, WireGuardError};
use crate::keys::{PrivateKey, PublicKey};
use crate::types::{AllowedIp, Endpoint};

/// Configuration for a local WireGuard interface.
#[derive(Clone, Debug)]
pub struct InterfaceConfig {
    /// The interface's private key.
    pub private_key: PrivateKey,
    /// Optional listen port.
    pub listen_port: Option<u16>,
    /// Addresses assigned to this interface.
    pub addresses: Vec<AllowedIp>,
    /// DNS servers pushed to the client.
    pub dns: Vec<IpAddr>,
    /// Configured peers.
    pub peers: Vec<PeerConfig>,
}

impl InterfaceConfig {
    /// Creates a new interface configuration with the given private key.
    #[must_use]
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            private_key,
            listen_port: None,
            addresses: Vec::new(),
            dns: Vec::new(),
            peers: Vec::new(),
        }
    }

    /// Sets the listen port.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Adds an address.
    #[must_use]
    pub fn with_address(mut self, address: AllowedIp) -> Self {
        self.addresses.push(address);
        self
    }

    /// Adds a DNS server.
    #[must_use]
    pub fn with_dns(mut self, dns: IpAddr) -> Self {
        self.dns.push(dns);
        self
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }
}

/// Configuration for a WireGuard peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConfig {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Allowed IPs for this peer.
    pub allowed_ips: Vec<AllowedIp>,
    /// Optional endpoint.
    pub endpoint: Option<Endpoint>,
    /// Optional persistent keepalive interval.
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// Creates a new peer config with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    /// Adds an allowed IP.
    #[must_use]
    pub fn with_allowed_ip(mut self, ip: AllowedIp) -> Self {
        self.allowed_ips.push(ip);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the persistent keepalive interval. Zero disables keepalive.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = (seconds > 0).then_some(seconds);
        self
    }
}

/// Checks a configuration for structural problems before it is rendered.
///
/// # Errors
///
/// Returns [`WireGuardError::InvalidConfig`] if the interface has no
/// address, a peer has no allowed IPs, or two peers share a public key.
pub fn validate(config: &InterfaceConfig) -> Result<()> {
    if config.addresses.is_empty() {
        return Err(WireGuardError::InvalidConfig(
            "interface address is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for (index, peer) in config.peers.iter().enumerate() {
        if peer.allowed_ips.is_empty() {
            return Err(WireGuardError::InvalidConfig(format!(
                "peer {index}: at least one allowed IP is required"
            )));
        }
        if !seen.insert(peer.public_key) {
            return Err(WireGuardError::InvalidConfig(format!(
                "peer {index}: duplicate public key {}",
                peer.public_key
            )));
        }
    }

    Ok(())
}

/// Renders a `wg-quick` configuration file from an `InterfaceConfig`.
#[must_use]
pub fn render_wg_quick(config: &InterfaceConfig) -> String {
    let mut output = String::new();

    output.push_str("[Interface]\n");
    let _ = writeln!(output, "PrivateKey = {}", config.private_key.to_base64());

    for addr in &config.addresses {
        let _ = writeln!(output, "Address = {}", addr.to_cidr());
    }

    if let Some(port) = config.listen_port {
        let _ = writeln!(output, "ListenPort = {port}");
    }

    if !config.dns.is_empty() {
        let dns_str: Vec<String> = config.dns.iter().map(ToString::to_string).collect();
        let _ = writeln!(output, "DNS = {}", dns_str.join(", "));
    }

    for peer in &config.peers {
        output.push('\n');
        output.push_str("[Peer]\n");
        let _ = writeln!(output, "PublicKey = {}", peer.public_key.to_base64());

        if !peer.allowed_ips.is_empty() {
            let ips: Vec<String> = peer.allowed_ips.iter().map(AllowedIp::to_cidr).collect();
            let _ = writeln!(output, "AllowedIPs = {}", ips.join(", "));
        }

        if let Some(ref endpoint) = peer.endpoint {
            let _ = writeln!(output, "Endpoint = {endpoint}");
        }

        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(output, "PersistentKeepalive = {keepalive}");
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    fn peer(allowed: &str) -> PeerConfig {
        PeerConfig::new(*KeyPair::generate().public_key())
            .with_allowed_ip(allowed.parse().expect("cidr"))
    }

    fn interface() -> InterfaceConfig {
        InterfaceConfig::new(PrivateKey::generate())
            .with_address("10.100.0.2/29".parse().expect("cidr"))
            .with_listen_port(51820)
    }

    #[test]
    fn test_render_interface_section() {
        let config = interface().with_dns("10.100.0.1".parse().expect("ip"));
        let rendered = render_wg_quick(&config);

        assert!(rendered.starts_with("[Interface]\n"));
        assert!(rendered.contains("Address = 10.100.0.2/29\n"));
        assert!(rendered.contains("ListenPort = 51820\n"));
        assert!(rendered.contains("DNS = 10.100.0.1\n"));
        assert!(!rendered.contains("[Peer]"));
    }

    #[test]
    fn test_render_peer_section() {
        let endpoint: Endpoint = "198.51.100.4:3478".parse().expect("endpoint");
        let p = peer("10.100.0.3/32")
            .with_endpoint(endpoint)
            .with_persistent_keepalive(25);
        let key = p.public_key.to_base64();
        let rendered = render_wg_quick(&interface().with_peer(p));

        assert!(rendered.contains(&format!("PublicKey = {key}\n")));
        assert!(rendered.contains("AllowedIPs = 10.100.0.3/32\n"));
        assert!(rendered.contains("Endpoint = 198.51.100.4:3478\n"));
        assert!(rendered.contains("PersistentKeepalive = 25\n"));
    }

    #[test]
    fn test_zero_keepalive_is_omitted() {
        let p = peer("10.100.0.3/32").with_persistent_keepalive(0);
        assert!(p.persistent_keepalive.is_none());
        let rendered = render_wg_quick(&interface().with_peer(p));
        assert!(!rendered.contains("PersistentKeepalive"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let config = interface().with_peer(peer("10.100.0.3/32")).with_peer(peer("10.100.0.4/32"));
        assert_eq!(render_wg_quick(&config), render_wg_quick(&config));
    }

    #[test]
    fn test_validate_requires_address() {
        let config = InterfaceConfig::new(PrivateKey::generate());
        assert!(matches!(validate(&config), Err(WireGuardError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_requires_allowed_ips() {
        let empty = PeerConfig::new(*KeyPair::generate().public_key());
        let config = interface().with_peer(empty);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_peer_keys() {
        let p = peer("10.100.0.3/32");
        let config = interface().with_peer(p.clone()).with_peer(p);
        let err = validate(&config).expect_err("duplicate key");
        assert!(err.to_string().contains("duplicate public key"));
    }

    #[test]
    fn test_validate_accepts_well_formed_config() {
        let config = interface().with_peer(peer("10.100.0.3/32"));
        assert!(validate(&config).is_ok());
    }
}
