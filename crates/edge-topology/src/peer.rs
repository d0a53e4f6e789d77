//! Peer configuration generation.
//!
//! For every pair the generator produces one canonical record holding two
//! directional views: what the first device installs to reach the second,
//! and the reverse. Identical inputs serialize to identical bytes.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};

use edge_wireguard::{AllowedIp, Endpoint, PeerConfig, PublicKey};
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::relay::{RelayAssignment, TurnCredentials};
use crate::strategy::ConnectivityPlan;
use crate::types::{ConnectionType, Device, DeviceId, DevicePair, NatCategory, VirtualNetwork, VirtualNetworkId};

/// Extra routes reachable through a device, keyed by device.
pub type RouteOverrides = BTreeMap<DeviceId, Vec<Ipv4Net>>;

/// Errors from peer configuration generation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerConfigError {
    /// An allowed-IP override falls outside the virtual network.
    #[error("allowed IPs {route} for device {device_id} fall outside network {cidr}")]
    InvalidAllowedIps {
        /// The device the route goes through.
        device_id: DeviceId,
        /// The offending route.
        route: Ipv4Net,
        /// The network's CIDR.
        cidr: Ipv4Net,
    },
    /// The devices belong to different networks.
    #[error("devices {a} and {b} are not in the same virtual network")]
    NetworkMismatch {
        /// First device.
        a: DeviceId,
        /// Second device.
        b: DeviceId,
    },
    /// A device is revoked.
    #[error("device {device_id} is revoked")]
    Revoked {
        /// The device.
        device_id: DeviceId,
    },
    /// A device cannot peer with itself.
    #[error("device {device_id} cannot peer with itself")]
    SelfPeer {
        /// The device.
        device_id: DeviceId,
    },
}

/// What one device installs to reach one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerView {
    /// The peer.
    pub peer_device_id: DeviceId,
    /// The peer's public key.
    pub peer_public_key: PublicKey,
    /// The peer's virtual address.
    pub peer_virtual_ip: Ipv4Addr,
    /// Routes sent to the peer: its `/32` plus any overrides. Sorted.
    pub allowed_ips: Vec<Ipv4Net>,
    /// Where to send packets: the peer's public endpoint or the relay.
    pub endpoint: Option<SocketAddr>,
    /// Keepalive interval; `None` when both sides are full cone.
    pub persistent_keepalive_seconds: Option<u16>,
    /// Direct or relayed.
    pub connection_type: ConnectionType,
    /// How to attempt the connection: strategy, attempt timeout, retry
    /// budget and backoff schedule.
    pub plan: ConnectivityPlan,
    /// TURN credentials for the relay allocation. Relayed views only.
    pub relay_credentials: Option<TurnCredentials>,
}

impl PeerView {
    /// Converts the view into a `WireGuard` `[Peer]` entry.
    #[must_use]
    pub fn to_wireguard(&self) -> PeerConfig {
        let mut peer = self
            .allowed_ips
            .iter()
            .fold(PeerConfig::new(self.peer_public_key), |peer, net| {
                peer.with_allowed_ip(AllowedIp::new(IpNet::V4(*net)))
            });
        if let Some(endpoint) = self.endpoint {
            peer = peer.with_endpoint(Endpoint::new(endpoint));
        }
        if let Some(keepalive) = self.persistent_keepalive_seconds {
            peer = peer.with_persistent_keepalive(keepalive);
        }
        peer
    }
}

/// Routing policy for one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfiguration {
    /// The pair.
    pub pair: DevicePair,
    /// The network.
    pub virtual_network_id: VirtualNetworkId,
    /// Installed by the first device; describes the second.
    pub first_view: PeerView,
    /// Installed by the second device; describes the first.
    pub second_view: PeerView,
}

impl PeerConfiguration {
    /// The view a device installs, or `None` if it is not in the pair.
    #[must_use]
    pub fn view_for(&self, device_id: DeviceId) -> Option<&PeerView> {
        if device_id == self.pair.first() {
            Some(&self.first_view)
        } else if device_id == self.pair.second() {
            Some(&self.second_view)
        } else {
            None
        }
    }

    /// Canonical JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Builds peer configurations.
#[derive(Debug, Clone)]
pub struct PeerConfigGenerator {
    keepalive_secs: u16,
}

impl Default for PeerConfigGenerator {
    fn default() -> Self {
        Self::new(25)
    }
}

impl PeerConfigGenerator {
    /// Creates a generator with the given default keepalive.
    #[must_use]
    pub const fn new(keepalive_secs: u16) -> Self {
        Self { keepalive_secs }
    }

    /// Generates the configuration for two devices.
    ///
    /// The argument order of `x` and `y` does not matter.
    ///
    /// # Errors
    ///
    /// Returns an error if the devices are the same, revoked, in different
    /// networks, or an override lies outside the network.
    pub fn generate(
        &self,
        network: &VirtualNetwork,
        x: &Device,
        y: &Device,
        plan: &ConnectivityPlan,
        relay: Option<&RelayAssignment>,
        overrides: &RouteOverrides,
    ) -> Result<PeerConfiguration, PeerConfigError> {
        let pair = DevicePair::new(x.id, y.id).ok_or(PeerConfigError::SelfPeer { device_id: x.id })?;
        let (first, second) = if x.id == pair.first() { (x, y) } else { (y, x) };

        for device in [first, second] {
            if device.is_revoked() {
                return Err(PeerConfigError::Revoked {
                    device_id: device.id,
                });
            }
        }
        if first.virtual_network_id != network.id || second.virtual_network_id != network.id {
            return Err(PeerConfigError::NetworkMismatch {
                a: first.id,
                b: second.id,
            });
        }

        let keepalive = (plan.connection_type() == ConnectionType::TurnRelay
            || !(first.nat_category == NatCategory::FullCone
                && second.nat_category == NatCategory::FullCone))
            .then_some(self.keepalive_secs)
            .filter(|secs| *secs > 0);

        // The first device installs a view of the second, and vice versa.
        let first_view = self.view_of(network, second, plan, relay, overrides, keepalive)?;
        let second_view = self.view_of(network, first, plan, relay, overrides, keepalive)?;

        Ok(PeerConfiguration {
            pair,
            virtual_network_id: network.id,
            first_view,
            second_view,
        })
    }

    fn view_of(
        &self,
        network: &VirtualNetwork,
        peer: &Device,
        plan: &ConnectivityPlan,
        relay: Option<&RelayAssignment>,
        overrides: &RouteOverrides,
        keepalive: Option<u16>,
    ) -> Result<PeerView, PeerConfigError> {
        let mut allowed_ips = vec![Ipv4Net::from(peer.virtual_ip)];
        for route in overrides.get(&peer.id).into_iter().flatten() {
            let route = route.trunc();
            if !network.cidr.contains(&route) {
                return Err(PeerConfigError::InvalidAllowedIps {
                    device_id: peer.id,
                    route,
                    cidr: network.cidr,
                });
            }
            allowed_ips.push(route);
        }
        allowed_ips.sort();
        allowed_ips.dedup();

        let (endpoint, relay_credentials) = match plan.connection_type() {
            ConnectionType::TurnRelay => (
                relay.map(|r| r.relay_address),
                relay.map(|r| r.credentials.clone()),
            ),
            ConnectionType::P2pDirect => (peer.public_endpoint, None),
        };

        Ok(PeerView {
            peer_device_id: peer.id,
            peer_public_key: peer.public_key,
            peer_virtual_ip: peer.virtual_ip,
            allowed_ips,
            endpoint,
            persistent_keepalive_seconds: keepalive,
            connection_type: plan.connection_type(),
            plan: plan.clone(),
            relay_credentials,
        })
    }
}

/// Returns the interface address for a device: its virtual IP with the
/// network's prefix length.
#[must_use]
pub fn interface_address(network: &VirtualNetwork, device: &Device) -> AllowedIp {
    let net = Ipv4Net::new(device.virtual_ip, network.cidr.prefix_len())
        .unwrap_or_else(|_| Ipv4Net::from(device.virtual_ip));
    AllowedIp::new(IpNet::V4(net))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{ConnectivityStrategist, Strategy};
    use crate::types::{OrganizationId, Platform, RelayServerId, SessionId};
    use chrono::Utc;
    use edge_wireguard::KeyPair;

    fn network() -> VirtualNetwork {
        VirtualNetwork::new(
            OrganizationId::new(),
            "lab",
            "10.100.0.0/24".parse().expect("cidr"),
            Ipv4Addr::new(10, 100, 0, 1),
            Utc::now(),
        )
        .expect("valid network")
    }

    fn device(network: &VirtualNetwork, last_octet: u8, nat: NatCategory) -> Device {
        Device {
            id: DeviceId::new(),
            virtual_network_id: network.id,
            name: format!("dev-{last_octet}"),
            platform: Platform::Linux,
            virtual_ip: Ipv4Addr::new(10, 100, 0, last_octet),
            public_key: *KeyPair::generate().public_key(),
            nat_category: nat,
            public_endpoint: Some(format!("192.0.2.{last_octet}:51820").parse().expect("addr")),
            local_address: None,
            registered_at: Utc::now(),
            last_seen_at: Some(Utc::now()),
            revoked_at: None,
        }
    }

    fn plan(a: NatCategory, b: NatCategory) -> ConnectivityPlan {
        ConnectivityStrategist::default().plan(a, b)
    }

    fn relay_assignment() -> RelayAssignment {
        RelayAssignment {
            session_id: SessionId::new(),
            relay_server_id: RelayServerId::new(),
            relay_address: "198.51.100.9:3478".parse().expect("addr"),
            assigned_at: Utc::now(),
            credentials: TurnCredentials {
                username: "u".to_string(),
                password: "p".to_string(),
                expires_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_views_are_symmetric() {
        let net = network();
        let a = device(&net, 2, NatCategory::RestrictedCone);
        let b = device(&net, 3, NatCategory::PortRestrictedCone);
        let p = plan(a.nat_category, b.nat_category);
        let generator = PeerConfigGenerator::default();

        let config = generator
            .generate(&net, &a, &b, &p, None, &RouteOverrides::new())
            .expect("generate");
        let view_a = config.view_for(a.id).expect("a in pair");
        let view_b = config.view_for(b.id).expect("b in pair");

        assert_eq!(view_a.peer_device_id, b.id);
        assert_eq!(view_a.peer_public_key, b.public_key);
        assert_eq!(view_a.allowed_ips, vec![Ipv4Net::from(b.virtual_ip)]);
        assert_eq!(view_a.endpoint, b.public_endpoint);
        assert_eq!(view_b.peer_device_id, a.id);
        assert_eq!(view_b.endpoint, a.public_endpoint);
        assert_eq!(view_a.persistent_keepalive_seconds, Some(25));
        assert!(config.view_for(DeviceId::new()).is_none());
    }

    #[test]
    fn test_argument_order_does_not_matter() {
        let net = network();
        let a = device(&net, 2, NatCategory::FullCone);
        let b = device(&net, 3, NatCategory::FullCone);
        let p = plan(a.nat_category, b.nat_category);
        let generator = PeerConfigGenerator::default();
        let overrides = RouteOverrides::new();

        let ab = generator.generate(&net, &a, &b, &p, None, &overrides).expect("generate");
        let ba = generator.generate(&net, &b, &a, &p, None, &overrides).expect("generate");
        assert_eq!(
            ab.to_canonical_bytes().expect("bytes"),
            ba.to_canonical_bytes().expect("bytes")
        );
    }

    #[test]
    fn test_full_cone_pair_omits_keepalive() {
        let net = network();
        let a = device(&net, 2, NatCategory::FullCone);
        let b = device(&net, 3, NatCategory::FullCone);
        let config = PeerConfigGenerator::default()
            .generate(&net, &a, &b, &plan(a.nat_category, b.nat_category), None, &RouteOverrides::new())
            .expect("generate");
        assert_eq!(config.first_view.persistent_keepalive_seconds, None);
        assert_eq!(config.second_view.persistent_keepalive_seconds, None);
    }

    #[test]
    fn test_relay_plan_points_both_sides_at_relay() {
        let net = network();
        let a = device(&net, 2, NatCategory::FullCone);
        let b = device(&net, 3, NatCategory::Symmetric);
        let p = plan(a.nat_category, b.nat_category);
        assert_eq!(p.strategy, Strategy::Relay);
        let relay = relay_assignment();

        let config = PeerConfigGenerator::default()
            .generate(&net, &a, &b, &p, Some(&relay), &RouteOverrides::new())
            .expect("generate");
        for view in [&config.first_view, &config.second_view] {
            assert_eq!(view.endpoint, Some(relay.relay_address));
            assert_eq!(view.persistent_keepalive_seconds, Some(25));
            assert_eq!(view.connection_type, ConnectionType::TurnRelay);
            assert_eq!(view.relay_credentials.as_ref(), Some(&relay.credentials));
            assert_eq!(view.plan.strategy, Strategy::Relay);
        }
    }

    #[test]
    fn test_retry_views_carry_backoff_schedule() {
        let net = network();
        let a = device(&net, 2, NatCategory::RestrictedCone);
        let b = device(&net, 3, NatCategory::PortRestrictedCone);
        let p = plan(a.nat_category, b.nat_category);

        let config = PeerConfigGenerator::default()
            .generate(&net, &a, &b, &p, None, &RouteOverrides::new())
            .expect("generate");
        for view in [&config.first_view, &config.second_view] {
            assert_eq!(view.plan.strategy, Strategy::DirectWithRetry);
            assert_eq!(
                view.plan.backoff,
                vec![
                    std::time::Duration::from_millis(500),
                    std::time::Duration::from_secs(1),
                    std::time::Duration::from_secs(2),
                ]
            );
            assert_eq!(view.plan.max_attempts, 4);
            assert_eq!(view.plan.attempt_timeout, std::time::Duration::from_secs(5));
            assert!(view.relay_credentials.is_none());
        }
    }

    #[test]
    fn test_overrides_are_sorted_and_deduplicated() {
        let net = network();
        let a = device(&net, 2, NatCategory::FullCone);
        let b = device(&net, 3, NatCategory::FullCone);
        let mut overrides = RouteOverrides::new();
        overrides.insert(
            b.id,
            vec![
                "10.100.0.128/25".parse().expect("cidr"),
                "10.100.0.64/26".parse().expect("cidr"),
                "10.100.0.130/25".parse().expect("cidr"),
            ],
        );

        let config = PeerConfigGenerator::default()
            .generate(&net, &a, &b, &plan(a.nat_category, b.nat_category), None, &overrides)
            .expect("generate");
        let view_a = config.view_for(a.id).expect("view");
        assert_eq!(
            view_a.allowed_ips,
            vec![
                "10.100.0.3/32".parse::<Ipv4Net>().expect("cidr"),
                "10.100.0.64/26".parse().expect("cidr"),
                "10.100.0.128/25".parse().expect("cidr"),
            ]
        );
        assert_eq!(config.view_for(b.id).expect("view").allowed_ips.len(), 1);
    }

    #[test]
    fn test_override_outside_network_rejected() {
        let net = network();
        let a = device(&net, 2, NatCategory::FullCone);
        let b = device(&net, 3, NatCategory::FullCone);
        let mut overrides = RouteOverrides::new();
        overrides.insert(b.id, vec!["192.168.50.0/24".parse().expect("cidr")]);

        let err = PeerConfigGenerator::default()
            .generate(&net, &a, &b, &plan(a.nat_category, b.nat_category), None, &overrides)
            .expect_err("should reject");
        assert!(matches!(err, PeerConfigError::InvalidAllowedIps { device_id, .. } if device_id == b.id));
    }

    #[test]
    fn test_rejects_revoked_foreign_and_self() {
        let net = network();
        let other_net = network();
        let a = device(&net, 2, NatCategory::FullCone);
        let mut revoked = device(&net, 3, NatCategory::FullCone);
        revoked.revoked_at = Some(Utc::now());
        let foreign = device(&other_net, 4, NatCategory::FullCone);
        let p = plan(NatCategory::FullCone, NatCategory::FullCone);
        let generator = PeerConfigGenerator::default();
        let overrides = RouteOverrides::new();

        assert!(matches!(
            generator.generate(&net, &a, &revoked, &p, None, &overrides),
            Err(PeerConfigError::Revoked { .. })
        ));
        assert!(matches!(
            generator.generate(&net, &a, &foreign, &p, None, &overrides),
            Err(PeerConfigError::NetworkMismatch { .. })
        ));
        assert!(matches!(
            generator.generate(&net, &a, &a, &p, None, &overrides),
            Err(PeerConfigError::SelfPeer { .. })
        ));
    }

    #[test]
    fn test_to_wireguard_and_interface_address() {
        let net = network();
        let a = device(&net, 2, NatCategory::RestrictedCone);
        let b = device(&net, 3, NatCategory::RestrictedCone);
        let config = PeerConfigGenerator::default()
            .generate(&net, &a, &b, &plan(a.nat_category, b.nat_category), None, &RouteOverrides::new())
            .expect("generate");

        let wg = config.view_for(a.id).expect("view").to_wireguard();
        assert_eq!(wg.public_key, b.public_key);
        assert_eq!(wg.allowed_ips[0].to_cidr(), "10.100.0.3/32");
        assert_eq!(wg.persistent_keepalive, Some(25));
        assert_eq!(interface_address(&net, &a).to_cidr(), "10.100.0.2/24");
    }
}
