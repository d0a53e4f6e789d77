//! The topology engine.
//!
//! [`TopologyEngine`] owns every registry and drives the allocator, NAT
//! classifier, strategist, relay pool, peer generator and session tracker for
//! device registration, heartbeats, revocation and periodic re-evaluation.
//!
//! There is no engine-wide lock. Addresses are serialized per network by the
//! allocator, and every write to a pair's session or peer configuration
//! happens under that pair's lock. Lock order is network pool, then pair,
//! then the individual registries.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use edge_wireguard::{InterfaceConfig, PrivateKey, PublicKey};
use ipnet::Ipv4Net;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::allocation::{AddressAllocator, PoolStats};
use crate::clock::{Clock, SystemClock, to_chrono};
use crate::config::EngineConfig;
use crate::error::{Result, TopologyError};
use crate::nat::{Classification, NatClassifier, ProbeReport, ProbeSource};
use crate::peer::{
    PeerConfigError, PeerConfigGenerator, PeerConfiguration, PeerView, RouteOverrides,
    interface_address,
};
use crate::relay::{RelayError, RelayHealthCheck, RelayHints, RelayPool, RelayServer};
use crate::session::{
    EndReason, PeerMetrics, Session, SessionPolicy, SessionState, SessionStats, SessionTracker,
};
use crate::strategy::{ConnectivityStrategist, HolePunchPolicy, Strategy};
use crate::types::{
    Device, DeviceId, DevicePair, NatCategory, OrganizationId, Platform, RelayServerId,
    VirtualNetwork, VirtualNetworkId,
};

/// Request to create a virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVirtualNetwork {
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// Display name.
    pub name: String,
    /// Private IPv4 address space.
    pub cidr: Ipv4Net,
    /// Gateway address inside the CIDR.
    pub gateway: Ipv4Addr,
    /// DNS servers handed to clients.
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    /// Preferred relay region.
    #[serde(default)]
    pub relay_region: Option<String>,
}

/// Request to register a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDevice {
    /// Network to join.
    pub network_id: VirtualNetworkId,
    /// Display name.
    pub name: String,
    /// Base64 `WireGuard` public key.
    pub public_key: String,
    /// Operating system family.
    pub platform: Platform,
    /// Preferred virtual address.
    #[serde(default)]
    pub requested_ip: Option<Ipv4Addr>,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// The new device.
    pub device_id: DeviceId,
    /// Assigned address.
    pub virtual_ip: Ipv4Addr,
    /// Prefix length of the network.
    pub prefix_len: u8,
    /// Network gateway.
    pub gateway: Ipv4Addr,
    /// Initial NAT category, always `Unknown` until the first probe report.
    pub nat_category: NatCategory,
    /// Peers the device should configure right away.
    pub peers: Vec<PeerView>,
}

/// A device heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    /// When the device produced the report. Clamped to the engine's clock.
    pub observed_at: DateTime<Utc>,
    /// The device's LAN address.
    #[serde(default)]
    pub local_address: Option<SocketAddr>,
    /// Public address the device believes it has.
    #[serde(default)]
    pub public_endpoint: Option<SocketAddr>,
    /// Fresh probe observations, if the device ran a round.
    #[serde(default)]
    pub probes: Option<ProbeReport>,
    /// Per-peer tunnel metrics.
    #[serde(default)]
    pub peers: Vec<PeerMetrics>,
}

impl HeartbeatReport {
    /// A bare liveness heartbeat.
    #[must_use]
    pub const fn new(observed_at: DateTime<Utc>) -> Self {
        Self {
            observed_at,
            local_address: None,
            public_endpoint: None,
            probes: None,
            peers: Vec::new(),
        }
    }

    /// Sets the LAN address.
    #[must_use]
    pub fn with_local_address(mut self, address: SocketAddr) -> Self {
        self.local_address = Some(address);
        self
    }

    /// Attaches probe observations.
    #[must_use]
    pub fn with_probes(mut self, probes: ProbeReport) -> Self {
        self.probes = Some(probes);
        self
    }

    /// Adds metrics for one peer.
    #[must_use]
    pub fn with_peer(mut self, metrics: PeerMetrics) -> Self {
        self.peers.push(metrics);
        self
    }
}

/// What a heartbeat changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatOutcome {
    /// NAT category after the heartbeat.
    pub nat_category: NatCategory,
    /// The device moved to a different local network.
    pub network_changed: bool,
    /// Pairs whose configuration was re-evaluated.
    pub reevaluated: Vec<DevicePair>,
    /// Current peers of the device.
    pub peers: Vec<PeerView>,
}

/// What a revocation released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationSummary {
    /// The revoked device.
    pub device_id: DeviceId,
    /// Address returned to the pool.
    pub released_ip: Ipv4Addr,
    /// Sessions ended by the revocation.
    pub ended_sessions: Vec<Session>,
}

/// Read model for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// The device record.
    pub device: Device,
    /// Heartbeated within the liveness window.
    pub online: bool,
    /// Active sessions, then ended ones newest first.
    pub sessions: Vec<Session>,
}

/// Result of a session sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Pairs that went quiet.
    pub degraded: Vec<DevicePair>,
    /// Sessions ended as stale or because a device went offline.
    pub ended: Vec<Session>,
}

/// Result of a re-evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReevaluationSummary {
    /// Direct attempts escalated to relay.
    pub escalated: usize,
    /// Pairs evaluated.
    pub evaluated: usize,
    /// Sessions still pending afterwards.
    pub pending: usize,
    /// Relayed sessions whose TURN credentials were re-issued.
    pub rotated: usize,
}

/// The mesh control plane.
#[derive(Debug)]
pub struct TopologyEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    networks: RwLock<HashMap<VirtualNetworkId, VirtualNetwork>>,
    devices: RwLock<HashMap<DeviceId, Device>>,
    keys: Mutex<HashMap<PublicKey, DeviceId>>,
    routes: RwLock<RouteOverrides>,
    peer_configs: RwLock<HashMap<DevicePair, PeerConfiguration>>,
    pair_locks: Mutex<HashMap<DevicePair, Arc<Mutex<()>>>>,
    allocator: AddressAllocator,
    classifier: NatClassifier,
    strategist: ConnectivityStrategist,
    relays: RelayPool,
    generator: PeerConfigGenerator,
    sessions: SessionTracker,
}

impl TopologyEngine {
    /// Creates an engine on the system clock.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an engine reading time from `clock`.
    #[must_use]
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let policy = SessionPolicy {
            degrade_after: config.liveness.degrade_after(),
            stale_after: config.liveness.stale_after(),
            ..SessionPolicy::default()
        };
        Self {
            allocator: AddressAllocator::new(),
            classifier: NatClassifier::new(config.nat.cache_ttl(), config.nat.probe_timeout()),
            strategist: ConnectivityStrategist::new(HolePunchPolicy::from(&config.hole_punch)),
            relays: RelayPool::new(config.relay.clone()),
            generator: PeerConfigGenerator::new(config.peer.keepalive_secs),
            sessions: SessionTracker::new(policy),
            networks: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            routes: RwLock::new(BTreeMap::new()),
            peer_configs: RwLock::new(HashMap::new()),
            pair_locks: Mutex::new(HashMap::new()),
            clock,
            config,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the current time on the engine's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn liveness_window(&self) -> chrono::Duration {
        to_chrono(self.config.liveness.device_window())
    }

    // ==================== NETWORKS ====================

    /// Creates a virtual network.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR or gateway is invalid, or the CIDR
    /// overlaps another network of the same organization.
    pub fn create_virtual_network(&self, request: NewVirtualNetwork) -> Result<VirtualNetwork> {
        let mut network = VirtualNetwork::new(
            request.organization_id,
            request.name,
            request.cidr,
            request.gateway,
            self.clock.now(),
        )?
        .with_dns_servers(request.dns_servers);
        if let Some(region) = request.relay_region {
            network = network.with_relay_region(region);
        }

        let mut networks = self.networks.write();
        if let Some(existing) = networks
            .values()
            .find(|n| n.organization_id == network.organization_id && n.overlaps(&network.cidr))
        {
            return Err(TopologyError::NetworkOverlap {
                cidr: network.cidr,
                existing: existing.id,
                existing_cidr: existing.cidr,
            });
        }
        self.allocator.register_network(&network);
        networks.insert(network.id, network.clone());

        info!(
            network_id = %network.id,
            organization_id = %network.organization_id,
            cidr = %network.cidr,
            gateway = %network.gateway,
            "Created virtual network"
        );
        Ok(network)
    }

    /// Deletes a network and revokes every device in it. Returns those devices.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::NetworkNotFound`] if it does not exist.
    pub fn delete_virtual_network(&self, network_id: VirtualNetworkId) -> Result<Vec<DeviceId>> {
        let now = self.clock.now();
        let network = self
            .networks
            .write()
            .remove(&network_id)
            .ok_or(TopologyError::NetworkNotFound { id: network_id })?;

        let members: Vec<(DeviceId, PublicKey)> = {
            let mut devices = self.devices.write();
            devices
                .values_mut()
                .filter(|d| d.virtual_network_id == network_id && !d.is_revoked())
                .map(|d| {
                    d.revoked_at = Some(now);
                    (d.id, d.public_key)
                })
                .collect()
        };

        for (device_id, public_key) in &members {
            self.forget_key(*public_key, *device_id);
            self.classifier.invalidate(*device_id);
            self.routes.write().remove(device_id);
            self.teardown_device(*device_id, EndReason::NetworkDeleted, now);
        }
        self.allocator.remove_network(network_id);

        info!(network_id = %network_id, cidr = %network.cidr, devices = members.len(), "Deleted virtual network");
        Ok(members.into_iter().map(|(id, _)| id).collect())
    }

    /// Returns a network.
    #[must_use]
    pub fn network(&self, network_id: VirtualNetworkId) -> Option<VirtualNetwork> {
        self.networks.read().get(&network_id).cloned()
    }

    /// Returns address pool occupancy for a network.
    #[must_use]
    pub fn pool_stats(&self, network_id: VirtualNetworkId) -> Option<PoolStats> {
        self.allocator.stats(network_id)
    }

    // ==================== DEVICES ====================

    /// Registers a device, allocates its address and builds its peer list.
    ///
    /// The device starts with NAT category `Unknown` and counts as online.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is malformed or already in use, the
    /// network does not exist, or the network has no free address.
    pub fn register_device(&self, request: RegisterDevice) -> Result<Registration> {
        let now = self.clock.now();
        let public_key = PublicKey::from_base64(&request.public_key)?;
        let network = self
            .network(request.network_id)
            .ok_or(TopologyError::NetworkNotFound {
                id: request.network_id,
            })?;
        let device_id = DeviceId::new();

        {
            let mut keys = self.keys.lock();
            if let Some(existing) = keys.get(&public_key) {
                return Err(TopologyError::PublicKeyInUse {
                    existing: *existing,
                });
            }
            keys.insert(public_key, device_id);
        }

        let virtual_ip = match self
            .allocator
            .allocate(network.id, device_id, request.requested_ip)
        {
            Ok(ip) => ip,
            Err(e) => {
                self.forget_key(public_key, device_id);
                warn!(network_id = %network.id, error = %e, "Device registration failed");
                return Err(e.into());
            }
        };

        let device = Device {
            id: device_id,
            virtual_network_id: network.id,
            name: request.name,
            platform: request.platform,
            virtual_ip,
            public_key,
            nat_category: NatCategory::Unknown,
            public_endpoint: None,
            local_address: None,
            registered_at: now,
            last_seen_at: Some(now),
            revoked_at: None,
        };
        self.devices.write().insert(device_id, device);
        info!(
            device_id = %device_id,
            network_id = %network.id,
            ip = %virtual_ip,
            platform = ?request.platform,
            "Registered device"
        );

        self.evaluate_device(device_id, now);
        Ok(Registration {
            device_id,
            virtual_ip,
            prefix_len: network.cidr.prefix_len(),
            gateway: network.gateway,
            nat_category: NatCategory::Unknown,
            peers: self.peer_views(device_id),
        })
    }

    fn forget_key(&self, public_key: PublicKey, device_id: DeviceId) {
        let mut keys = self.keys.lock();
        if keys.get(&public_key) == Some(&device_id) {
            keys.remove(&public_key);
        }
    }

    fn active_device(&self, device_id: DeviceId) -> Result<Device> {
        let device = self
            .devices
            .read()
            .get(&device_id)
            .cloned()
            .ok_or(TopologyError::DeviceNotFound { id: device_id })?;
        if device.is_revoked() {
            return Err(TopologyError::DeviceRevoked { id: device_id });
        }
        Ok(device)
    }

    /// Returns a device record, revoked or not.
    #[must_use]
    pub fn device(&self, device_id: DeviceId) -> Option<Device> {
        self.devices.read().get(&device_id).cloned()
    }

    /// Applies a heartbeat: liveness, NAT observations and peer metrics.
    ///
    /// Malformed probe data classifies the device as `Unknown` rather than
    /// failing. A changed local address moves the device's sessions back to
    /// connecting and drops its classification.
    ///
    /// # Errors
    ///
    /// Returns an error if the device does not exist or is revoked.
    pub fn report_heartbeat(&self, device_id: DeviceId, report: HeartbeatReport) -> Result<HeartbeatOutcome> {
        let now = self.clock.now();
        let observed_at = report.observed_at.min(now);
        let window = self.liveness_window();

        let (was_online, network_changed) = {
            let mut devices = self.devices.write();
            let device = devices
                .get_mut(&device_id)
                .ok_or(TopologyError::DeviceNotFound { id: device_id })?;
            if device.is_revoked() {
                return Err(TopologyError::DeviceRevoked { id: device_id });
            }
            let was_online = device.is_online(now, window);
            device.last_seen_at = Some(device.last_seen_at.map_or(observed_at, |seen| seen.max(observed_at)));

            let network_changed = matches!(
                (device.local_address, report.local_address),
                (Some(previous), Some(current)) if previous != current
            );
            if report.local_address.is_some() {
                device.local_address = report.local_address;
            }
            (was_online, network_changed)
        };

        if network_changed {
            info!(device_id = %device_id, local_address = ?report.local_address, "Device changed network");
            self.classifier.invalidate(device_id);
            self.sessions.reconnect_device(device_id, now);
        }

        let classification = match &report.probes {
            Some(probes) => Some(self.classifier.classify_report(device_id, probes, now)),
            None if network_changed => Some(Classification {
                category: NatCategory::Unknown,
                public_endpoint: None,
                classified_at: now,
            }),
            None => None,
        };
        let endpoint_hint = report.public_endpoint;
        let classification_changed = self.apply_classification(device_id, classification, endpoint_hint);

        for metrics in &report.peers {
            let Some(pair) = DevicePair::new(device_id, metrics.peer_device_id) else {
                debug!(device_id = %device_id, "Ignoring self-referencing peer metrics");
                continue;
            };
            if let Err(e) = self
                .sessions
                .apply_metrics(pair, device_id, metrics, observed_at, now)
            {
                debug!(device_id = %device_id, pair = %pair, error = %e, "Ignoring peer metrics");
            }
        }

        let reevaluated = if classification_changed || network_changed || !was_online {
            self.evaluate_device(device_id, now)
        } else {
            Vec::new()
        };

        let nat_category = self
            .device(device_id)
            .map_or(NatCategory::Unknown, |d| d.nat_category);
        debug!(
            device_id = %device_id,
            nat = %nat_category,
            peers = report.peers.len(),
            reevaluated = reevaluated.len(),
            "Heartbeat applied"
        );
        Ok(HeartbeatOutcome {
            nat_category,
            network_changed,
            reevaluated,
            peers: self.peer_views(device_id),
        })
    }

    /// Writes a classification and endpoint onto the device. Returns true if
    /// either changed.
    fn apply_classification(
        &self,
        device_id: DeviceId,
        classification: Option<Classification>,
        endpoint_hint: Option<SocketAddr>,
    ) -> bool {
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(&device_id) else {
            return false;
        };
        let before = (device.nat_category, device.public_endpoint);

        if let Some(classification) = classification {
            device.nat_category = classification.category;
            device.public_endpoint = classification.public_endpoint.or(endpoint_hint);
        } else if endpoint_hint.is_some() {
            device.public_endpoint = endpoint_hint;
        }

        let changed = before != (device.nat_category, device.public_endpoint);
        if changed {
            info!(
                device_id = %device_id,
                nat = %device.nat_category,
                endpoint = ?device.public_endpoint,
                "Device connectivity changed"
            );
        }
        changed
    }

    /// Runs a fresh probe round through `source` and applies the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the device does not exist or is revoked.
    pub async fn reprobe_device<P: ProbeSource>(&self, device_id: DeviceId, source: &P) -> Result<Classification> {
        self.active_device(device_id)?;
        let now = self.clock.now();
        let classification = self.classifier.probe_and_classify(device_id, source, now).await;
        if self.apply_classification(device_id, Some(classification), None) {
            self.evaluate_device(device_id, now);
        }
        Ok(classification)
    }

    /// Returns the peers a device should configure, ordered by virtual IP.
    ///
    /// # Errors
    ///
    /// Returns an error if the device does not exist or is revoked.
    pub fn get_peer_configurations(&self, device_id: DeviceId) -> Result<Vec<PeerView>> {
        self.active_device(device_id)?;
        Ok(self.peer_views(device_id))
    }

    fn peer_views(&self, device_id: DeviceId) -> Vec<PeerView> {
        let mut views: Vec<PeerView> = self
            .peer_configs
            .read()
            .values()
            .filter_map(|config| config.view_for(device_id).cloned())
            .collect();
        views.sort_by_key(|v| v.peer_virtual_ip);
        views
    }

    /// Returns a device's NAT category.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DeviceNotFound`] if it does not exist.
    pub fn get_device_nat_category(&self, device_id: DeviceId) -> Result<NatCategory> {
        self.device(device_id)
            .map(|d| d.nat_category)
            .ok_or(TopologyError::DeviceNotFound { id: device_id })
    }

    /// Revokes a device.
    ///
    /// Sessions end and relays are released before the address goes back to
    /// the pool, all under the network's allocation lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the device does not exist or is already revoked.
    pub fn revoke_device(&self, device_id: DeviceId) -> Result<RevocationSummary> {
        let now = self.clock.now();
        let public_key = {
            let mut devices = self.devices.write();
            let device = devices
                .get_mut(&device_id)
                .ok_or(TopologyError::DeviceNotFound { id: device_id })?;
            if device.is_revoked() {
                return Err(TopologyError::DeviceRevoked { id: device_id });
            }
            device.revoked_at = Some(now);
            device.public_key
        };
        self.forget_key(public_key, device_id);
        self.classifier.invalidate(device_id);

        let (released_ip, ended_sessions) = self.allocator.release_with(device_id, || {
            self.teardown_device(device_id, EndReason::Revoked, now)
        })?;
        self.routes.write().remove(&device_id);

        info!(
            device_id = %device_id,
            ip = %released_ip,
            ended_sessions = ended_sessions.len(),
            "Revoked device"
        );
        Ok(RevocationSummary {
            device_id,
            released_ip,
            ended_sessions,
        })
    }

    /// Sets extra routes a device serves. Peers receive them as allowed IPs.
    ///
    /// # Errors
    ///
    /// Returns [`PeerConfigError::InvalidAllowedIps`] if a route lies outside
    /// the device's network.
    pub fn set_allowed_ips(&self, device_id: DeviceId, routes: Vec<Ipv4Net>) -> Result<()> {
        let device = self.active_device(device_id)?;
        let network = self
            .network(device.virtual_network_id)
            .ok_or(TopologyError::NetworkNotFound {
                id: device.virtual_network_id,
            })?;
        for route in &routes {
            if !network.cidr.contains(&route.trunc()) {
                return Err(PeerConfigError::InvalidAllowedIps {
                    device_id,
                    route: route.trunc(),
                    cidr: network.cidr,
                }
                .into());
            }
        }

        {
            let mut overrides = self.routes.write();
            if routes.is_empty() {
                overrides.remove(&device_id);
            } else {
                overrides.insert(device_id, routes);
            }
        }
        let now = self.clock.now();
        for pair in self.sessions.pairs_for_device(device_id) {
            self.evaluate_logged(pair, now);
        }
        Ok(())
    }

    /// Renders a complete wg-quick configuration for the device.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::KeyMismatch`] if `private_key` does not belong
    /// to the device, or an error if the device is unknown or revoked.
    pub fn render_client_config(&self, device_id: DeviceId, private_key: PrivateKey) -> Result<String> {
        let device = self.active_device(device_id)?;
        if private_key.public_key() != device.public_key {
            return Err(TopologyError::KeyMismatch { id: device_id });
        }
        let network = self
            .network(device.virtual_network_id)
            .ok_or(TopologyError::NetworkNotFound {
                id: device.virtual_network_id,
            })?;

        let mut config = InterfaceConfig::new(private_key)
            .with_listen_port(self.config.peer.listen_port)
            .with_address(interface_address(&network, &device));
        for dns in &network.dns_servers {
            config = config.with_dns(*dns);
        }
        for view in self.peer_views(device_id) {
            config = config.with_peer(view.to_wireguard());
        }
        edge_wireguard::validate(&config)?;
        Ok(edge_wireguard::render_wg_quick(&config))
    }

    // ==================== READ MODELS ====================

    /// Returns a device with its liveness and sessions.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DeviceNotFound`] if it does not exist.
    pub fn device_status(&self, device_id: DeviceId) -> Result<DeviceStatus> {
        let device = self
            .device(device_id)
            .ok_or(TopologyError::DeviceNotFound { id: device_id })?;
        let online = device.is_online(self.clock.now(), self.liveness_window());
        Ok(DeviceStatus {
            device,
            online,
            sessions: self.sessions.sessions_for_device(device_id),
        })
    }

    /// Counts active devices of a network per NAT category. Every category
    /// is present.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::NetworkNotFound`] if it does not exist.
    pub fn nat_distribution(&self, network_id: VirtualNetworkId) -> Result<BTreeMap<NatCategory, usize>> {
        if self.network(network_id).is_none() {
            return Err(TopologyError::NetworkNotFound { id: network_id });
        }
        let mut distribution: BTreeMap<NatCategory, usize> =
            NatCategory::ALL.into_iter().map(|c| (c, 0)).collect();
        for device in self.devices.read().values() {
            if device.virtual_network_id == network_id && !device.is_revoked() {
                *distribution.entry(device.nat_category).or_default() += 1;
            }
        }
        Ok(distribution)
    }

    /// Sessions of a device: active first, then ended newest first.
    #[must_use]
    pub fn sessions_for_device(&self, device_id: DeviceId) -> Vec<Session> {
        self.sessions.sessions_for_device(device_id)
    }

    /// Returns the active session of a pair.
    #[must_use]
    pub fn session(&self, pair: DevicePair) -> Option<Session> {
        self.sessions.get(pair)
    }

    /// Aggregate session counters.
    #[must_use]
    pub fn session_stats(&self) -> SessionStats {
        self.sessions.stats()
    }

    // ==================== RELAYS ====================

    /// Adds a relay server.
    ///
    /// # Errors
    ///
    /// Returns an error for zero capacity or a duplicate address.
    pub fn register_relay(&self, server: RelayServer) -> Result<RelayServerId> {
        Ok(self.relays.register(server)?)
    }

    /// Removes a relay server and moves its sessions elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownRelay`] if it is not registered.
    pub fn deregister_relay(&self, id: RelayServerId) -> Result<usize> {
        let orphaned = self.relays.deregister(id)?;
        let now = self.clock.now();
        let pairs: Vec<DevicePair> = self
            .sessions
            .active_sessions()
            .into_iter()
            .filter(|s| orphaned.contains(&s.id))
            .map(|s| s.pair)
            .collect();
        for pair in &pairs {
            self.evaluate_logged(*pair, now);
        }
        Ok(pairs.len())
    }

    /// Every relay, ordered by id.
    #[must_use]
    pub fn relay_snapshot(&self) -> Vec<RelayServer> {
        self.relays.snapshot()
    }

    /// Probes every relay. Returns how many are healthy.
    pub async fn probe_relays<C: RelayHealthCheck>(&self, checker: &C) -> usize {
        let healthy = self.relays.probe_all(checker, self.clock.now()).await;
        debug!(healthy, "Relay probe round finished");
        healthy
    }

    /// Drops expired NAT classifications. Returns how many.
    pub fn purge_nat_cache(&self) -> usize {
        self.classifier.purge_expired(self.clock.now())
    }

    // ==================== PERIODIC WORK ====================

    /// Degrades quiet sessions and ends stale ones and those whose devices
    /// went offline. Ended sessions release their relays and peer entries.
    pub fn sweep_sessions(&self) -> SweepSummary {
        let now = self.clock.now();
        let window = self.liveness_window();
        let mut summary = SweepSummary::default();

        let offline: Vec<DevicePair> = {
            let devices = self.devices.read();
            let online = |id: DeviceId| devices.get(&id).is_some_and(|d| d.is_online(now, window));
            self.sessions
                .active_sessions()
                .into_iter()
                .filter(|s| !online(s.pair.first()) || !online(s.pair.second()))
                .map(|s| s.pair)
                .collect()
        };
        for pair in offline {
            let lock = self.pair_lock(pair);
            let guard = lock.lock();
            if let Some(ended) = self.end_pair_locked(pair, EndReason::DeviceOffline, now) {
                summary.ended.push(ended);
            }
            drop(guard);
            drop(lock);
            self.prune_pair_lock(pair);
        }

        let outcome = self.sessions.sweep(now);
        for ended in outcome.ended {
            let lock = self.pair_lock(ended.pair);
            let guard = lock.lock();
            self.relays.release(ended.id);
            if self.sessions.get(ended.pair).is_none() {
                self.peer_configs.write().remove(&ended.pair);
            }
            drop(guard);
            drop(lock);
            self.prune_pair_lock(ended.pair);
            summary.ended.push(ended);
        }
        summary.degraded = outcome.degraded;

        if !summary.ended.is_empty() || !summary.degraded.is_empty() {
            info!(
                ended = summary.ended.len(),
                degraded = summary.degraded.len(),
                "Session sweep"
            );
        }
        summary
    }

    /// Escalates expired direct attempts, retries pending sessions, moves
    /// sessions off unhealthy relays, re-issues TURN credentials close to
    /// expiry and opens sessions for online pairs that have none.
    pub fn reevaluate(&self) -> ReevaluationSummary {
        let now = self.clock.now();
        let mut summary = ReevaluationSummary::default();
        let mut pairs = Vec::new();

        for pair in self.sessions.due_for_escalation(now) {
            if self.sessions.escalate(pair).is_ok() {
                summary.escalated += 1;
                pairs.push(pair);
            }
        }

        let unhealthy = self.relays.sessions_on_unhealthy();
        if !unhealthy.is_empty() {
            for session in self.sessions.active_sessions() {
                if unhealthy.contains(&session.id) {
                    warn!(session_id = %session.id, pair = %session.pair, "Moving session off unhealthy relay");
                    self.relays.release(session.id);
                    pairs.push(session.pair);
                }
            }
        }

        let expiring = self.relays.expiring(now);
        if !expiring.is_empty() {
            for session in self.sessions.active_sessions() {
                if expiring.contains(&session.id) {
                    summary.rotated += 1;
                    pairs.push(session.pair);
                }
            }
        }

        pairs.extend(self.sessions.pending());
        pairs.extend(self.unpaired_online_pairs(now));
        pairs.sort();
        pairs.dedup();

        for pair in pairs {
            self.evaluate_logged(pair, now);
            summary.evaluated += 1;
        }
        summary.pending = self.sessions.pending().len();
        if summary.evaluated > 0 {
            debug!(
                escalated = summary.escalated,
                rotated = summary.rotated,
                evaluated = summary.evaluated,
                pending = summary.pending,
                "Re-evaluation pass"
            );
        }
        summary
    }

    /// Like [`reevaluate`](Self::reevaluate), but first re-probes relays
    /// whose health data went stale while sessions wait for one. A refresh
    /// that overruns the assignment timeout leaves those sessions pending.
    pub async fn reevaluate_fresh<C: RelayHealthCheck>(&self, checker: &C) -> ReevaluationSummary {
        if !self.sessions.pending().is_empty() && !self.relays.refresh_stale(checker, self.clock.now()).await {
            warn!("Relay health refresh timed out, pending sessions wait for the next pass");
        }
        self.reevaluate()
    }

    fn unpaired_online_pairs(&self, now: DateTime<Utc>) -> Vec<DevicePair> {
        let window = self.liveness_window();
        let mut by_network: HashMap<VirtualNetworkId, Vec<DeviceId>> = HashMap::new();
        for device in self.devices.read().values() {
            if device.is_online(now, window) {
                by_network
                    .entry(device.virtual_network_id)
                    .or_default()
                    .push(device.id);
            }
        }

        let mut pairs = Vec::new();
        for members in by_network.values() {
            for (i, x) in members.iter().enumerate() {
                for y in &members[i + 1..] {
                    if let Some(pair) = DevicePair::new(*x, *y) {
                        if self.sessions.get(pair).is_none() {
                            pairs.push(pair);
                        }
                    }
                }
            }
        }
        pairs
    }

    // ==================== PAIR EVALUATION ====================

    fn pair_lock(&self, pair: DevicePair) -> Arc<Mutex<()>> {
        Arc::clone(self.pair_locks.lock().entry(pair).or_default())
    }

    /// Drops the pair's lock entry unless some caller still holds or waits
    /// on it. Callers release their own clone first.
    fn prune_pair_lock(&self, pair: DevicePair) {
        let mut locks = self.pair_locks.lock();
        if locks.get(&pair).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&pair);
        }
    }

    /// Re-evaluates the device against every online peer in its network.
    fn evaluate_device(&self, device_id: DeviceId, now: DateTime<Utc>) -> Vec<DevicePair> {
        let window = self.liveness_window();
        let peers: Vec<DeviceId> = {
            let devices = self.devices.read();
            let Some(device) = devices.get(&device_id) else {
                return Vec::new();
            };
            devices
                .values()
                .filter(|d| {
                    d.id != device_id
                        && d.virtual_network_id == device.virtual_network_id
                        && d.is_online(now, window)
                })
                .map(|d| d.id)
                .collect()
        };

        let mut pairs: Vec<DevicePair> = peers
            .into_iter()
            .filter_map(|peer| DevicePair::new(device_id, peer))
            .collect();
        pairs.sort();
        for pair in &pairs {
            self.evaluate_logged(*pair, now);
        }
        pairs
    }

    fn evaluate_logged(&self, pair: DevicePair, now: DateTime<Utc>) {
        if let Err(e) = self.evaluate_pair(pair, now) {
            warn!(pair = %pair, error = %e, code = e.code(), "Pair evaluation failed");
        }
    }

    /// Decides how a pair connects and regenerates its configuration.
    ///
    /// Returns `None` when the pair should not be connected right now.
    fn evaluate_pair(&self, pair: DevicePair, now: DateTime<Utc>) -> Result<Option<PeerConfiguration>> {
        let lock = self.pair_lock(pair);
        let _guard = lock.lock();

        let (first, second) = {
            let devices = self.devices.read();
            match (devices.get(&pair.first()), devices.get(&pair.second())) {
                (Some(first), Some(second)) => (first.clone(), second.clone()),
                _ => return Ok(None),
            }
        };
        if first.is_revoked() || second.is_revoked() {
            self.end_pair_locked(pair, EndReason::Revoked, now);
            return Ok(None);
        }
        let window = self.liveness_window();
        if !first.is_online(now, window) || !second.is_online(now, window) {
            return Ok(None);
        }
        if first.virtual_network_id != second.virtual_network_id {
            return Ok(None);
        }
        let Some(network) = self.network(first.virtual_network_id) else {
            return Ok(None);
        };

        let mut plan = self.strategist.plan(first.nat_category, second.nat_category);
        if plan.strategy != Strategy::Relay && self.sessions.get(pair).is_some_and(|s| s.escalated) {
            plan = self.strategist.plan_for(Strategy::Relay);
        }
        let session = self.sessions.open(pair, &plan, now);

        let relay = if plan.strategy == Strategy::Relay {
            let hints = RelayHints {
                region: network.relay_region.clone(),
            };
            match self.relays.assign(session.id, &hints, now) {
                Ok(assignment) => Some(assignment),
                Err(RelayError::NoHealthyRelay) => {
                    warn!(session_id = %session.id, pair = %pair, "No healthy relay, session stays pending");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            self.relays.release(session.id);
            None
        };

        if plan.strategy == Strategy::Relay && relay.is_none() {
            if session.state != SessionState::Pending {
                self.sessions.park(pair)?;
            }
        } else {
            self.sessions.dispatch(
                pair,
                &plan,
                relay.as_ref().map(|r| r.relay_server_id),
                now,
            )?;
        }

        let config = self.generator.generate(
            &network,
            &first,
            &second,
            &plan,
            relay.as_ref(),
            &self.routes.read(),
        )?;
        let previous = self.peer_configs.write().insert(pair, config.clone());
        if previous.as_ref() != Some(&config) {
            debug!(pair = %pair, strategy = ?plan.strategy, "Peer configuration updated");
        }
        Ok(Some(config))
    }

    /// Ends the pair's session and drops its relay and configuration. The
    /// caller holds the pair lock.
    fn end_pair_locked(&self, pair: DevicePair, reason: EndReason, now: DateTime<Utc>) -> Option<Session> {
        let ended = self.sessions.end(pair, reason, now);
        if let Some(session) = &ended {
            self.relays.release(session.id);
        }
        self.peer_configs.write().remove(&pair);
        ended
    }

    fn teardown_device(&self, device_id: DeviceId, reason: EndReason, now: DateTime<Utc>) -> Vec<Session> {
        let mut pairs = self.sessions.pairs_for_device(device_id);
        pairs.extend(
            self.peer_configs
                .read()
                .keys()
                .filter(|pair| pair.contains(device_id))
                .copied(),
        );
        pairs.sort();
        pairs.dedup();

        let mut ended = Vec::new();
        for pair in pairs {
            let lock = self.pair_lock(pair);
            let guard = lock.lock();
            ended.extend(self.end_pair_locked(pair, reason, now));
            drop(guard);
            drop(lock);
            self.prune_pair_lock(pair);
        }
        ended
    }
}
