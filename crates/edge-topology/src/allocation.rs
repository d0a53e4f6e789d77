//! Virtual IP allocation.
//!
//! Each virtual network owns one pool guarded by its own lock, so
//! allocations in different networks never contend. Inside a pool the
//! lowest free host address wins; the network, broadcast and gateway
//! addresses are never handed out.
//!
//! ```text
//! 10.100.0.0/29
//!   .0  network    (reserved)
//!   .1  gateway    (reserved)
//!   .2 - .6        devices
//!   .7  broadcast  (reserved)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{DeviceId, VirtualNetwork, VirtualNetworkId};

/// Errors that can occur during address allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Every usable address is taken.
    #[error(
        "virtual network {network_id} ({cidr}) has no free addresses; \
         expand the CIDR or revoke unused devices"
    )]
    Exhausted {
        /// The exhausted network.
        network_id: VirtualNetworkId,
        /// Its address space.
        cidr: Ipv4Net,
    },
    /// The network was never registered with the allocator.
    #[error("virtual network {network_id} is not managed by the allocator")]
    UnknownNetwork {
        /// The unknown network.
        network_id: VirtualNetworkId,
    },
    /// The device holds no address.
    #[error("device {device_id} holds no address")]
    NotAllocated {
        /// The device.
        device_id: DeviceId,
    },
}

/// Occupancy of one network's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Usable addresses (hosts minus the gateway).
    pub capacity: usize,
    /// Addresses held by devices.
    pub allocated: usize,
    /// Addresses still free.
    pub available: usize,
}

#[derive(Debug)]
struct NetworkPool {
    network_id: VirtualNetworkId,
    cidr: Ipv4Net,
    gateway: Ipv4Addr,
    by_device: HashMap<DeviceId, Ipv4Addr>,
    by_ip: BTreeMap<Ipv4Addr, DeviceId>,
}

impl NetworkPool {
    fn new(network: &VirtualNetwork) -> Self {
        Self {
            network_id: network.id,
            cidr: network.cidr,
            gateway: network.gateway,
            by_device: HashMap::new(),
            by_ip: BTreeMap::new(),
        }
    }

    fn first_host(&self) -> u32 {
        u32::from(self.cidr.network()) + 1
    }

    fn last_host(&self) -> u32 {
        u32::from(self.cidr.broadcast()) - 1
    }

    fn is_usable(&self, ip: Ipv4Addr) -> bool {
        let raw = u32::from(ip);
        raw >= self.first_host() && raw <= self.last_host() && ip != self.gateway
    }

    fn capacity(&self) -> usize {
        let hosts = (self.last_host() - self.first_host() + 1) as usize;
        let gateway = u32::from(self.gateway);
        if (self.first_host()..=self.last_host()).contains(&gateway) {
            hosts - 1
        } else {
            hosts
        }
    }

    fn claim(&mut self, device_id: DeviceId, requested: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        if let Some(existing) = self.by_device.get(&device_id) {
            return Some(*existing);
        }

        let granted = requested
            .filter(|ip| self.is_usable(*ip) && !self.by_ip.contains_key(ip))
            .or_else(|| {
                (self.first_host()..=self.last_host())
                    .map(Ipv4Addr::from)
                    .find(|ip| *ip != self.gateway && !self.by_ip.contains_key(ip))
            })?;

        self.by_device.insert(device_id, granted);
        self.by_ip.insert(granted, device_id);
        Some(granted)
    }

    fn release(&mut self, device_id: DeviceId) -> Option<Ipv4Addr> {
        let ip = self.by_device.remove(&device_id)?;
        self.by_ip.remove(&ip);
        Some(ip)
    }

    fn stats(&self) -> PoolStats {
        let capacity = self.capacity();
        let allocated = self.by_ip.len();
        PoolStats {
            capacity,
            allocated,
            available: capacity.saturating_sub(allocated),
        }
    }
}

/// Assigns virtual IPs inside each virtual network's CIDR.
#[derive(Debug, Default)]
pub struct AddressAllocator {
    pools: RwLock<HashMap<VirtualNetworkId, Arc<Mutex<NetworkPool>>>>,
    owners: RwLock<HashMap<DeviceId, VirtualNetworkId>>,
}

impl AddressAllocator {
    /// Creates an allocator with no networks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts managing a network. Registering the same network twice is a no-op.
    pub fn register_network(&self, network: &VirtualNetwork) {
        let mut pools = self.pools.write();
        pools.entry(network.id).or_insert_with(|| {
            debug!(network_id = %network.id, cidr = %network.cidr, "Registered address pool");
            Arc::new(Mutex::new(NetworkPool::new(network)))
        });
    }

    /// Stops managing a network, returning the devices that held addresses.
    pub fn remove_network(&self, network_id: VirtualNetworkId) -> Vec<DeviceId> {
        let Some(pool) = self.pools.write().remove(&network_id) else {
            return Vec::new();
        };
        let devices: Vec<DeviceId> = pool.lock().by_device.keys().copied().collect();
        let mut owners = self.owners.write();
        for device in &devices {
            owners.remove(device);
        }
        devices
    }

    fn pool(&self, network_id: VirtualNetworkId) -> Result<Arc<Mutex<NetworkPool>>, AllocationError> {
        self.pools
            .read()
            .get(&network_id)
            .cloned()
            .ok_or(AllocationError::UnknownNetwork { network_id })
    }

    /// Assigns an address to a device.
    ///
    /// A free, usable `requested` address is honored; otherwise the lowest
    /// free address is chosen. A device that already holds an address in
    /// this network gets the same address back.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::Exhausted`] when the pool is full, or
    /// [`AllocationError::UnknownNetwork`] for an unregistered network.
    pub fn allocate(
        &self,
        network_id: VirtualNetworkId,
        device_id: DeviceId,
        requested: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, AllocationError> {
        let pool = self.pool(network_id)?;
        let mut pool = pool.lock();

        let ip = pool.claim(device_id, requested).ok_or(AllocationError::Exhausted {
            network_id,
            cidr: pool.cidr,
        })?;
        self.owners.write().insert(device_id, network_id);

        if requested.is_some_and(|r| r != ip) {
            debug!(device_id = %device_id, requested = ?requested, granted = %ip, "Requested address unavailable");
        }
        info!(network_id = %network_id, device_id = %device_id, ip = %ip, "Allocated virtual IP");
        Ok(ip)
    }

    /// Frees a device's address.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::NotAllocated`] if the device holds none.
    pub fn release(&self, device_id: DeviceId) -> Result<Ipv4Addr, AllocationError> {
        self.release_with(device_id, || ()).map(|(ip, ())| ip)
    }

    /// Frees a device's address after running `before_release` under the
    /// network's lock.
    ///
    /// No allocation in the device's network can observe the address as free
    /// until `before_release` has returned.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::NotAllocated`] if the device holds none;
    /// `before_release` is not run in that case.
    pub fn release_with<R>(
        &self,
        device_id: DeviceId,
        before_release: impl FnOnce() -> R,
    ) -> Result<(Ipv4Addr, R), AllocationError> {
        let network_id = self
            .owners
            .read()
            .get(&device_id)
            .copied()
            .ok_or(AllocationError::NotAllocated { device_id })?;
        let pool = self.pool(network_id)?;
        let mut pool = pool.lock();

        if !pool.by_device.contains_key(&device_id) {
            return Err(AllocationError::NotAllocated { device_id });
        }
        let outcome = before_release();
        let ip = pool
            .release(device_id)
            .ok_or(AllocationError::NotAllocated { device_id })?;
        self.owners.write().remove(&device_id);

        info!(network_id = %pool.network_id, device_id = %device_id, ip = %ip, "Released virtual IP");
        Ok((ip, outcome))
    }

    /// Returns the address a device holds.
    #[must_use]
    pub fn address_of(&self, device_id: DeviceId) -> Option<Ipv4Addr> {
        let network_id = *self.owners.read().get(&device_id)?;
        let pool = self.pool(network_id).ok()?;
        pool.lock().by_device.get(&device_id).copied()
    }

    /// Returns true if the address is held by some device.
    #[must_use]
    pub fn is_allocated(&self, network_id: VirtualNetworkId, ip: Ipv4Addr) -> bool {
        self.pool(network_id)
            .is_ok_and(|pool| pool.lock().by_ip.contains_key(&ip))
    }

    /// Returns occupancy for a network.
    #[must_use]
    pub fn stats(&self, network_id: VirtualNetworkId) -> Option<PoolStats> {
        let pool = self.pool(network_id).ok()?;
        Some(pool.lock().stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrganizationId;
    use chrono::Utc;

    fn network(cidr: &str, gateway: [u8; 4]) -> VirtualNetwork {
        VirtualNetwork::new(
            OrganizationId::new(),
            "test",
            cidr.parse().expect("valid cidr"),
            Ipv4Addr::from(gateway),
            Utc::now(),
        )
        .expect("valid network")
    }

    fn allocator_with(network: &VirtualNetwork) -> AddressAllocator {
        let allocator = AddressAllocator::new();
        allocator.register_network(network);
        allocator
    }

    // ==================== ALLOCATION TESTS ====================

    #[test]
    fn test_allocates_lowest_free_skipping_gateway() {
        let net = network("10.100.0.0/29", [10, 100, 0, 1]);
        let allocator = allocator_with(&net);

        let ip = allocator
            .allocate(net.id, DeviceId::new(), None)
            .expect("should allocate");
        assert_eq!(ip, Ipv4Addr::new(10, 100, 0, 2));
    }

    #[test]
    fn test_gateway_in_middle_is_skipped() {
        let net = network("10.100.0.0/29", [10, 100, 0, 3]);
        let allocator = allocator_with(&net);

        let ips: Vec<Ipv4Addr> = (0..5)
            .map(|_| allocator.allocate(net.id, DeviceId::new(), None).expect("allocate"))
            .collect();
        assert_eq!(
            ips,
            vec![
                Ipv4Addr::new(10, 100, 0, 1),
                Ipv4Addr::new(10, 100, 0, 2),
                Ipv4Addr::new(10, 100, 0, 4),
                Ipv4Addr::new(10, 100, 0, 5),
                Ipv4Addr::new(10, 100, 0, 6),
            ]
        );
    }

    #[test]
    fn test_exhaustion_names_network() {
        let net = network("10.100.0.0/29", [10, 100, 0, 1]);
        let allocator = allocator_with(&net);
        for _ in 0..5 {
            allocator.allocate(net.id, DeviceId::new(), None).expect("allocate");
        }

        let err = allocator
            .allocate(net.id, DeviceId::new(), None)
            .expect_err("should be exhausted");
        assert_eq!(
            err,
            AllocationError::Exhausted {
                network_id: net.id,
                cidr: net.cidr
            }
        );
        assert!(err.to_string().contains("10.100.0.0/29"));
    }

    #[test]
    fn test_requested_ip_honored_when_free() {
        let net = network("10.100.0.0/24", [10, 100, 0, 1]);
        let allocator = allocator_with(&net);
        let requested = Ipv4Addr::new(10, 100, 0, 42);

        let ip = allocator
            .allocate(net.id, DeviceId::new(), Some(requested))
            .expect("allocate");
        assert_eq!(ip, requested);

        let fallback = allocator
            .allocate(net.id, DeviceId::new(), Some(requested))
            .expect("allocate");
        assert_eq!(fallback, Ipv4Addr::new(10, 100, 0, 2));
    }

    #[test]
    fn test_requested_reserved_or_foreign_ip_is_ignored() {
        let net = network("10.100.0.0/24", [10, 100, 0, 1]);
        let allocator = allocator_with(&net);

        for requested in [
            Ipv4Addr::new(10, 100, 0, 0),
            Ipv4Addr::new(10, 100, 0, 1),
            Ipv4Addr::new(10, 100, 0, 255),
            Ipv4Addr::new(192, 168, 1, 9),
        ] {
            let device = DeviceId::new();
            let ip = allocator.allocate(net.id, device, Some(requested)).expect("allocate");
            assert_ne!(ip, requested);
            allocator.release(device).expect("release");
        }
    }

    #[test]
    fn test_allocate_is_idempotent_per_device() {
        let net = network("10.100.0.0/24", [10, 100, 0, 1]);
        let allocator = allocator_with(&net);
        let device = DeviceId::new();

        let first = allocator.allocate(net.id, device, None).expect("allocate");
        let second = allocator.allocate(net.id, device, None).expect("allocate");
        assert_eq!(first, second);
        assert_eq!(allocator.stats(net.id).expect("stats").allocated, 1);
    }

    #[test]
    fn test_unknown_network() {
        let allocator = AddressAllocator::new();
        let id = VirtualNetworkId::new();
        assert_eq!(
            allocator.allocate(id, DeviceId::new(), None),
            Err(AllocationError::UnknownNetwork { network_id: id })
        );
    }

    // ==================== RELEASE TESTS ====================

    #[test]
    fn test_release_returns_address_to_pool() {
        let net = network("10.100.0.0/29", [10, 100, 0, 1]);
        let allocator = allocator_with(&net);
        let device = DeviceId::new();
        let ip = allocator.allocate(net.id, device, None).expect("allocate");

        assert!(allocator.is_allocated(net.id, ip));
        assert_eq!(allocator.address_of(device), Some(ip));
        assert_eq!(allocator.release(device), Ok(ip));
        assert!(!allocator.is_allocated(net.id, ip));
        assert_eq!(allocator.address_of(device), None);
        assert_eq!(
            allocator.release(device),
            Err(AllocationError::NotAllocated { device_id: device })
        );
    }

    #[test]
    fn test_release_with_runs_hook_then_frees() {
        let net = network("10.100.0.0/29", [10, 100, 0, 1]);
        let allocator = allocator_with(&net);
        let device = DeviceId::new();
        let ip = allocator.allocate(net.id, device, None).expect("allocate");

        let (released, hook_result) = allocator
            .release_with(device, || "sessions ended")
            .expect("release");
        assert_eq!(released, ip);
        assert_eq!(hook_result, "sessions ended");
        assert!(!allocator.is_allocated(net.id, ip));
    }

    #[test]
    fn test_release_with_skips_hook_when_not_allocated() {
        let allocator = AddressAllocator::new();
        let mut ran = false;
        let result = allocator.release_with(DeviceId::new(), || ran = true);
        assert!(result.is_err());
        assert!(!ran);
    }

    #[test]
    fn test_remove_network_forgets_owners() {
        let net = network("10.100.0.0/29", [10, 100, 0, 1]);
        let allocator = allocator_with(&net);
        let device = DeviceId::new();
        allocator.allocate(net.id, device, None).expect("allocate");

        assert_eq!(allocator.remove_network(net.id), vec![device]);
        assert_eq!(allocator.address_of(device), None);
        assert!(allocator.stats(net.id).is_none());
    }

    // ==================== STATS TESTS ====================

    #[test]
    fn test_stats_capacity_excludes_gateway() {
        let net = network("10.100.0.0/29", [10, 100, 0, 1]);
        let allocator = allocator_with(&net);
        allocator.allocate(net.id, DeviceId::new(), None).expect("allocate");

        let stats = allocator.stats(net.id).expect("stats");
        assert_eq!(
            stats,
            PoolStats {
                capacity: 5,
                allocated: 1,
                available: 4
            }
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        proptest! {
            #[test]
            fn allocations_are_unique_and_usable(
                requests in proptest::collection::vec(proptest::option::of(0u8..=255), 1..40),
                releases in proptest::collection::vec(any::<bool>(), 40),
            ) {
                let net = network("10.100.0.0/26", [10, 100, 0, 1]);
                let allocator = allocator_with(&net);
                let mut held: Vec<(DeviceId, Ipv4Addr)> = Vec::new();

                for (i, requested) in requests.iter().enumerate() {
                    let device = DeviceId::new();
                    let requested = requested.map(|octet| Ipv4Addr::new(10, 100, 0, octet));
                    if let Ok(ip) = allocator.allocate(net.id, device, requested) {
                        prop_assert!(net.cidr.contains(&ip));
                        prop_assert_ne!(ip, net.gateway);
                        prop_assert_ne!(ip, net.cidr.network());
                        prop_assert_ne!(ip, net.cidr.broadcast());
                        held.push((device, ip));
                    }
                    if releases[i] && !held.is_empty() {
                        let (device, _) = held.remove(0);
                        prop_assert!(allocator.release(device).is_ok());
                    }
                }

                let unique: HashSet<Ipv4Addr> = held.iter().map(|(_, ip)| *ip).collect();
                prop_assert_eq!(unique.len(), held.len());
            }
        }
    }
}
