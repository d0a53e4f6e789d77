//! NAT behavior classification.
//!
//! Devices probe several independent STUN-style servers from the same local
//! port and report what each server saw, plus whether unsolicited packets got
//! through. Classification applies these rules in order:
//!
//! 1. The mapping for one local port differs between servers: `Symmetric`.
//! 2. Packets from a never-contacted address arrive: `FullCone`.
//! 3. Packets from another port of a contacted address arrive: `RestrictedCone`.
//! 4. Otherwise: `PortRestrictedCone`.
//!
//! Anything inconclusive or malformed yields `Unknown`, which the strategist
//! treats as the worst case.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::to_chrono;
use crate::types::{DeviceId, NatCategory};

/// Errors reported by a probe source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NatError {
    /// No probe servers are configured or reachable.
    #[error("no probe servers available")]
    NoProbeServers,
    /// The device could not be asked to probe.
    #[error("device {device_id} unreachable for probing: {reason}")]
    DeviceUnreachable {
        /// The device.
        device_id: DeviceId,
        /// Why.
        reason: String,
    },
    /// The probe round-trip exceeded its deadline.
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

/// What one probe server saw for one local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingObservation {
    /// Address of the probe server.
    pub probe_server: SocketAddr,
    /// Local UDP port the device sent from.
    pub local_port: u16,
    /// Public address and port the server observed.
    pub external: SocketAddr,
}

/// Results of the unsolicited-packet tests. `None` means not performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteringObservation {
    /// A packet from an address the device never contacted arrived.
    pub unsolicited_address_reached: Option<bool>,
    /// A packet from another port of a contacted address arrived.
    pub unsolicited_port_reached: Option<bool>,
}

/// Everything a device reports from one probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Mapping observations.
    pub mappings: Vec<MappingObservation>,
    /// Filtering tests.
    #[serde(default)]
    pub filtering: FilteringObservation,
}

impl ProbeReport {
    /// Adds a mapping observation.
    #[must_use]
    pub fn with_mapping(mut self, probe_server: SocketAddr, local_port: u16, external: SocketAddr) -> Self {
        self.mappings.push(MappingObservation {
            probe_server,
            local_port,
            external,
        });
        self
    }

    /// Sets the filtering results.
    #[must_use]
    pub fn with_filtering(mut self, address: Option<bool>, port: Option<bool>) -> Self {
        self.filtering = FilteringObservation {
            unsolicited_address_reached: address,
            unsolicited_port_reached: port,
        };
        self
    }
}

/// The outcome of classifying one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// The category.
    pub category: NatCategory,
    /// The device's public endpoint, when the mapping is stable.
    pub public_endpoint: Option<SocketAddr>,
    /// When the classification was made.
    pub classified_at: DateTime<Utc>,
}

fn is_malformed(m: &MappingObservation) -> bool {
    m.local_port == 0
        || m.external.port() == 0
        || m.probe_server.port() == 0
        || m.external.ip().is_unspecified()
        || m.probe_server.ip().is_unspecified()
}

/// Per local port: the external mappings seen by each probe server address.
type MappingTable = BTreeMap<u16, BTreeMap<IpAddr, BTreeSet<SocketAddr>>>;

fn mapping_table(report: &ProbeReport) -> Option<MappingTable> {
    let mut table = MappingTable::new();
    for m in &report.mappings {
        if is_malformed(m) {
            return None;
        }
        table
            .entry(m.local_port)
            .or_default()
            .entry(m.probe_server.ip())
            .or_default()
            .insert(m.external);
    }

    // One server reporting two different mappings for the same port contradicts itself.
    let contradictory = table
        .values()
        .flat_map(BTreeMap::values)
        .any(|externals| externals.len() > 1);
    (!contradictory).then_some(table)
}

/// Classifies a probe report. Never fails; bad input yields `Unknown`.
#[must_use]
pub fn classify(report: &ProbeReport) -> NatCategory {
    let Some(table) = mapping_table(report) else {
        return NatCategory::Unknown;
    };

    let conclusive: Vec<&BTreeMap<IpAddr, BTreeSet<SocketAddr>>> =
        table.values().filter(|servers| servers.len() >= 2).collect();
    if conclusive.is_empty() {
        return NatCategory::Unknown;
    }

    let varies_by_destination = conclusive.iter().any(|servers| {
        let externals: BTreeSet<&SocketAddr> = servers.values().flatten().collect();
        externals.len() > 1
    });
    if varies_by_destination {
        return NatCategory::Symmetric;
    }

    let filtering = report.filtering;
    match (
        filtering.unsolicited_address_reached,
        filtering.unsolicited_port_reached,
    ) {
        (Some(true), _) => NatCategory::FullCone,
        (Some(false), Some(true)) => NatCategory::RestrictedCone,
        (Some(false), Some(false)) => NatCategory::PortRestrictedCone,
        (Some(false) | None, None) | (None, Some(_)) => NatCategory::Unknown,
    }
}

/// Returns the stable public endpoint, if every server agreed on one for the
/// lowest probed port.
#[must_use]
pub fn public_endpoint(report: &ProbeReport) -> Option<SocketAddr> {
    let table = mapping_table(report)?;
    let (_, servers) = table.iter().next()?;
    let externals: BTreeSet<&SocketAddr> = servers.values().flatten().collect();
    match externals.len() {
        1 => externals.into_iter().next().copied(),
        _ => None,
    }
}

/// A way to ask a device for a fresh probe round.
pub trait ProbeSource: Send + Sync {
    /// Runs one probe round for the device.
    fn probe(&self, device_id: DeviceId) -> impl Future<Output = Result<ProbeReport, NatError>> + Send;
}

/// Classifies devices and caches the results.
#[derive(Debug)]
pub struct NatClassifier {
    cache: RwLock<HashMap<DeviceId, Classification>>,
    cache_ttl: Duration,
    probe_timeout: Duration,
}

impl NatClassifier {
    /// Creates a classifier.
    #[must_use]
    pub fn new(cache_ttl: Duration, probe_timeout: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
            probe_timeout,
        }
    }

    /// Classifies a report and caches the result.
    pub fn classify_report(
        &self,
        device_id: DeviceId,
        report: &ProbeReport,
        now: DateTime<Utc>,
    ) -> Classification {
        let category = classify(report);
        let public_endpoint = match category {
            NatCategory::Symmetric | NatCategory::Unknown => None,
            _ => public_endpoint(report),
        };
        if category == NatCategory::Unknown && !report.mappings.is_empty() {
            debug!(device_id = %device_id, mappings = report.mappings.len(), "Inconclusive probe report");
        }
        self.store(device_id, category, public_endpoint, now)
    }

    /// Asks the probe source for a fresh round, bounded by the probe timeout.
    ///
    /// Timeouts and probe errors classify the device as `Unknown`.
    pub async fn probe_and_classify<P: ProbeSource>(
        &self,
        device_id: DeviceId,
        source: &P,
        now: DateTime<Utc>,
    ) -> Classification {
        match tokio::time::timeout(self.probe_timeout, source.probe(device_id)).await {
            Ok(Ok(report)) => self.classify_report(device_id, &report, now),
            Ok(Err(e)) => {
                warn!(device_id = %device_id, error = %e, "Probe failed, treating NAT as unknown");
                self.store(device_id, NatCategory::Unknown, None, now)
            }
            Err(_) => {
                warn!(
                    device_id = %device_id,
                    timeout = ?self.probe_timeout,
                    "Probe timed out, treating NAT as unknown"
                );
                self.store(device_id, NatCategory::Unknown, None, now)
            }
        }
    }

    fn store(
        &self,
        device_id: DeviceId,
        category: NatCategory,
        public_endpoint: Option<SocketAddr>,
        now: DateTime<Utc>,
    ) -> Classification {
        let classification = Classification {
            category,
            public_endpoint,
            classified_at: now,
        };
        let previous = self.cache.write().insert(device_id, classification);
        if previous.map(|p| p.category) != Some(category) {
            info!(device_id = %device_id, category = %category, "NAT classified");
        }
        classification
    }

    /// Returns the cached classification if it is younger than the TTL.
    #[must_use]
    pub fn cached(&self, device_id: DeviceId, now: DateTime<Utc>) -> Option<Classification> {
        let ttl = to_chrono(self.cache_ttl);
        self.cache
            .read()
            .get(&device_id)
            .filter(|c| now - c.classified_at < ttl)
            .copied()
    }

    /// Drops a device's classification, forcing the next lookup to re-probe.
    pub fn invalidate(&self, device_id: DeviceId) {
        self.cache.write().remove(&device_id);
    }

    /// Drops every classification older than the TTL. Returns how many.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = to_chrono(self.cache_ttl);
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, c| now - c.classified_at < ttl);
        before - cache.len()
    }
}
