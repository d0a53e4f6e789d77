//! TURN relay pool.
//!
//! Tracks relay capacity and health, hands sessions to the least loaded
//! healthy relay, and issues short-lived TURN credentials per assignment.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::to_chrono;
use crate::config::RelayConfig;
use crate::types::{RelayServerId, SessionId};

/// Errors from the relay pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// No healthy relay has spare capacity. Transient.
    #[error("no healthy relay with spare capacity")]
    NoHealthyRelay,
    /// The relay is not registered.
    #[error("relay {id} is not registered")]
    UnknownRelay {
        /// The relay.
        id: RelayServerId,
    },
    /// A relay with this address is already registered.
    #[error("relay at {address} is already registered")]
    DuplicateRelay {
        /// The address.
        address: SocketAddr,
    },
    /// A relay must accept at least one session.
    #[error("relay capacity must be greater than 0")]
    ZeroCapacity,
}

/// A TURN relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayServer {
    /// Relay identifier.
    pub id: RelayServerId,
    /// TURN listen address.
    pub address: SocketAddr,
    /// Region label used for placement hints.
    pub region: Option<String>,
    /// Maximum concurrent sessions.
    pub capacity_limit: u32,
    /// Sessions currently assigned.
    pub active_session_count: u32,
    /// Result of the last health probe.
    pub healthy: bool,
    /// When the relay was last probed.
    pub last_probed_at: Option<DateTime<Utc>>,
}

impl RelayServer {
    /// Creates a healthy relay with no sessions.
    #[must_use]
    pub fn new(address: SocketAddr, capacity_limit: u32) -> Self {
        Self {
            id: RelayServerId::new(),
            address,
            region: None,
            capacity_limit,
            active_session_count: 0,
            healthy: true,
            last_probed_at: None,
        }
    }

    /// Sets the region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Returns true if the relay can take another session.
    #[must_use]
    pub const fn has_capacity(&self) -> bool {
        self.active_session_count < self.capacity_limit
    }

    /// Load as a fraction of capacity, in thousandths.
    #[must_use]
    pub fn load_permille(&self) -> u64 {
        u64::from(self.active_session_count) * 1000 / u64::from(self.capacity_limit.max(1))
    }
}

/// Placement preferences for an assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayHints {
    /// Preferred region. Other regions are used when none match.
    pub region: Option<String>,
}

/// Short-lived credentials for the TURN allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    /// TURN username, `<expiry-unix>:<session>`.
    pub username: String,
    /// Random password.
    pub password: String,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

impl TurnCredentials {
    fn generate(session_id: SessionId, expires_at: DateTime<Utc>) -> Self {
        let mut secret = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            username: format!("{}:{}", expires_at.timestamp(), session_id),
            password: base64::engine::general_purpose::STANDARD_NO_PAD.encode(secret),
            expires_at,
        }
    }
}

/// A session's claim on a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAssignment {
    /// The session.
    pub session_id: SessionId,
    /// The relay.
    pub relay_server_id: RelayServerId,
    /// Where peers send traffic.
    pub relay_address: SocketAddr,
    /// When the assignment was made.
    pub assigned_at: DateTime<Utc>,
    /// TURN credentials for the allocation.
    pub credentials: TurnCredentials,
}

/// Checks whether a relay is serving.
pub trait RelayHealthCheck: Send + Sync {
    /// Returns true if the relay is healthy.
    fn check(&self, server: &RelayServer) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Default)]
struct PoolState {
    servers: BTreeMap<RelayServerId, RelayServer>,
    assignments: HashMap<SessionId, RelayAssignment>,
}

/// Registry of relays and their session assignments.
#[derive(Debug)]
pub struct RelayPool {
    state: RwLock<PoolState>,
    config: RelayConfig,
}

impl RelayPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            config,
        }
    }

    /// Adds a relay.
    ///
    /// # Errors
    ///
    /// Returns an error for zero capacity or an already registered address.
    pub fn register(&self, server: RelayServer) -> Result<RelayServerId, RelayError> {
        if server.capacity_limit == 0 {
            return Err(RelayError::ZeroCapacity);
        }
        let mut state = self.state.write();
        if state.servers.values().any(|s| s.address == server.address) {
            return Err(RelayError::DuplicateRelay {
                address: server.address,
            });
        }
        let id = server.id;
        info!(relay_id = %id, address = %server.address, capacity = server.capacity_limit, "Registered relay");
        state.servers.insert(id, server);
        Ok(id)
    }

    /// Removes a relay, returning the sessions that were using it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownRelay`] if it is not registered.
    pub fn deregister(&self, id: RelayServerId) -> Result<Vec<SessionId>, RelayError> {
        let mut state = self.state.write();
        state.servers.remove(&id).ok_or(RelayError::UnknownRelay { id })?;
        let orphaned: Vec<SessionId> = state
            .assignments
            .values()
            .filter(|a| a.relay_server_id == id)
            .map(|a| a.session_id)
            .collect();
        for session in &orphaned {
            state.assignments.remove(session);
        }
        info!(relay_id = %id, orphaned = orphaned.len(), "Deregistered relay");
        Ok(orphaned)
    }

    /// Assigns a relay to a session. Assigning the same session again returns
    /// the existing assignment, with fresh credentials once the current ones
    /// are within the refresh margin of expiring.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NoHealthyRelay`] if every relay is unhealthy or full.
    pub fn assign(
        &self,
        session_id: SessionId,
        hints: &RelayHints,
        now: DateTime<Utc>,
    ) -> Result<RelayAssignment, RelayError> {
        let mut state = self.state.write();
        if let Some(existing) = state.assignments.get_mut(&session_id) {
            if self.needs_rotation(existing, now) {
                let expires_at = now + to_chrono(self.config.credential_lifetime());
                existing.credentials = TurnCredentials::generate(session_id, expires_at);
                info!(session_id = %session_id, relay_id = %existing.relay_server_id, "Rotated TURN credentials");
            }
            return Ok(existing.clone());
        }

        let region_match = |s: &RelayServer| {
            hints.region.is_some() && s.region.as_deref() == hints.region.as_deref()
        };
        let chosen = state
            .servers
            .values_mut()
            .filter(|s| s.healthy && s.has_capacity())
            .min_by_key(|s| (!region_match(s), s.load_permille(), s.id))
            .ok_or(RelayError::NoHealthyRelay)?;

        chosen.active_session_count += 1;
        let expires_at = now + to_chrono(self.config.credential_lifetime());
        let assignment = RelayAssignment {
            session_id,
            relay_server_id: chosen.id,
            relay_address: chosen.address,
            assigned_at: now,
            credentials: TurnCredentials::generate(session_id, expires_at),
        };
        info!(
            session_id = %session_id,
            relay_id = %chosen.id,
            load = chosen.active_session_count,
            capacity = chosen.capacity_limit,
            "Assigned relay"
        );
        state.assignments.insert(session_id, assignment.clone());
        Ok(assignment)
    }

    /// Re-probes relays with stale health data, bounded by the assignment
    /// timeout. Returns `false` if the refresh did not finish in time.
    pub async fn refresh_stale<C: RelayHealthCheck>(&self, checker: &C, now: DateTime<Utc>) -> bool {
        if self.stale_relays(now).is_empty() {
            return true;
        }
        tokio::time::timeout(self.config.assign_timeout(), self.probe_stale(checker, now))
            .await
            .is_ok()
    }

    /// Frees a session's relay slot.
    pub fn release(&self, session_id: SessionId) -> Option<RelayAssignment> {
        let mut state = self.state.write();
        let assignment = state.assignments.remove(&session_id)?;
        if let Some(server) = state.servers.get_mut(&assignment.relay_server_id) {
            server.active_session_count = server.active_session_count.saturating_sub(1);
        }
        debug!(session_id = %session_id, relay_id = %assignment.relay_server_id, "Released relay");
        Some(assignment)
    }

    fn needs_rotation(&self, assignment: &RelayAssignment, now: DateTime<Utc>) -> bool {
        assignment.credentials.expires_at - now <= to_chrono(self.config.credential_refresh_margin())
    }

    /// Sessions whose credentials are due for rotation.
    #[must_use]
    pub fn expiring(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        self.state
            .read()
            .assignments
            .values()
            .filter(|a| self.needs_rotation(a, now))
            .map(|a| a.session_id)
            .collect()
    }

    /// Returns a session's assignment.
    #[must_use]
    pub fn assignment(&self, session_id: SessionId) -> Option<RelayAssignment> {
        self.state.read().assignments.get(&session_id).cloned()
    }

    /// Records a health result.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UnknownRelay`] if it is not registered.
    pub fn set_health(
        &self,
        id: RelayServerId,
        healthy: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        let mut state = self.state.write();
        let server = state.servers.get_mut(&id).ok_or(RelayError::UnknownRelay { id })?;
        if server.healthy != healthy {
            if healthy {
                info!(relay_id = %id, "Relay recovered");
            } else {
                warn!(relay_id = %id, address = %server.address, "Relay unhealthy");
            }
        }
        server.healthy = healthy;
        server.last_probed_at = Some(now);
        Ok(())
    }

    fn stale_relays(&self, now: DateTime<Utc>) -> Vec<RelayServer> {
        let freshness = to_chrono(self.config.health_freshness());
        self.state
            .read()
            .servers
            .values()
            .filter(|s| s.last_probed_at.is_none_or(|at| now - at > freshness))
            .cloned()
            .collect()
    }

    async fn probe_servers<C: RelayHealthCheck>(
        &self,
        servers: Vec<RelayServer>,
        checker: &C,
        now: DateTime<Utc>,
    ) -> usize {
        let timeout = self.config.probe_timeout();
        let probes = servers.iter().map(|server| async move {
            let healthy = tokio::time::timeout(timeout, checker.check(server))
                .await
                .unwrap_or_else(|_| {
                    warn!(relay_id = %server.id, ?timeout, "Relay health probe timed out");
                    false
                });
            (server.id, healthy)
        });
        let results = futures::future::join_all(probes).await;

        let mut healthy = 0;
        for (id, ok) in results {
            // A relay deregistered while its probe was in flight is skipped.
            if self.set_health(id, ok, now).is_ok() && ok {
                healthy += 1;
            }
        }
        healthy
    }

    /// Probes every relay concurrently. A probe that exceeds the probe
    /// timeout marks its relay unhealthy. Returns how many are healthy.
    pub async fn probe_all<C: RelayHealthCheck>(&self, checker: &C, now: DateTime<Utc>) -> usize {
        let servers = self.snapshot();
        self.probe_servers(servers, checker, now).await
    }

    /// Probes only relays whose health data is older than the freshness window.
    pub async fn probe_stale<C: RelayHealthCheck>(&self, checker: &C, now: DateTime<Utc>) -> usize {
        let stale = self.stale_relays(now);
        self.probe_servers(stale, checker, now).await
    }

    /// Returns every relay, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RelayServer> {
        self.state.read().servers.values().cloned().collect()
    }

    /// Sessions currently assigned to unhealthy or deregistered relays.
    #[must_use]
    pub fn sessions_on_unhealthy(&self) -> Vec<SessionId> {
        let state = self.state.read();
        state
            .assignments
            .values()
            .filter(|a| !state.servers.get(&a.relay_server_id).is_some_and(|s| s.healthy))
            .map(|a| a.session_id)
            .collect()
    }
}
