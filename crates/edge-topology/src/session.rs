//! Peer session lifecycle.
//!
//! One session per device pair tracks how its tunnel is doing:
//!
//! ```text
//! Pending ──dispatch──▶ Connecting ──handshake──▶ Established
//!                          ▲                        │     ▲
//!                          │ network change          │     │ fresh handshake
//!                          └──────────────────── Degraded ◀┘ (no handshake)
//!
//! any state ──revoke / offline / stale──▶ Ended
//! ```
//!
//! Heartbeats may arrive late or twice. Handshake times and byte counters only
//! move forward.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::to_chrono;
use crate::strategy::{ConnectivityPlan, Strategy};
use crate::types::{ConnectionType, DeviceId, DevicePair, RelayServerId, SessionId};

/// Errors from the session tracker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No active session for the pair.
    #[error("no active session for {pair}")]
    NotFound {
        /// The pair.
        pair: DevicePair,
    },
    /// The reporting device is not part of the pair.
    #[error("device {device_id} is not part of {pair}")]
    NotInPair {
        /// The device.
        device_id: DeviceId,
        /// The pair.
        pair: DevicePair,
    },
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, waiting for a plan to be dispatched (or for a relay).
    Pending,
    /// Plan dispatched, no handshake yet.
    Connecting,
    /// Handshakes are flowing.
    Established,
    /// Handshakes stopped recently.
    Degraded,
    /// Finished.
    Ended,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A device was revoked.
    Revoked,
    /// A device went offline.
    DeviceOffline,
    /// No handshake for too long.
    Stale,
    /// The virtual network was deleted.
    NetworkDeleted,
}

/// One device's view of a peer, carried in a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetrics {
    /// The peer.
    pub peer_device_id: DeviceId,
    /// Last `WireGuard` handshake with the peer.
    pub last_handshake_at: Option<DateTime<Utc>>,
    /// Where the reporter sees the peer.
    pub peer_endpoint: Option<SocketAddr>,
    /// Bytes the reporter sent to the peer.
    pub bytes_sent: u64,
    /// Bytes the reporter received from the peer.
    pub bytes_received: u64,
    /// Round-trip latency.
    pub latency_ms: Option<u32>,
}

/// A tunnel between two devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier.
    pub id: SessionId,
    /// The pair.
    pub pair: DevicePair,
    /// Lifecycle state.
    pub state: SessionState,
    /// How the tunnel is carried.
    pub connection_type: ConnectionType,
    /// Last strategy decision.
    pub strategy: Strategy,
    /// Relay in use, for relayed sessions.
    pub relay_server_id: Option<RelayServerId>,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// When the current plan was dispatched.
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Direct attempts without a handshake by this time escalate to a relay.
    pub escalate_at: Option<DateTime<Utc>>,
    /// Set once a direct attempt failed and a relay was forced.
    pub escalated: bool,
    /// Latest handshake reported by either side.
    pub last_handshake_at: Option<DateTime<Utc>>,
    /// First device's public endpoint as seen by the second.
    pub endpoint_a: Option<SocketAddr>,
    /// Second device's public endpoint as seen by the first.
    pub endpoint_b: Option<SocketAddr>,
    /// Bytes sent by the first device.
    pub bytes_sent_a: u64,
    /// Bytes received by the first device.
    pub bytes_received_a: u64,
    /// Bytes sent by the second device.
    pub bytes_sent_b: u64,
    /// Bytes received by the second device.
    pub bytes_received_b: u64,
    /// Latest latency sample.
    pub latency_ms: Option<u32>,
    /// Time of the report the latency came from.
    pub latency_observed_at: Option<DateTime<Utc>>,
    /// End time.
    pub ended_at: Option<DateTime<Utc>>,
    /// Why it ended.
    pub end_reason: Option<EndReason>,
}

impl Session {
    fn new(pair: DevicePair, plan: &ConnectivityPlan, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            pair,
            state: SessionState::Pending,
            connection_type: plan.connection_type(),
            strategy: plan.strategy,
            relay_server_id: None,
            started_at: now,
            dispatched_at: None,
            escalate_at: None,
            escalated: false,
            last_handshake_at: None,
            endpoint_a: None,
            endpoint_b: None,
            bytes_sent_a: 0,
            bytes_received_a: 0,
            bytes_sent_b: 0,
            bytes_received_b: 0,
            latency_ms: None,
            latency_observed_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    /// Returns true until the session ends.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Total bytes moved in both directions as reported by senders.
    #[must_use]
    pub const fn bytes_total(&self) -> u64 {
        self.bytes_sent_a.saturating_add(self.bytes_sent_b)
    }

    fn handshake_since_dispatch(&self) -> bool {
        match (self.last_handshake_at, self.dispatched_at) {
            (Some(handshake), Some(dispatched)) => handshake >= dispatched,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            info!(
                session_id = %self.id,
                pair = %self.pair,
                from = ?self.state,
                to = ?to,
                connection = %self.connection_type,
                "Session transition"
            );
            self.state = to;
        }
    }

    fn redispatch(&mut self, plan: &ConnectivityPlan, relay: Option<RelayServerId>, now: DateTime<Utc>) {
        self.connection_type = plan.connection_type();
        self.strategy = plan.strategy;
        self.relay_server_id = relay;
        self.dispatched_at = Some(now);
        self.escalate_at = plan.escalate_after.map(|after| now + to_chrono(after));
        self.transition(SessionState::Connecting);
    }
}

/// Health windows for sweeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// No handshake for this long degrades an established session.
    pub degrade_after: Duration,
    /// No handshake for this long ends the session.
    pub stale_after: Duration,
    /// Ended sessions kept for inspection.
    pub history_limit: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            degrade_after: Duration::from_secs(180),
            stale_after: Duration::from_secs(360),
            history_limit: 1024,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Pairs that moved to `Degraded`.
    pub degraded: Vec<DevicePair>,
    /// Sessions ended as stale.
    pub ended: Vec<Session>,
}

/// Aggregate session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Active sessions.
    pub active: usize,
    /// Active sessions waiting in `Pending`.
    pub pending: usize,
    /// Active sessions in `Connecting`.
    pub connecting: usize,
    /// Active sessions in `Established`.
    pub established: usize,
    /// Active sessions in `Degraded`.
    pub degraded: usize,
    /// Active direct sessions.
    pub direct: usize,
    /// Active relayed sessions.
    pub relayed: usize,
    /// Sessions ended since start.
    pub ended_total: u64,
    /// Bytes sent across active sessions.
    pub active_bytes: u64,
}

#[derive(Debug, Default)]
struct History {
    ended: VecDeque<Session>,
    ended_total: u64,
}

/// Tracks every active session, one lock per pair.
#[derive(Debug)]
pub struct SessionTracker {
    active: RwLock<HashMap<DevicePair, Arc<Mutex<Session>>>>,
    history: Mutex<History>,
    policy: SessionPolicy,
}

impl SessionTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            history: Mutex::new(History::default()),
            policy,
        }
    }

    fn entry(&self, pair: DevicePair) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.active
            .read()
            .get(&pair)
            .cloned()
            .ok_or(SessionError::NotFound { pair })
    }

    /// Returns the active session for the pair, creating a `Pending` one.
    pub fn open(&self, pair: DevicePair, plan: &ConnectivityPlan, now: DateTime<Utc>) -> Session {
        let mut active = self.active.write();
        let entry = active.entry(pair).or_insert_with(|| {
            let session = Session::new(pair, plan, now);
            info!(session_id = %session.id, pair = %pair, strategy = ?plan.strategy, "Session opened");
            Arc::new(Mutex::new(session))
        });
        entry.lock().clone()
    }

    /// Dispatches a plan. A `Pending` session starts connecting; a session
    /// whose connection changes reconnects; otherwise nothing changes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the pair has no active session.
    pub fn dispatch(
        &self,
        pair: DevicePair,
        plan: &ConnectivityPlan,
        relay: Option<RelayServerId>,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let entry = self.entry(pair)?;
        let mut session = entry.lock();
        let changed = session.connection_type != plan.connection_type()
            || session.strategy != plan.strategy
            || session.relay_server_id != relay;

        match session.state {
            SessionState::Pending => session.redispatch(plan, relay, now),
            SessionState::Connecting | SessionState::Established | SessionState::Degraded
                if changed =>
            {
                session.redispatch(plan, relay, now);
            }
            // Reconnecting after a network change with the same plan: the
            // attempt window restarts from the reconnect.
            SessionState::Connecting if session.escalate_at.is_none() && !session.escalated => {
                let since = session.dispatched_at.unwrap_or(now);
                session.escalate_at = plan.escalate_after.map(|after| since + to_chrono(after));
            }
            _ => {}
        }
        Ok(session.clone())
    }

    /// Applies one side's heartbeat metrics.
    ///
    /// Handshake times and counters only move forward; the latency sample is
    /// replaced only by a newer report.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair has no session or `reporter` is not in it.
    pub fn apply_metrics(
        &self,
        pair: DevicePair,
        reporter: DeviceId,
        metrics: &PeerMetrics,
        observed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let entry = self.entry(pair)?;
        let mut session = entry.lock();
        let reporter_is_first = if reporter == pair.first() {
            true
        } else if reporter == pair.second() {
            false
        } else {
            return Err(SessionError::NotInPair {
                device_id: reporter,
                pair,
            });
        };

        if let Some(handshake) = metrics.last_handshake_at.map(|h| h.min(now)) {
            if handshake >= session.started_at
                && session.last_handshake_at.is_none_or(|prev| handshake > prev)
            {
                session.last_handshake_at = Some(handshake);
            }
        }

        if reporter_is_first {
            session.bytes_sent_a = session.bytes_sent_a.max(metrics.bytes_sent);
            session.bytes_received_a = session.bytes_received_a.max(metrics.bytes_received);
        } else {
            session.bytes_sent_b = session.bytes_sent_b.max(metrics.bytes_sent);
            session.bytes_received_b = session.bytes_received_b.max(metrics.bytes_received);
        }

        let newer = session.latency_observed_at.is_none_or(|prev| observed_at >= prev);
        if newer {
            if let Some(latency) = metrics.latency_ms {
                session.latency_ms = Some(latency);
                session.latency_observed_at = Some(observed_at);
            }
            if let Some(endpoint) = metrics.peer_endpoint {
                if reporter_is_first {
                    session.endpoint_b = Some(endpoint);
                } else {
                    session.endpoint_a = Some(endpoint);
                }
            }
        }

        let fresh = session
            .last_handshake_at
            .is_some_and(|h| now - h <= to_chrono(self.policy.degrade_after));
        if fresh
            && session.handshake_since_dispatch()
            && matches!(session.state, SessionState::Connecting | SessionState::Degraded)
        {
            session.escalate_at = None;
            session.transition(SessionState::Established);
        }

        debug!(session_id = %session.id, reporter = %reporter, state = ?session.state, "Applied peer metrics");
        Ok(session.clone())
    }

    /// Moves every established or degraded session of the device back to
    /// `Connecting`, keeping counters and identity. Returns the affected pairs.
    pub fn reconnect_device(&self, device_id: DeviceId, now: DateTime<Utc>) -> Vec<DevicePair> {
        let entries: Vec<Arc<Mutex<Session>>> = self
            .active
            .read()
            .iter()
            .filter(|(pair, _)| pair.contains(device_id))
            .map(|(_, entry)| Arc::clone(entry))
            .collect();

        let mut affected = Vec::new();
        for entry in entries {
            let mut session = entry.lock();
            if matches!(session.state, SessionState::Established | SessionState::Degraded) {
                session.dispatched_at = Some(now);
                session.escalate_at = None;
                session.escalated = false;
                session.transition(SessionState::Connecting);
                affected.push(session.pair);
            }
        }
        affected
    }

    /// Marks a direct attempt as failed so the next evaluation forces a relay.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the pair has no active session.
    pub fn escalate(&self, pair: DevicePair) -> Result<Session, SessionError> {
        let entry = self.entry(pair)?;
        let mut session = entry.lock();
        if !session.escalated {
            info!(session_id = %session.id, pair = %pair, "Direct attempt expired, escalating to relay");
            session.escalated = true;
        }
        Ok(session.clone())
    }

    /// Puts a session back to `Pending` while it waits for a relay. Counters,
    /// identity and the escalation flag are kept.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if the pair has no active session.
    pub fn park(&self, pair: DevicePair) -> Result<Session, SessionError> {
        let entry = self.entry(pair)?;
        let mut session = entry.lock();
        session.relay_server_id = None;
        session.escalate_at = None;
        session.transition(SessionState::Pending);
        Ok(session.clone())
    }

    /// Direct sessions whose attempt window passed without a handshake.
    #[must_use]
    pub fn due_for_escalation(&self, now: DateTime<Utc>) -> Vec<DevicePair> {
        self.collect(|s| {
            s.state == SessionState::Connecting
                && s.connection_type == ConnectionType::P2pDirect
                && !s.escalated
                && s.escalate_at.is_some_and(|at| at <= now)
        })
    }

    /// Sessions still waiting in `Pending`.
    #[must_use]
    pub fn pending(&self) -> Vec<DevicePair> {
        self.collect(|s| s.state == SessionState::Pending)
    }

    fn collect(&self, predicate: impl Fn(&Session) -> bool) -> Vec<DevicePair> {
        let mut pairs: Vec<DevicePair> = self
            .active
            .read()
            .values()
            .filter_map(|entry| {
                let session = entry.lock();
                predicate(&session).then_some(session.pair)
            })
            .collect();
        pairs.sort();
        pairs
    }

    /// Ends a session. Returns the final record, or `None` if none was active.
    pub fn end(&self, pair: DevicePair, reason: EndReason, now: DateTime<Utc>) -> Option<Session> {
        let entry = self.active.write().remove(&pair)?;
        let mut session = entry.lock();
        session.ended_at = Some(now.max(session.started_at));
        session.end_reason = Some(reason);
        session.transition(SessionState::Ended);
        let ended = session.clone();
        drop(session);

        let mut history = self.history.lock();
        history.ended_total += 1;
        history.ended.push_front(ended.clone());
        history.ended.truncate(self.policy.history_limit);
        Some(ended)
    }

    /// Active pairs involving the device.
    #[must_use]
    pub fn pairs_for_device(&self, device_id: DeviceId) -> Vec<DevicePair> {
        let mut pairs: Vec<DevicePair> = self
            .active
            .read()
            .keys()
            .filter(|pair| pair.contains(device_id))
            .copied()
            .collect();
        pairs.sort();
        pairs
    }

    /// Degrades quiet sessions and ends stale ones.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let degrade_after = to_chrono(self.policy.degrade_after);
        let stale_after = to_chrono(self.policy.stale_after);
        let entries: Vec<Arc<Mutex<Session>>> = self.active.read().values().cloned().collect();

        let mut outcome = SweepOutcome::default();
        let mut stale = Vec::new();
        for entry in entries {
            let mut session = entry.lock();
            if !matches!(session.state, SessionState::Established | SessionState::Degraded) {
                continue;
            }
            let quiet_for = now - session.last_handshake_at.unwrap_or(session.started_at);
            if quiet_for > stale_after {
                stale.push(session.pair);
            } else if quiet_for > degrade_after && session.state == SessionState::Established {
                session.transition(SessionState::Degraded);
                outcome.degraded.push(session.pair);
            }
        }

        stale.sort();
        outcome.ended = stale
            .into_iter()
            .filter_map(|pair| self.end(pair, EndReason::Stale, now))
            .collect();
        outcome.degraded.sort();
        outcome
    }

    /// Returns the active session for the pair.
    #[must_use]
    pub fn get(&self, pair: DevicePair) -> Option<Session> {
        self.entry(pair).ok().map(|entry| entry.lock().clone())
    }

    /// Every active session.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .active
            .read()
            .values()
            .map(|entry| entry.lock().clone())
            .collect();
        sessions.sort_by_key(|s| s.pair);
        sessions
    }

    /// Active sessions of the device, then its ended sessions newest first.
    #[must_use]
    pub fn sessions_for_device(&self, device_id: DeviceId) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .active_sessions()
            .into_iter()
            .filter(|s| s.pair.contains(device_id))
            .collect();
        sessions.extend(
            self.history
                .lock()
                .ended
                .iter()
                .filter(|s| s.pair.contains(device_id))
                .cloned(),
        );
        sessions
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats {
            ended_total: self.history.lock().ended_total,
            ..SessionStats::default()
        };
        for session in self.active_sessions() {
            stats.active += 1;
            stats.active_bytes = stats.active_bytes.saturating_add(session.bytes_total());
            match session.state {
                SessionState::Pending => stats.pending += 1,
                SessionState::Connecting => stats.connecting += 1,
                SessionState::Established => stats.established += 1,
                SessionState::Degraded => stats.degraded += 1,
                SessionState::Ended => {}
            }
            match session.connection_type {
                ConnectionType::P2pDirect => stats.direct += 1,
                ConnectionType::TurnRelay => stats.relayed += 1,
            }
        }
        stats
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(SessionPolicy::default())
    }
}
