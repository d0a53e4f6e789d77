//! Connectivity strategy selection.
//!
//! A pure function of the two NAT categories picks how a pair should connect:
//!
//! ```text
//!                 FullCone  Restricted  PortRestr  Symmetric  Unknown
//! FullCone        Direct    Direct      Direct     Relay      Relay
//! Restricted                Retry       Retry      Relay      Relay
//! PortRestricted                        Retry      Relay      Relay
//! Symmetric                                        Relay      Relay
//! Unknown                                                     Relay
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::HolePunchConfig;
use crate::types::{ConnectionType, NatCategory};

/// How a pair attempts to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One direct attempt with a short timeout.
    Direct,
    /// Simultaneous hole punching with exponential backoff.
    DirectWithRetry,
    /// Go straight through a TURN relay.
    Relay,
}

impl Strategy {
    /// The connection type this strategy produces.
    #[must_use]
    pub const fn connection_type(self) -> ConnectionType {
        match self {
            Self::Direct | Self::DirectWithRetry => ConnectionType::P2pDirect,
            Self::Relay => ConnectionType::TurnRelay,
        }
    }
}

/// Decides the strategy for two NAT categories. Total and symmetric.
#[must_use]
pub const fn decide(a: NatCategory, b: NatCategory) -> Strategy {
    use crate::types::NatCategory::{FullCone, PortRestrictedCone, RestrictedCone, Symmetric, Unknown};

    match (a, b) {
        (Symmetric | Unknown, _) | (_, Symmetric | Unknown) => Strategy::Relay,
        (FullCone, FullCone | RestrictedCone | PortRestrictedCone)
        | (RestrictedCone | PortRestrictedCone, FullCone) => Strategy::Direct,
        (RestrictedCone | PortRestrictedCone, RestrictedCone | PortRestrictedCone) => {
            Strategy::DirectWithRetry
        }
    }
}

/// Hole-punch timing derived from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HolePunchPolicy {
    /// Timeout of a single direct attempt.
    pub direct_timeout: Duration,
    /// Window for simultaneous punching before escalating to a relay.
    pub retry_window: Duration,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Cap on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between retries.
    pub backoff_multiplier: f64,
}

impl Default for HolePunchPolicy {
    fn default() -> Self {
        Self::from(&HolePunchConfig::default())
    }
}

impl From<&HolePunchConfig> for HolePunchPolicy {
    fn from(config: &HolePunchConfig) -> Self {
        Self {
            direct_timeout: Duration::from_millis(config.direct_timeout_ms),
            retry_window: Duration::from_millis(config.retry_window_ms),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl HolePunchPolicy {
    /// Delay before retry `attempt` (1-based), capped at `max_backoff`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_millis = (self.initial_backoff.as_millis() as f64 * multiplier) as u64;
        Duration::from_millis(delay_millis).min(self.max_backoff)
    }

    /// Retry delays that fit inside the retry window, in order.
    #[must_use]
    pub fn retry_schedule(&self) -> Vec<Duration> {
        let mut schedule = Vec::new();
        let mut elapsed = self.direct_timeout;
        let mut attempt = 1;
        loop {
            let delay = self.delay_for_attempt(attempt);
            elapsed += delay + self.direct_timeout;
            if elapsed > self.retry_window || delay.is_zero() {
                break;
            }
            schedule.push(delay);
            attempt += 1;
        }
        schedule
    }
}

/// A strategy together with its timing budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityPlan {
    /// The chosen strategy.
    pub strategy: Strategy,
    /// Timeout of each attempt.
    pub attempt_timeout: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before each retry.
    pub backoff: Vec<Duration>,
    /// Time after dispatch at which a missing handshake escalates to a relay.
    /// `None` for relay plans.
    pub escalate_after: Option<Duration>,
}

impl ConnectivityPlan {
    /// The connection type this plan produces.
    #[must_use]
    pub const fn connection_type(&self) -> ConnectionType {
        self.strategy.connection_type()
    }
}

/// Turns NAT categories into connectivity plans.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityStrategist {
    policy: HolePunchPolicy,
}

impl ConnectivityStrategist {
    /// Creates a strategist with the given policy.
    #[must_use]
    pub const fn new(policy: HolePunchPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy in use.
    #[must_use]
    pub const fn policy(&self) -> &HolePunchPolicy {
        &self.policy
    }

    /// Plans the connection for a pair.
    #[must_use]
    pub fn plan(&self, a: NatCategory, b: NatCategory) -> ConnectivityPlan {
        self.plan_for(decide(a, b))
    }

    /// Builds the plan for a given strategy.
    #[must_use]
    pub fn plan_for(&self, strategy: Strategy) -> ConnectivityPlan {
        match strategy {
            Strategy::Direct => ConnectivityPlan {
                strategy,
                attempt_timeout: self.policy.direct_timeout,
                max_attempts: 1,
                backoff: Vec::new(),
                escalate_after: Some(self.policy.direct_timeout),
            },
            Strategy::DirectWithRetry => {
                let backoff = self.policy.retry_schedule();
                ConnectivityPlan {
                    strategy,
                    attempt_timeout: self.policy.direct_timeout,
                    max_attempts: backoff.len() as u32 + 1,
                    backoff,
                    escalate_after: Some(self.policy.retry_window),
                }
            }
            Strategy::Relay => ConnectivityPlan {
                strategy,
                attempt_timeout: self.policy.direct_timeout,
                max_attempts: 1,
                backoff: Vec::new(),
                escalate_after: None,
            },
        }
    }
}
