//! Engine configuration.
//!
//! Every tunable the engine reads lives here, loaded from TOML:
//! - Device liveness and session health windows
//! - Hole-punch timeouts and backoff
//! - NAT classification cache and probe timeouts
//! - Relay health freshness and credential lifetime
//! - Peer defaults rendered into client configs

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{path}': {message}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying error.
        message: String,
    },
    /// The content is not valid TOML for this schema.
    #[error("invalid TOML: {0}")]
    Parse(String),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Device liveness and session health windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// A device is online while its last heartbeat is within this window.
    pub device_window_secs: u64,
    /// Expected `WireGuard` handshake interval.
    pub handshake_interval_secs: u64,
    /// A session without a handshake for this long is degraded.
    pub degrade_after_secs: u64,
    /// A session is stale after this many handshake intervals.
    pub stale_multiplier: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            device_window_secs: 300,
            handshake_interval_secs: 120,
            degrade_after_secs: 180,
            stale_multiplier: 3,
        }
    }
}

impl LivenessConfig {
    /// Device liveness window.
    #[must_use]
    pub const fn device_window(&self) -> Duration {
        Duration::from_secs(self.device_window_secs)
    }

    /// Degradation threshold.
    #[must_use]
    pub const fn degrade_after(&self) -> Duration {
        Duration::from_secs(self.degrade_after_secs)
    }

    /// Staleness threshold: `stale_multiplier` handshake intervals.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.handshake_interval_secs)
            .saturating_mul(self.stale_multiplier)
    }
}

/// Hole-punch tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HolePunchConfig {
    /// Timeout of a single direct attempt.
    pub direct_timeout_ms: u64,
    /// Window in which simultaneous punching keeps retrying.
    pub retry_window_ms: u64,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single retry delay.
    pub max_backoff_ms: u64,
    /// Growth factor between retries.
    pub backoff_multiplier: f64,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            direct_timeout_ms: 5_000,
            retry_window_ms: 30_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// NAT classification tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// How long a classification is reused before re-probing.
    pub cache_ttl_secs: u64,
    /// Upper bound on one probe round-trip.
    pub probe_timeout_ms: u64,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            probe_timeout_ms: 3_000,
        }
    }
}

impl NatConfig {
    /// Cache TTL.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Relay pool tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Health data older than this is re-probed before assignment.
    pub health_freshness_secs: u64,
    /// Upper bound on one health probe.
    pub probe_timeout_ms: u64,
    /// Upper bound on the re-probe that precedes an assignment.
    pub assign_timeout_ms: u64,
    /// Lifetime of generated TURN credentials.
    pub credential_lifetime_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            health_freshness_secs: 60,
            probe_timeout_ms: 2_000,
            assign_timeout_ms: 1_500,
            credential_lifetime_secs: 600,
        }
    }
}

impl RelayConfig {
    /// Health freshness window.
    #[must_use]
    pub const fn health_freshness(&self) -> Duration {
        Duration::from_secs(self.health_freshness_secs)
    }

    /// Per-probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Assignment re-probe timeout.
    #[must_use]
    pub const fn assign_timeout(&self) -> Duration {
        Duration::from_millis(self.assign_timeout_ms)
    }

    /// Credential lifetime.
    #[must_use]
    pub const fn credential_lifetime(&self) -> Duration {
        Duration::from_secs(self.credential_lifetime_secs)
    }

    /// Credentials this close to expiry are re-issued: a fifth of the lifetime.
    #[must_use]
    pub const fn credential_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.credential_lifetime_secs / 5)
    }
}

/// Defaults rendered into peer and client configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerDefaults {
    /// Keepalive interval when NAT mappings need refreshing.
    pub keepalive_secs: u16,
    /// `ListenPort` written into client configs.
    pub listen_port: u16,
}

impl Default for PeerDefaults {
    fn default() -> Self {
        Self {
            keepalive_secs: 25,
            listen_port: 51820,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Liveness windows.
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// Hole-punch tuning.
    #[serde(default)]
    pub hole_punch: HolePunchConfig,
    /// NAT classification tuning.
    #[serde(default)]
    pub nat: NatConfig,
    /// Relay pool tuning.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Peer defaults.
    #[serde(default)]
    pub peer: PeerDefaults,
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            message: e.to_string(),
        })?;

        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.liveness.device_window_secs == 0 {
            return invalid("liveness.device_window_secs must be greater than 0");
        }
        if self.liveness.handshake_interval_secs == 0 {
            return invalid("liveness.handshake_interval_secs must be greater than 0");
        }
        if self.liveness.stale_multiplier == 0 {
            return invalid("liveness.stale_multiplier must be greater than 0");
        }
        if self.liveness.degrade_after() >= self.liveness.stale_after() {
            return invalid("liveness.degrade_after_secs must be shorter than the stale threshold");
        }
        if self.hole_punch.direct_timeout_ms == 0 {
            return invalid("hole_punch.direct_timeout_ms must be greater than 0");
        }
        if self.hole_punch.retry_window_ms < self.hole_punch.direct_timeout_ms {
            return invalid("hole_punch.retry_window_ms must be at least direct_timeout_ms");
        }
        if self.hole_punch.initial_backoff_ms == 0
            || self.hole_punch.max_backoff_ms < self.hole_punch.initial_backoff_ms
        {
            return invalid("hole_punch backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms");
        }
        if !(self.hole_punch.backoff_multiplier >= 1.0 && self.hole_punch.backoff_multiplier.is_finite()) {
            return invalid("hole_punch.backoff_multiplier must be a finite value >= 1.0");
        }
        if self.nat.probe_timeout_ms == 0 {
            return invalid("nat.probe_timeout_ms must be greater than 0");
        }
        if self.relay.probe_timeout_ms == 0 || self.relay.assign_timeout_ms == 0 {
            return invalid("relay probe and assign timeouts must be greater than 0");
        }
        if self.relay.credential_lifetime_secs == 0 {
            return invalid("relay.credential_lifetime_secs must be greater than 0");
        }

        Ok(())
    }

    /// Serializes the configuration back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
