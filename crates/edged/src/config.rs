//! Daemon configuration.
//!
//! Wraps the engine's [`EngineConfig`] with what the daemon itself needs:
//! - Virtual networks to create at startup
//! - Relay servers to register at startup
//! - Intervals for the maintenance tasks

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use edge_topology::{ConfigError, EngineConfig, NewVirtualNetwork, OrganizationId, RelayServer};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// A virtual network created at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSeed {
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

impl NetworkSeed {
    /// Builds the engine request for this seed.
    #[must_use]
    pub fn to_request(&self, organization_id: OrganizationId) -> NewVirtualNetwork {
        NewVirtualNetwork {
            organization_id,
            name: self.name.clone(),
            cidr: self.cidr,
            gateway: self.gateway,
            dns_servers: self.dns_servers.clone(),
            relay_region: self.relay_region.clone(),
        }
    }
}

/// A relay server registered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySeed {
    /// TURN listen address.
    pub address: SocketAddr,
    /// Maximum concurrent sessions.
    pub capacity: u32,
    /// Region label.
    #[serde(default)]
    pub region: Option<String>,
}

impl RelaySeed {
    /// Builds the relay record for this seed.
    #[must_use]
    pub fn to_server(&self) -> RelayServer {
        let server = RelayServer::new(self.address, self.capacity);
        match &self.region {
            Some(region) => server.with_region(region.clone()),
            None => server,
        }
    }
}

/// How often each maintenance task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Session sweep interval.
    pub sweep_interval_secs: u64,
    /// Re-evaluation interval.
    pub reevaluate_interval_secs: u64,
    /// Relay health probe interval.
    pub relay_probe_interval_secs: u64,
    /// NAT cache purge interval.
    pub nat_purge_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            reevaluate_interval_secs: 5,
            relay_probe_interval_secs: 30,
            nat_purge_interval_secs: 60,
        }
    }
}

impl ScheduleConfig {
    /// Session sweep interval.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Re-evaluation interval.
    #[must_use]
    pub const fn reevaluate_interval(&self) -> Duration {
        Duration::from_secs(self.reevaluate_interval_secs)
    }

    /// Relay probe interval.
    #[must_use]
    pub const fn relay_probe_interval(&self) -> Duration {
        Duration::from_secs(self.relay_probe_interval_secs)
    }

    /// NAT cache purge interval.
    #[must_use]
    pub const fn nat_purge_interval(&self) -> Duration {
        Duration::from_secs(self.nat_purge_interval_secs)
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Organization that owns the seeded networks. A fresh id is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<OrganizationId>,
    /// Engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Maintenance intervals.
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Networks to create at startup.
    #[serde(default)]
    pub networks: Vec<NetworkSeed>,
    /// Relays to register at startup.
    #[serde(default)]
    pub relays: Vec<RelaySeed>,
}

impl DaemonConfig {
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

    /// Validates the engine section, intervals and seeds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;

        let schedule = &self.schedule;
        if [
            schedule.sweep_interval_secs,
            schedule.reevaluate_interval_secs,
            schedule.relay_probe_interval_secs,
            schedule.nat_purge_interval_secs,
        ]
        .contains(&0)
        {
            return Err(ConfigError::Invalid(
                "schedule intervals must be greater than 0".to_string(),
            ));
        }

        for relay in &self.relays {
            if relay.capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "relay {} must have a capacity greater than 0",
                    relay.address
                )));
            }
        }

        for (i, network) in self.networks.iter().enumerate() {
            if self.networks[..i].iter().any(|n| n.name == network.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate network name '{}'",
                    network.name
                )));
            }
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

    /// A starting configuration with one network and one relay.
    #[must_use]
    pub fn sample() -> Self {
        Self {
            networks: vec![NetworkSeed {
                name: "default".to_string(),
                cidr: Ipv4Net::new(Ipv4Addr::new(10, 100, 0, 0), 24).unwrap_or_default(),
                gateway: Ipv4Addr::new(10, 100, 0, 1),
                dns_servers: vec![IpAddr::V4(Ipv4Addr::new(10, 100, 0, 1))],
                relay_region: None,
            }],
            relays: vec![RelaySeed {
                address: SocketAddr::from((Ipv4Addr::LOCALHOST, 3478)),
                capacity: 100,
                region: None,
            }],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DaemonConfig::from_toml("").expect("should parse");
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.schedule.reevaluate_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_seeds_parse() {
        let toml = r#"
[engine.peer]
keepalive_secs = 15

[[networks]]
name = "office"
cidr = "10.10.0.0/24"
gateway = "10.10.0.1"
dns_servers = ["10.10.0.1"]

[[relays]]
address = "192.0.2.1:3478"
capacity = 50
region = "eu-west"
"#;
        let config = DaemonConfig::from_toml(toml).expect("should parse");
        assert_eq!(config.engine.peer.keepalive_secs, 15);
        assert_eq!(config.networks.len(), 1);
        assert_eq!(config.networks[0].gateway, Ipv4Addr::new(10, 10, 0, 1));

        let server = config.relays[0].to_server();
        assert_eq!(server.capacity_limit, 50);
        assert_eq!(server.region.as_deref(), Some("eu-west"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = DaemonConfig::from_toml("[schedule]\nsweep_interval_secs = 0\n").expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_engine_section_validated() {
        let err = DaemonConfig::from_toml("[engine.liveness]\nstale_multiplier = 0\n").expect_err("invalid");
        assert!(err.to_string().contains("stale_multiplier"));
    }

    #[test]
    fn test_duplicate_network_names_rejected() {
        let mut config = DaemonConfig::sample();
        config.networks.push(config.networks[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_round_trips_through_file() {
        let sample = DaemonConfig::sample();
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(sample.to_toml().expect("serialize").as_bytes())
            .expect("write");

        let loaded = DaemonConfig::from_file(file.path()).expect("load");
        assert_eq!(loaded, sample);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = DaemonConfig::from_file("/nonexistent/edged.toml").expect_err("missing");
        assert!(err.to_string().contains("/nonexistent/edged.toml"));
    }
}
