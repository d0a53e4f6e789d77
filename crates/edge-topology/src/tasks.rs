//! Engine maintenance as [`ScheduledTask`]s.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::debug;

use crate::relay::RelayHealthCheck;
use crate::scheduler::ScheduledTask;
use crate::topology::TopologyEngine;

/// Degrades quiet sessions and ends stale or offline ones.
#[derive(Debug)]
pub struct SessionSweepTask {
    engine: Arc<TopologyEngine>,
    interval: Duration,
}

impl SessionSweepTask {
    /// Creates the task.
    #[must_use]
    pub const fn new(engine: Arc<TopologyEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }
}

impl ScheduledTask for SessionSweepTask {
    fn name(&self) -> &'static str {
        "session-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run(&self, _now: DateTime<Utc>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.engine.sweep_sessions();
        })
    }
}

/// Escalates expired direct attempts and retries pending pairs, refreshing
/// stale relay health first.
#[derive(Debug)]
pub struct ReevaluationTask<C> {
    engine: Arc<TopologyEngine>,
    checker: C,
    interval: Duration,
}

impl<C: RelayHealthCheck> ReevaluationTask<C> {
    /// Creates the task.
    #[must_use]
    pub const fn new(engine: Arc<TopologyEngine>, checker: C, interval: Duration) -> Self {
        Self {
            engine,
            checker,
            interval,
        }
    }
}

impl<C: RelayHealthCheck> ScheduledTask for ReevaluationTask<C> {
    fn name(&self) -> &'static str {
        "reevaluate"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run(&self, _now: DateTime<Utc>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.engine.reevaluate_fresh(&self.checker).await;
        })
    }
}

/// Probes relay health, then moves sessions off relays that failed.
#[derive(Debug)]
pub struct RelayProbeTask<C> {
    engine: Arc<TopologyEngine>,
    checker: C,
    interval: Duration,
}

impl<C: RelayHealthCheck> RelayProbeTask<C> {
    /// Creates the task.
    #[must_use]
    pub const fn new(engine: Arc<TopologyEngine>, checker: C, interval: Duration) -> Self {
        Self {
            engine,
            checker,
            interval,
        }
    }
}

impl<C: RelayHealthCheck> ScheduledTask for RelayProbeTask<C> {
    fn name(&self) -> &'static str {
        "relay-probe"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run(&self, _now: DateTime<Utc>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.engine.probe_relays(&self.checker).await;
            self.engine.reevaluate();
        })
    }
}

/// Drops expired NAT classifications.
#[derive(Debug)]
pub struct NatCachePurgeTask {
    engine: Arc<TopologyEngine>,
    interval: Duration,
}

impl NatCachePurgeTask {
    /// Creates the task.
    #[must_use]
    pub const fn new(engine: Arc<TopologyEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }
}

impl ScheduledTask for NatCachePurgeTask {
    fn name(&self) -> &'static str {
        "nat-cache-purge"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run(&self, _now: DateTime<Utc>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let purged = self.engine.purge_nat_cache();
            if purged > 0 {
                debug!(purged, "Purged NAT classifications");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineConfig;
    use crate::relay::RelayServer;
    use crate::scheduler::Scheduler;
    use crate::topology::{NewVirtualNetwork, RegisterDevice};
    use crate::types::{DevicePair, OrganizationId, Platform};
    use edge_wireguard::KeyPair;
    use std::net::Ipv4Addr;

    struct AlwaysDown;

    impl RelayHealthCheck for AlwaysDown {
        async fn check(&self, _server: &RelayServer) -> bool {
            false
        }
    }

    fn engine_with_pair() -> (Arc<TopologyEngine>, Arc<ManualClock>, DevicePair) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = Arc::new(TopologyEngine::with_clock(EngineConfig::default(), clock.clone()));
        let network = engine
            .create_virtual_network(NewVirtualNetwork {
                organization_id: OrganizationId::new(),
                name: "lab".to_string(),
                cidr: "10.20.0.0/24".parse().expect("cidr"),
                gateway: Ipv4Addr::new(10, 20, 0, 1),
                dns_servers: Vec::new(),
                relay_region: None,
            })
            .expect("network");
        let mut ids = Vec::new();
        for name in ["a", "b"] {
            let registration = engine
                .register_device(RegisterDevice {
                    network_id: network.id,
                    name: name.to_string(),
                    public_key: KeyPair::generate().public_key().to_base64(),
                    platform: Platform::Linux,
                    requested_ip: None,
                })
                .expect("register");
            ids.push(registration.device_id);
        }
        let pair = DevicePair::new(ids[0], ids[1]).expect("pair");
        (engine, clock, pair)
    }

    #[tokio::test]
    async fn test_sweep_task_ends_offline_sessions() {
        let (engine, clock, pair) = engine_with_pair();
        clock.advance(Duration::from_secs(600));

        let scheduler = Scheduler::new(clock)
            .with_task(Arc::new(SessionSweepTask::new(engine.clone(), Duration::from_secs(30))));
        scheduler.run_once().await;

        assert!(engine.session(pair).is_none());
        assert_eq!(engine.session_stats().ended_total, 1);
    }

    #[tokio::test]
    async fn test_relay_probe_task_marks_relays_down() {
        let (engine, clock, pair) = engine_with_pair();
        engine
            .register_relay(RelayServer::new("192.0.2.1:3478".parse().expect("addr"), 4))
            .expect("relay");
        engine.reevaluate();
        assert!(engine.session(pair).expect("session").relay_server_id.is_some());

        let task = RelayProbeTask::new(engine.clone(), AlwaysDown, Duration::from_secs(30));
        task.run(clock.now()).await;

        assert!(!engine.relay_snapshot()[0].healthy);
        assert_eq!(engine.relay_snapshot()[0].active_session_count, 0);
        // No healthy relay remains, so the pair waits.
        assert_eq!(engine.session_stats().pending, 1);
        assert_eq!(engine.session(pair).expect("session").relay_server_id, None);
    }

    struct AlwaysUp;

    impl RelayHealthCheck for AlwaysUp {
        async fn check(&self, _server: &RelayServer) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_reevaluation_task_refreshes_downed_relay() {
        let (engine, clock, pair) = engine_with_pair();
        engine
            .register_relay(RelayServer::new("192.0.2.1:3478".parse().expect("addr"), 4))
            .expect("relay");
        RelayProbeTask::new(engine.clone(), AlwaysDown, Duration::from_secs(30))
            .run(clock.now())
            .await;
        assert_eq!(engine.session_stats().pending, 1);

        // Health data ages out, so the next pass re-probes before assigning.
        clock.advance(engine.config().relay.health_freshness() + Duration::from_secs(1));
        ReevaluationTask::new(engine.clone(), AlwaysUp, Duration::from_secs(5))
            .run(clock.now())
            .await;

        assert!(engine.relay_snapshot()[0].healthy);
        assert!(engine.session(pair).expect("session").relay_server_id.is_some());
    }

    #[test]
    fn test_task_names_are_distinct() {
        let (engine, _, _) = engine_with_pair();
        let every = Duration::from_secs(1);
        let names = [
            SessionSweepTask::new(engine.clone(), every).name(),
            ReevaluationTask::new(engine.clone(), AlwaysDown, every).name(),
            NatCachePurgeTask::new(engine.clone(), every).name(),
            RelayProbeTask::new(engine, AlwaysDown, every).name(),
        ];
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }
}
