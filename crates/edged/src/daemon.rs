//! Startup seeding and the maintenance loop.

use std::future::Future;
use std::sync::Arc;

use edge_topology::{
    NatCachePurgeTask, ReevaluationTask, RelayProbeTask, Scheduler,
    SessionSweepTask, SystemClock, TopologyEngine, VirtualNetwork,
};
use tracing::info;

use crate::config::DaemonConfig;
use crate::health::TcpConnectCheck;

/// Creates the configured networks and registers the configured relays.
///
/// # Errors
///
/// Returns an error if a network or relay is rejected by the engine.
pub fn seed(engine: &TopologyEngine, config: &DaemonConfig) -> anyhow::Result<Vec<VirtualNetwork>> {
    let organization_id = config.organization_id.unwrap_or_default();

    let networks = config
        .networks
        .iter()
        .map(|seed| {
            engine
                .create_virtual_network(seed.to_request(organization_id))
                .map_err(|e| anyhow::anyhow!("network '{}': {e}", seed.name))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    for seed in &config.relays {
        engine
            .register_relay(seed.to_server())
            .map_err(|e| anyhow::anyhow!("relay {}: {e}", seed.address))?;
    }

    info!(
        organization_id = %organization_id,
        networks = networks.len(),
        relays = config.relays.len(),
        "Seeded topology"
    );
    Ok(networks)
}

/// Builds the maintenance scheduler for an engine.
#[must_use]
pub fn scheduler(engine: &Arc<TopologyEngine>, config: &DaemonConfig) -> Scheduler {
    let schedule = &config.schedule;
    let checker = TcpConnectCheck::new(config.engine.relay.probe_timeout());

    Scheduler::new(Arc::new(SystemClock))
        .with_task(Arc::new(SessionSweepTask::new(
            Arc::clone(engine),
            schedule.sweep_interval(),
        )))
        .with_task(Arc::new(ReevaluationTask::new(
            Arc::clone(engine),
            checker,
            schedule.reevaluate_interval(),
        )))
        .with_task(Arc::new(RelayProbeTask::new(
            Arc::clone(engine),
            checker,
            schedule.relay_probe_interval(),
        )))
        .with_task(Arc::new(NatCachePurgeTask::new(
            Arc::clone(engine),
            schedule.nat_purge_interval(),
        )))
}

/// Runs the control plane until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if seeding fails.
pub async fn run(config: DaemonConfig, shutdown: impl Future<Output = ()>) -> anyhow::Result<Arc<TopologyEngine>> {
    let engine = Arc::new(TopologyEngine::new(config.engine.clone()));
    seed(&engine, &config)?;

    let handle = scheduler(&engine, &config).start();
    info!("edged running");

    shutdown.await;
    info!("Shutting down");
    handle.stop().await;
    Ok(engine)
}
