//! End-to-end tests for the topology engine.
//!
//! These tests drive the public engine API through a whole device lifecycle:
//! 1. Network creation and address allocation
//! 2. NAT classification from heartbeat probes
//! 3. Relay selection and session establishment
//! 4. Revocation and pool exhaustion

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use edge_topology::{
    ConnectionType, DeviceId, DevicePair, EndReason, EngineConfig, HeartbeatReport, ManualClock,
    NatCategory, NewVirtualNetwork, OrganizationId, PeerMetrics, Platform, ProbeReport,
    RegisterDevice, RelayServer, SessionState, TopologyEngine, TopologyError, VirtualNetwork,
};
use edge_wireguard::KeyPair;

fn addr(s: &str) -> SocketAddr {
    s.parse().expect("valid socket address")
}

fn setup() -> (TopologyEngine, Arc<ManualClock>, VirtualNetwork) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = TopologyEngine::with_clock(EngineConfig::default(), clock.clone());
    let network = engine
        .create_virtual_network(NewVirtualNetwork {
            organization_id: OrganizationId::new(),
            name: "branch".to_string(),
            cidr: "10.100.0.0/29".parse().expect("cidr"),
            gateway: Ipv4Addr::new(10, 100, 0, 1),
            dns_servers: Vec::new(),
            relay_region: None,
        })
        .expect("network");
    (engine, clock, network)
}

fn register(
    engine: &TopologyEngine,
    network: &VirtualNetwork,
    name: &str,
) -> Result<(DeviceId, Ipv4Addr), TopologyError> {
    engine
        .register_device(RegisterDevice {
            network_id: network.id,
            name: name.to_string(),
            public_key: KeyPair::generate().public_key().to_base64(),
            platform: Platform::Linux,
            requested_ip: None,
        })
        .map(|r| (r.device_id, r.virtual_ip))
}

fn full_cone_probes() -> ProbeReport {
    let external = addr("203.0.113.10:41000");
    ProbeReport::default()
        .with_mapping(addr("198.51.100.1:3478"), 51820, external)
        .with_mapping(addr("198.51.100.2:3478"), 51820, external)
        .with_filtering(Some(true), Some(true))
}

fn symmetric_probes() -> ProbeReport {
    ProbeReport::default()
        .with_mapping(addr("198.51.100.1:3478"), 51820, addr("203.0.113.20:50001"))
        .with_mapping(addr("198.51.100.2:3478"), 51820, addr("203.0.113.20:50002"))
        .with_filtering(Some(false), Some(false))
}

// ============================================================================
// Full Lifecycle
// ============================================================================

#[test]
fn test_full_cone_and_symmetric_through_relay() {
    let (engine, clock, network) = setup();
    let relay = RelayServer::new(addr("192.0.2.50:3478"), 100);
    engine.register_relay(relay).expect("relay");

    let (a, ip_a) = register(&engine, &network, "device-a").expect("register a");
    assert_eq!(ip_a, Ipv4Addr::new(10, 100, 0, 2));
    let outcome = engine
        .report_heartbeat(a, HeartbeatReport::new(engine.now()).with_probes(full_cone_probes()))
        .expect("heartbeat a");
    assert_eq!(outcome.nat_category, NatCategory::FullCone);

    let (b, ip_b) = register(&engine, &network, "device-b").expect("register b");
    assert_eq!(ip_b, Ipv4Addr::new(10, 100, 0, 3));
    let outcome = engine
        .report_heartbeat(b, HeartbeatReport::new(engine.now()).with_probes(symmetric_probes()))
        .expect("heartbeat b");
    assert_eq!(outcome.nat_category, NatCategory::Symmetric);
    assert_eq!(engine.get_device_nat_category(b).expect("nat"), NatCategory::Symmetric);

    let pair = DevicePair::new(a, b).expect("pair");
    let session = engine.session(pair).expect("session");
    assert_eq!(session.state, SessionState::Connecting);
    assert_eq!(session.connection_type, ConnectionType::TurnRelay);

    // Both sides see each other through the relay.
    let view_a = &engine.get_peer_configurations(a).expect("views a")[0];
    let view_b = &engine.get_peer_configurations(b).expect("views b")[0];
    assert_eq!(view_a.peer_device_id, b);
    assert_eq!(view_b.peer_device_id, a);
    assert_eq!(view_a.endpoint, Some(addr("192.0.2.50:3478")));
    assert_eq!(view_a.persistent_keepalive_seconds, Some(25));

    clock.advance(Duration::from_secs(3));
    let now = engine.now();
    engine
        .report_heartbeat(
            a,
            HeartbeatReport::new(now).with_peer(PeerMetrics {
                peer_device_id: b,
                last_handshake_at: Some(now),
                peer_endpoint: None,
                bytes_sent: 4096,
                bytes_received: 2048,
                latency_ms: Some(40),
            }),
        )
        .expect("handshake report");
    assert_eq!(engine.session(pair).expect("session").state, SessionState::Established);

    let summary = engine.revoke_device(b).expect("revoke");
    assert_eq!(summary.released_ip, ip_b);
    assert_eq!(summary.ended_sessions.len(), 1);
    assert_eq!(summary.ended_sessions[0].end_reason, Some(EndReason::Revoked));
    assert!(engine.session(pair).is_none());
    assert!(engine.get_peer_configurations(a).expect("views").is_empty());
    assert_eq!(engine.relay_snapshot()[0].active_session_count, 0);

    let stats = engine.pool_stats(network.id).expect("stats");
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.available, 4);
}

#[test]
fn test_two_full_cone_devices_connect_directly_without_keepalive() {
    let (engine, _clock, network) = setup();
    let (a, _) = register(&engine, &network, "a").expect("a");
    let (b, _) = register(&engine, &network, "b").expect("b");
    for device in [a, b] {
        engine
            .report_heartbeat(device, HeartbeatReport::new(engine.now()).with_probes(full_cone_probes()))
            .expect("heartbeat");
    }

    let views = engine.get_peer_configurations(a).expect("views");
    assert_eq!(views[0].connection_type, ConnectionType::P2pDirect);
    assert_eq!(views[0].persistent_keepalive_seconds, None);
    let expected: ipnet::Ipv4Net = "10.100.0.3/32".parse().expect("cidr");
    assert_eq!(views[0].allowed_ips, vec![expected]);
}

// ============================================================================
// Allocation Limits
// ============================================================================

#[test]
fn test_sixth_device_exhausts_slash_29() {
    let (engine, _clock, network) = setup();
    let mut ips = Vec::new();
    for i in 0..5 {
        let (_, ip) = register(&engine, &network, &format!("device-{i}")).expect("register");
        ips.push(ip);
    }
    assert_eq!(
        ips,
        (2..=6).map(|host| Ipv4Addr::new(10, 100, 0, host)).collect::<Vec<_>>()
    );

    let err = register(&engine, &network, "one-too-many").expect_err("exhausted");
    assert_eq!(err.code(), "allocation_exhausted");
    assert!(err.to_string().contains(&network.id.to_string()));
}

#[test]
fn test_revoked_address_is_reused() {
    let (engine, _clock, network) = setup();
    let (a, ip_a) = register(&engine, &network, "a").expect("a");
    register(&engine, &network, "b").expect("b");
    engine.revoke_device(a).expect("revoke");

    let (_, ip_c) = register(&engine, &network, "c").expect("c");
    assert_eq!(ip_c, ip_a);
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_peer_configuration_reads_are_stable() {
    let (engine, _clock, network) = setup();
    let (a, _) = register(&engine, &network, "a").expect("a");
    register(&engine, &network, "b").expect("b");
    register(&engine, &network, "c").expect("c");

    let first = engine.get_peer_configurations(a).expect("views");
    engine.reevaluate();
    let second = engine.get_peer_configurations(a).expect("views");
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert!(first[0].peer_virtual_ip < first[1].peer_virtual_ip);
}

#[test]
fn test_late_heartbeat_never_rewinds_session() {
    let (engine, clock, network) = setup();
    let (a, _) = register(&engine, &network, "a").expect("a");
    let (b, _) = register(&engine, &network, "b").expect("b");
    for device in [a, b] {
        engine
            .report_heartbeat(device, HeartbeatReport::new(engine.now()).with_probes(full_cone_probes()))
            .expect("heartbeat");
    }
    let pair = DevicePair::new(a, b).expect("pair");

    clock.advance(Duration::from_secs(10));
    let fresh = engine.now();
    let metrics = |at, sent| PeerMetrics {
        peer_device_id: b,
        last_handshake_at: Some(at),
        peer_endpoint: None,
        bytes_sent: sent,
        bytes_received: 0,
        latency_ms: None,
    };
    engine
        .report_heartbeat(a, HeartbeatReport::new(fresh).with_peer(metrics(fresh, 900)))
        .expect("fresh");
    let stale_at = fresh - chrono::Duration::seconds(5);
    engine
        .report_heartbeat(a, HeartbeatReport::new(stale_at).with_peer(metrics(stale_at, 100)))
        .expect("late");

    let session = engine.session(pair).expect("session");
    assert_eq!(session.last_handshake_at, Some(fresh));
    assert_eq!(session.bytes_sent_a.max(session.bytes_sent_b), 900);
}
