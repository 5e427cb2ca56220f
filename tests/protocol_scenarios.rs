//! End-to-end protocol scenarios: benign multi-hop delivery plus one
//! test per attack class, each driving full certified instances over
//! the in-memory radio.

mod common;

use common::{hello_at, Forger, TestCa, TestNet, T0};
use convoy::{
    Config, ErrorKind, ManualClock, MessageBody, Position, QueueChannel, RoutingMessage,
    RoutingNode, VehicleInfo,
};

fn standalone(
    id: &str,
    x: f64,
    ca: &TestCa,
    clock: &ManualClock,
) -> (RoutingNode<QueueChannel, ManualClock>, QueueChannel) {
    let channel = QueueChannel::new();
    let mut node = RoutingNode::new(id, Config::default(), channel.clone(), clock.clone());
    let (cert_der, key_der) = ca.issue(id);
    let info = VehicleInfo {
        id: id.to_string(),
        position: Position::new(x, 0.0, 0.0, T0),
        speed: 0.0,
        direction: 0.0,
        certificate: cert_der,
    };
    node.initialize_with_key(info, &key_der, &ca.store()).unwrap();
    (node, channel)
}

#[test]
fn benign_three_hop_delivery() {
    let ca = TestCa::new();
    let mut net = TestNet::with_certs(
        &[
            ("veh-a", 0.0),
            ("veh-b", 200.0),
            ("veh-c", 400.0),
            ("veh-d", 600.0),
        ],
        &ca,
    );

    // Two beacon intervals push mutual trust past the threshold.
    net.beacon_round();
    net.beacon_round();
    assert!(net.node_ref("veh-a").has_neighbor("veh-b"));
    assert!(!net.node_ref("veh-a").has_neighbor("veh-d"));

    // First send has no route; it kicks off discovery.
    let err = net.node("veh-a").send_data("veh-d", b"test").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoRoute);
    net.settle(16);

    let route = net.node_ref("veh-a").route_to("veh-d").expect("route discovered");
    assert_eq!(route.next_hop, "veh-b");
    assert_eq!(route.hop_count, 3);

    // Retry rides the discovered route end to end.
    net.node("veh-a")
        .send_data("veh-d", &[0x74, 0x65, 0x73, 0x74])
        .unwrap();
    net.settle(16);

    let delivered = net.node("veh-d").take_delivered();
    assert_eq!(delivered.len(), 1, "exactly one DATA at the destination");
    assert_eq!(delivered[0].payload, vec![0x74, 0x65, 0x73, 0x74]);
    assert_eq!(delivered[0].source, "veh-a");

    // Nobody else took a delivery.
    assert!(net.node("veh-b").take_delivered().is_empty());
    assert!(net.node("veh-c").take_delivered().is_empty());
}

#[test]
fn replayed_beacon_rejected_without_trust_gain() {
    let ca = TestCa::new();
    let mut net = TestNet::with_certs(&[("veh-a", 0.0), ("veh-b", 100.0)], &ca);
    net.beacon_round();

    // Capture one fresh HELLO from A and deliver it once.
    net.clock.advance(1_000);
    net.node("veh-a").tick().unwrap();
    let captured = net.drain_from("veh-a").remove(0);
    net.inject("veh-b", &captured.bytes).unwrap();
    let trust_before = net.node_ref("veh-b").trust_of("veh-a");

    // Re-inject the identical bytes within the freshness window.
    net.clock.advance(500);
    let err = net.inject("veh-b", &captured.bytes).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Replayed);
    assert_eq!(err.peer.as_deref(), Some("veh-a"));
    assert!(
        net.node_ref("veh-b").trust_of("veh-a") < trust_before,
        "replay must not increase trust"
    );
}

#[test]
fn teleporting_neighbor_rejected_and_penalized() {
    let ca = TestCa::new();
    let clock = ManualClock::new(T0);
    let (mut a, _ch) = standalone("veh-a", 0.0, &ca, &clock);

    let (cert_b, key_b) = ca.issue("veh-b");
    let mut forger = Forger::new(&key_b, cert_b);

    a.receive_bytes(&forger.frame(&hello_at("veh-b", 0.0, T0), T0))
        .unwrap();
    let trust_before = a.trust_of("veh-b");

    // 10 km in 100 ms.
    clock.advance(100);
    let err = a
        .receive_bytes(&forger.frame(&hello_at("veh-b", 10_000.0, T0 + 100), T0 + 100))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidMovement);
    assert_eq!(err.peer.as_deref(), Some("veh-b"));

    let trust_after = a.trust_of("veh-b");
    assert!((trust_after - trust_before * 0.5).abs() < 1e-12);
    // The falsified fix never landed in the table.
    assert!(a.has_neighbor("veh-b"));
}

#[test]
fn blackhole_advertiser_loses_trust_and_routes() {
    let ca = TestCa::new();
    let clock = ManualClock::new(T0);
    let (mut a, _ch) = standalone("veh-a", 0.0, &ca, &clock);

    let (cert_m, key_m) = ca.issue("veh-m");
    let mut forger = Forger::new(&key_m, cert_m);

    // M behaves well for a while and earns solid trust.
    for i in 0..6u64 {
        let at = T0 + i * 1_000;
        clock.set(at);
        a.receive_bytes(&forger.frame(&hello_at("veh-m", 50.0, at), at))
            .unwrap();
    }
    assert!(a.is_trusted("veh-m"));

    // Then it advertises routes to 25 distinct destinations in under
    // five seconds while never being seen forwarding anything.
    let mut trust_after_21st = 1.0;
    for i in 0..25u64 {
        let at = T0 + 6_000 + i * 50;
        clock.set(at);
        let reply = RoutingMessage {
            source: format!("dest-{i}"),
            destination: "veh-a".to_string(),
            timestamp: at,
            body: MessageBody::RouteReply {
                hop_count: 1,
                lifetime_ms: 60_000,
                path: vec![format!("dest-{i}")],
            },
        };
        let result = a.receive_bytes(&forger.frame(&reply, at));
        if i < 19 {
            assert!(result.is_ok(), "advert {i} accepted before threshold");
        }
        if i == 20 {
            assert_eq!(result.unwrap_err().kind, ErrorKind::UntrustedPeer);
            trust_after_21st = a.trust_of("veh-m");
        }
    }

    assert!(
        trust_after_21st < 0.5,
        "trust {trust_after_21st} still at threshold after 21st advert"
    );
    // Every route through M is gone.
    for i in 0..19u64 {
        assert!(
            a.route_to(&format!("dest-{i}")).is_none(),
            "route dest-{i} survived"
        );
    }
}

#[test]
fn expired_certificate_keeps_sender_out() {
    let ca = TestCa::new();
    let clock = ManualClock::new(T0);
    let (mut a, _ch) = standalone("veh-a", 0.0, &ca, &clock);

    let (cert_e, key_e) = ca.issue_expired("veh-e");
    let mut forger = Forger::new(&key_e, cert_e);

    let err = a
        .receive_bytes(&forger.frame(&hello_at("veh-e", 50.0, T0), T0))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadCertificate);
    assert!(!a.has_neighbor("veh-e"));
    assert_eq!(a.neighbor_count(), 0);
}

#[test]
fn sybil_pair_penalized_together() {
    let ca = TestCa::new();
    let clock = ManualClock::new(T0);
    let (mut a, _ch) = standalone("veh-a", 0.0, &ca, &clock);

    // Two identities, one issuer, beaconing one meter apart within
    // overlapping windows.
    let (cert_1, key_1) = ca.issue("veh-s1");
    let (cert_2, key_2) = ca.issue("veh-s2");
    let mut forger_1 = Forger::new(&key_1, cert_1);
    let mut forger_2 = Forger::new(&key_2, cert_2);

    a.receive_bytes(&forger_1.frame(&hello_at("veh-s1", 100.0, T0), T0))
        .unwrap();
    let s1_before = a.trust_of("veh-s1");

    clock.advance(500);
    a.receive_bytes(&forger_2.frame(&hello_at("veh-s2", 101.0, T0 + 500), T0 + 500))
        .unwrap();

    assert!((a.trust_of("veh-s1") - s1_before * 0.5).abs() < 1e-12);
    // The second identity was penalized before its beacon observation
    // was credited.
    assert!(a.trust_of("veh-s2") < 0.5);
}

#[test]
fn stale_route_evicted_by_tick() {
    let ca = TestCa::new();
    let mut net = TestNet::with_certs(&[("veh-a", 0.0), ("veh-b", 100.0)], &ca);
    net.beacon_round();
    net.beacon_round();

    // Discover the one-hop route to B.
    let _ = net.node("veh-a").send_data("veh-b", b"ping");
    net.settle(8);
    assert!(net.node_ref("veh-a").route_to("veh-b").is_some());

    // Sixty-one seconds of silence later the route is gone.
    net.clock.advance(61_000);
    net.node("veh-a").tick().unwrap();
    assert!(net.node_ref("veh-a").route_to("veh-b").is_none());
    // The replay cache was flushed along the way too.
    assert_eq!(net.node_ref("veh-a").replay_cache_len(), 0);
}
