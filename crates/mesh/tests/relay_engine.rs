//! Relay engine behavior against recording transports.

mod common;

use common::{chat, packet_from, Harness, Sent, NOW};
use ghostmesh_core::{ManualClock, MeshConfig, SecurityConfig};
use ghostmesh_crypto::{SecurityManager, SoftwareKeyStore};
use ghostmesh_mesh::packet::{MAX_FUTURE_SKEW_MS, MAX_PACKET_AGE_MS, MAX_PAYLOAD_BYTES, MAX_WIRE_BYTES};
use ghostmesh_mesh::{
    MeshError, Packet, PacketType, RelayEngine, RelayOutcome, RouteUpdateResult,
    TransportAggregator, BROADCAST,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_distinct_packets_each_delivered_once() {
    let h = Harness::new();

    h.ingest("LAN:a", &chat("A")).unwrap();
    h.ingest("LAN:a", &chat("A")).unwrap();

    assert_eq!(h.collector.packet_count(), 2);
    assert_eq!(h.engine.stats().delivered, 2);
}

#[test]
fn test_duplicate_dropped() {
    let h = Harness::new();
    let packet = chat("A");

    h.ingest("LAN:a", &packet).unwrap();
    let second = h.ingest("Bluetooth:b", &packet);

    assert!(matches!(second, Err(MeshError::DuplicatePacket { .. })));
    assert_eq!(h.collector.packet_count(), 1);
    assert_eq!(h.engine.stats().duplicates, 1);
}

#[test]
fn test_first_id_redelivered_after_eviction() {
    let capacity = 4;
    let h = Harness::with_config(MeshConfig {
        cache_capacity: capacity,
        ..MeshConfig::default()
    });

    let packets: Vec<_> = (0..=capacity).map(|_| chat("A")).collect();
    for packet in &packets {
        h.ingest("LAN:a", packet).unwrap();
    }

    let replay = h.ingest("LAN:a", &packets[0]).unwrap();
    assert!(replay.delivered);
    assert_eq!(h.collector.packet_count(), capacity + 2);

    // The most recent ids are still remembered
    assert!(h.ingest("LAN:a", &packets[capacity]).is_err());
}

#[test]
fn test_zero_hop_delivered_not_relayed() {
    let h = Harness::new();
    let to_all = chat("A").with_hop_count(0);
    let to_me = packet_from("A", "me", PacketType::Reaction, "+1").with_hop_count(0);

    let report = h.ingest("LAN:a", &to_all).unwrap();
    assert!(report.delivered);
    assert!(report.relayed.is_none());

    let report = h.ingest("LAN:a", &to_me).unwrap();
    assert!(report.delivered);
    assert!(report.relayed.is_none());

    assert!(h.sent().is_empty());
}

#[test]
fn test_future_timestamp_boundary() {
    let h = Harness::new();

    let at_bound = chat("A").with_timestamp(NOW + MAX_FUTURE_SKEW_MS);
    assert!(h.ingest("LAN:a", &at_bound).is_ok());

    let past_bound = chat("A").with_timestamp(NOW + MAX_FUTURE_SKEW_MS + 1);
    assert!(matches!(
        h.ingest("LAN:a", &past_bound),
        Err(MeshError::InvalidPacket { .. })
    ));
}

#[test]
fn test_past_timestamp_boundary() {
    let h = Harness::new();

    let at_bound = chat("A").with_timestamp(NOW - MAX_PACKET_AGE_MS);
    assert!(h.ingest("LAN:a", &at_bound).is_ok());

    let past_bound = chat("A").with_timestamp(NOW - MAX_PACKET_AGE_MS - 1);
    assert!(matches!(
        h.ingest("LAN:a", &past_bound),
        Err(MeshError::InvalidPacket { .. })
    ));
    assert_eq!(h.engine.stats().dropped, 1);
}

#[test]
fn test_oversized_rejected_before_parse() {
    let h = Harness::new();
    let raw = vec![b'{'; MAX_WIRE_BYTES + 1];

    assert!(matches!(
        h.engine.process_incoming("LAN:a", &raw),
        Err(MeshError::OversizedPacket { .. })
    ));
}

#[test]
fn test_malformed_dropped() {
    let h = Harness::new();
    assert!(matches!(
        h.engine.process_incoming("LAN:a", b"\x00\x01garbage"),
        Err(MeshError::MalformedPacket(_))
    ));
}

#[test]
fn test_lan_route_example() {
    let h = Harness::new();
    let packet = packet_from("A", BROADCAST, PacketType::LinkState, "").with_hop_count(2);

    let report = h.ingest("LAN:epA", &packet).unwrap();
    assert_eq!(report.route_update, Some(RouteUpdateResult::NewRoute));

    let route = h.engine.routing().route_to("A").unwrap();
    assert_eq!(route.next_hop, "LAN:epA");
    assert_eq!(route.cost, 1.0);
}

#[test]
fn test_cheaper_path_supersedes_costlier_does_not() {
    let h = Harness::new();

    // Bluetooth link: 0 + 10
    h.ingest("Bluetooth:x", &packet_from("A", BROADCAST, PacketType::LinkState, ""))
        .unwrap();
    assert_eq!(h.engine.routing().route_to("A").unwrap().cost, 10.0);

    h.clock.advance(Duration::from_secs(5));
    let mut cheaper = packet_from("A", BROADCAST, PacketType::LinkState, "").with_timestamp(h.clock_now());
    cheaper.path_cost = 3.0;
    let report = h.ingest("LAN:y", &cheaper).unwrap();
    assert_eq!(report.route_update, Some(RouteUpdateResult::UpdatedRoute));
    assert_eq!(h.engine.routing().route_to("A").unwrap().cost, 4.0);

    h.clock.advance(Duration::from_secs(5));
    let mut costlier = packet_from("A", BROADCAST, PacketType::LinkState, "").with_timestamp(h.clock_now());
    costlier.path_cost = 5.0;
    let report = h.ingest("Mystery:z", &costlier).unwrap();
    assert_eq!(report.route_update, Some(RouteUpdateResult::Ignored));

    let route = h.engine.routing().route_to("A").unwrap();
    assert_eq!(route.cost, 4.0);
    assert_eq!(route.next_hop, "LAN:y");
}

#[test]
fn test_low_battery_raises_link_cost() {
    let h = Harness::new();
    let mut packet = packet_from("A", BROADCAST, PacketType::BatteryHeartbeat, "12");
    packet.sender_battery = 12;

    h.ingest("LAN:a", &packet).unwrap();
    assert_eq!(h.engine.routing().route_to("A").unwrap().cost, 5.0);
}

#[test]
fn test_broadcast_relay_excludes_origin() {
    let h = Harness::new();
    h.engine.set_battery(42);
    let packet = chat("A").with_hop_count(3);

    let report = h.ingest("LAN:a", &packet).unwrap();
    assert_eq!(report.relayed, Some(RelayOutcome::Broadcast));

    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    let Sent::AllExcept(skip, relayed) = &sent[0] else {
        panic!("LAN should skip the origin, got {:?}", sent[0]);
    };
    assert_eq!(skip, "a");
    assert_eq!(relayed.hop_count, 2);
    assert_eq!(relayed.path_cost, 1.0);
    assert_eq!(relayed.sender_battery, 42);
    assert_eq!(relayed.id, packet.id);
    assert!(matches!(&sent[1], Sent::All(_)));
}

#[test]
fn test_unicast_follows_route() {
    let h = Harness::new();
    h.ingest("Bluetooth:b", &packet_from("B", BROADCAST, PacketType::LinkState, "").with_hop_count(0))
        .unwrap();

    let packet = packet_from("A", "B", PacketType::Chat, "ciphertext");
    let report = h.ingest("LAN:a", &packet).unwrap();

    assert!(!report.delivered);
    assert_eq!(
        report.relayed,
        Some(RelayOutcome::Unicast {
            next_hop: "Bluetooth:b".to_string()
        })
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], Sent::To(target, p) if target == "b" && p.hop_count == 2));
}

#[test]
fn test_unicast_never_bounces_to_origin() {
    let h = Harness::new();
    h.ingest("LAN:a", &packet_from("B", BROADCAST, PacketType::LinkState, "").with_hop_count(0))
        .unwrap();

    let report = h.ingest("LAN:a", &packet_from("A", "B", PacketType::Chat, "x")).unwrap();

    assert_eq!(report.relayed, Some(RelayOutcome::Broadcast));
    let sent = h.sent();
    assert!(matches!(&sent[0], Sent::AllExcept(skip, _) if skip == "a"));
}

#[test]
fn test_ack_synthesized_for_unicast_content() {
    let h = Harness::new();
    let packet = packet_from("A", "me", PacketType::Chat, "ciphertext");

    let report = h.ingest("LAN:a", &packet).unwrap();
    assert!(report.delivered);
    assert!(report.relayed.is_none());

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let Sent::To(target, ack) = &sent[0] else {
        panic!("ACK should be unicast, got {:?}", sent[0]);
    };
    assert_eq!(target, "a");
    assert_eq!(ack.packet_type, PacketType::Ack);
    assert_eq!(ack.receiver_id, "A");
    assert_eq!(ack.sender_id, "me");
    assert_eq!(ack.payload, packet.id);
    assert_eq!(h.engine.stats().acks_sent, 1);
}

#[test]
fn test_no_ack_for_broadcast_or_non_content() {
    let h = Harness::new();
    h.ingest("LAN:a", &chat("A").with_hop_count(0)).unwrap();
    h.ingest("LAN:a", &packet_from("A", "me", PacketType::TypingStart, "").with_hop_count(0))
        .unwrap();

    assert!(h.sent().is_empty());
    assert_eq!(h.collector.packet_count(), 2);
}

#[test]
fn test_tunnel_decapsulated_and_acked() {
    let h = Harness::new();
    let inner = packet_from("X", "me", PacketType::Chat, "from the internet");
    let outer = packet_from("GW", "me", PacketType::Tunnel, &inner.to_json().unwrap());

    let report = h.ingest("LAN:gw", &outer).unwrap();

    assert!(report.decapsulated);
    assert!(report.delivered);
    assert_eq!(report.packet_id, inner.id);
    assert_eq!(h.collector.packets.lock().unwrap()[0].payload, "from the internet");

    let sent = h.sent();
    assert!(sent
        .iter()
        .any(|s| s.packet().packet_type == PacketType::Ack && s.packet().payload == inner.id));
}

#[test]
fn test_malformed_tunnel_payload() {
    let h = Harness::new();
    let outer = packet_from("GW", "me", PacketType::Tunnel, "{broken");

    assert!(matches!(
        h.ingest("LAN:gw", &outer),
        Err(MeshError::MalformedPacket(_))
    ));
}

fn wrapped_in_tunnels(inner: Packet, layers: usize) -> Packet {
    (0..layers).fold(inner, |packet, _| {
        packet_from("GW", "me", PacketType::Tunnel, &packet.to_json().unwrap())
    })
}

#[test]
fn test_four_nested_tunnels_delivered() {
    let h = Harness::new();
    let inner = packet_from("X", "me", PacketType::Chat, "deep");

    let report = h.ingest("LAN:gw", &wrapped_in_tunnels(inner.clone(), 4)).unwrap();
    assert!(report.decapsulated);
    assert!(report.delivered);
    assert_eq!(report.packet_id, inner.id);
}

#[test]
fn test_five_nested_tunnels_rejected() {
    let h = Harness::new();
    let inner = packet_from("X", "me", PacketType::Chat, "too deep");

    assert!(matches!(
        h.ingest("LAN:gw", &wrapped_in_tunnels(inner, 5)),
        Err(MeshError::MalformedPacket(_))
    ));
    assert_eq!(h.collector.packet_count(), 0);
    assert_eq!(h.engine.stats().dropped, 1);
}

#[test]
fn test_tunnel_not_for_me_is_relayed() {
    let h = Harness::new();
    let inner = packet_from("X", "Y", PacketType::Chat, "x");
    let outer = packet_from("GW", "OTHER", PacketType::Tunnel, &inner.to_json().unwrap());

    let report = h.ingest("LAN:gw", &outer).unwrap();
    assert!(!report.decapsulated);
    assert!(!report.delivered);
    assert!(report.relayed.is_some());
}

#[test]
fn test_unroutable_packet_tunnelled_via_gateway() {
    let h = Harness::new();
    h.ingest(
        "LAN:g",
        &packet_from("G", BROADCAST, PacketType::GatewayAvailable, "ACTIVE").with_hop_count(0),
    )
    .unwrap();
    assert_eq!(h.engine.gateways().len(), 1);

    let packet = packet_from("S", "Z", PacketType::Chat, "far away");
    let report = h.ingest("Bluetooth:s", &packet).unwrap();

    assert_eq!(
        report.relayed,
        Some(RelayOutcome::Tunneled {
            gateway: "G".to_string()
        })
    );
    let sent = h.sent();
    let Sent::To(target, outer) = &sent[0] else {
        panic!("tunnel should be unicast, got {:?}", sent[0]);
    };
    assert_eq!(target, "g");
    assert_eq!(outer.packet_type, PacketType::Tunnel);
    assert_eq!(outer.receiver_id, "G");
    assert_eq!(outer.hop_count, 3);
    let wrapped = ghostmesh_mesh::Packet::from_json(&outer.payload).unwrap();
    assert_eq!(wrapped.id, packet.id);
    assert_eq!(wrapped.receiver_id, "Z");
    assert_eq!(h.engine.stats().tunneled, 1);
}

#[test]
fn test_too_large_to_tunnel_is_broadcast() {
    let h = Harness::new();
    h.ingest(
        "LAN:g",
        &packet_from("G", BROADCAST, PacketType::GatewayAvailable, "ACTIVE").with_hop_count(0),
    )
    .unwrap();

    // fits on the wire, but not once wrapped in a tunnel
    let payload = "x".repeat(MAX_PAYLOAD_BYTES - 100);
    let packet = packet_from("S", "Z", PacketType::Chat, &payload);
    let report = h.ingest("Bluetooth:a", &packet).unwrap();

    assert_eq!(report.relayed, Some(RelayOutcome::Broadcast));
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|s| s.packet().id == packet.id));
    assert!(sent.iter().any(|s| matches!(s, Sent::AllExcept(skip, _) if skip == "a")));
    assert_eq!(h.engine.stats().tunneled, 0);
}

#[test]
fn test_cheapest_gateway_chosen() {
    let h = Harness::new();
    for (origin, gateway) in [("Bluetooth:far", "G-FAR"), ("LAN:near", "G-NEAR")] {
        h.ingest(
            origin,
            &packet_from(gateway, BROADCAST, PacketType::GatewayAvailable, "ACTIVE").with_hop_count(0),
        )
        .unwrap();
    }

    let report = h.ingest("LAN:s", &packet_from("S", "Z", PacketType::Chat, "x")).unwrap();
    assert_eq!(
        report.relayed,
        Some(RelayOutcome::Tunneled {
            gateway: "G-NEAR".to_string()
        })
    );
}

#[test]
fn test_expired_gateway_not_used() {
    let h = Harness::new();
    h.ingest(
        "LAN:g",
        &packet_from("G", BROADCAST, PacketType::GatewayAvailable, "ACTIVE").with_hop_count(0),
    )
    .unwrap();

    h.clock.advance(Duration::from_millis(300_001));
    let packet = packet_from("S", "Z", PacketType::Chat, "x").with_timestamp(h.clock_now());
    let report = h.ingest("Bluetooth:s", &packet).unwrap();

    assert_eq!(report.relayed, Some(RelayOutcome::Broadcast));
    assert!(h.engine.gateways().is_empty());
    // The route to the old gateway survives; only the gateway record expired
    assert!(h.engine.routing().route_to("G").is_some());
}

#[test]
fn test_gateway_record_pruned_by_sweep() {
    let h = Harness::new();
    h.ingest(
        "LAN:g",
        &packet_from("G", BROADCAST, PacketType::GatewayAvailable, "ACTIVE").with_hop_count(0),
    )
    .unwrap();

    h.clock.advance(Duration::from_millis(300_000));
    assert_eq!(h.engine.prune_gateways(), 0);
    h.clock.advance(Duration::from_millis(1));
    assert_eq!(h.engine.prune_gateways(), 1);
}

#[test]
fn test_profile_and_location_sinks() {
    let h = Harness::new();
    h.ingest(
        "LAN:a",
        &packet_from("A", BROADCAST, PacketType::ProfileSync, "Alice|scouting|#FF1744").with_hop_count(0),
    )
    .unwrap();
    h.ingest(
        "LAN:a",
        &packet_from("A", BROADCAST, PacketType::LocationUpdate, "48.8566|2.3522").with_hop_count(0),
    )
    .unwrap();

    let profiles = h.collector.profiles.lock().unwrap();
    assert_eq!(profiles[0].name, "Alice");
    assert_eq!(profiles[0].status, "scouting");
    let locations = h.collector.locations.lock().unwrap();
    assert_eq!(locations[0].node_id, "A");
    assert_eq!(locations[0].latitude, 48.8566);
    // Profiles and locations never reach the packet handler
    assert_eq!(h.collector.packet_count(), 0);
}

#[test]
fn test_control_packets_update_routing_only() {
    let h = Harness::new();
    let report = h
        .ingest("LAN:a", &packet_from("A", BROADCAST, PacketType::KeepAlive, "PULSE").with_hop_count(1))
        .unwrap();

    assert!(!report.delivered);
    assert_eq!(report.route_update, Some(RouteUpdateResult::NewRoute));
    assert_eq!(report.relayed, Some(RelayOutcome::Broadcast));
    assert_eq!(h.collector.packet_count(), 0);
}

#[test]
fn test_topology_gossip_learns_second_hand_routes() {
    let h = Harness::new();
    // already one LAN hop from X
    h.ingest("LAN:x", &packet_from("X", BROADCAST, PacketType::LinkState, "").with_hop_count(0))
        .unwrap();

    let gossip = packet_from(
        "N",
        BROADCAST,
        PacketType::TopologyUpdate,
        r#"{"X":3.0,"Y":4.5,"me":1.0,"N":0.0}"#,
    )
    .with_hop_count(1);
    let report = h.ingest("LAN:n", &gossip).unwrap();
    assert!(report.delivered);

    // 1 to reach N, 4.5 advertised, 2 for the extra hop
    let y = h.engine.routing().route_to("Y").unwrap();
    assert_eq!(y.next_hop, "LAN:n");
    assert_eq!(y.cost, 7.5);
    // the direct route is cheaper than 1 + 3 + 2
    assert_eq!(h.engine.routing().route_to("X").unwrap().next_hop, "LAN:x");
    assert_eq!(h.engine.routing().route_to("N").unwrap().cost, 1.0);
    assert!(h.engine.routing().route_to("me").is_none());
    assert_eq!(h.engine.routing().len(), 3);
    assert_eq!(h.collector.packet_count(), 0);
}

#[test]
fn test_unparseable_topology_ignored() {
    let h = Harness::new();
    let gossip = packet_from("N", BROADCAST, PacketType::TopologyUpdate, "X=3").with_hop_count(0);

    let report = h.ingest("LAN:n", &gossip).unwrap();
    assert!(!report.delivered);
    assert_eq!(h.engine.routing().len(), 1);
}

#[test]
fn test_topology_update_carries_cheapest_ten() {
    let h = Harness::new();
    assert_eq!(h.engine.send_topology_update().unwrap(), None);
    assert!(h.sent().is_empty());

    for i in 0..12 {
        let mut packet = packet_from(&format!("N{}", i), BROADCAST, PacketType::LinkState, "").with_hop_count(0);
        packet.path_cost = i as f32;
        h.ingest("LAN:hub", &packet).unwrap();
    }
    let summary = h.engine.topology_summary();
    assert_eq!(summary.len(), 10);
    assert!(!summary.contains_key("N10"));
    assert!(!summary.contains_key("N11"));
    assert_eq!(summary.get("N0"), Some(&1.0));

    assert_eq!(h.engine.send_topology_update().unwrap(), Some(RelayOutcome::Broadcast));
    let sent = h.sent();
    let gossip = sent[0].packet();
    assert_eq!(gossip.packet_type, PacketType::TopologyUpdate);
    assert_eq!(gossip.receiver_id, BROADCAST);
    assert_eq!(gossip.hop_count, 1);
    let advertised: BTreeMap<String, f32> = serde_json::from_str(&gossip.payload).unwrap();
    assert_eq!(advertised, summary);
}

#[test]
fn test_near_source_duplicate_keeps_route_fresh() {
    let h = Harness::new();
    let packet = chat("A").with_hop_count(3);
    h.ingest("LAN:a", &packet).unwrap();

    h.clock.advance(Duration::from_secs(20));
    assert!(matches!(
        h.ingest("LAN:a", &packet),
        Err(MeshError::DuplicatePacket { .. })
    ));
    assert_eq!(h.engine.routing().route_to("A").unwrap().last_update, NOW + 20_000);

    // 35 s after learning, 15 s after the refresh
    h.clock.advance(Duration::from_secs(15));
    let costlier = packet_from("A", BROADCAST, PacketType::LinkState, "").with_timestamp(h.clock_now());
    let report = h.ingest("Cloud:c", &costlier).unwrap();
    assert_eq!(report.route_update, Some(RouteUpdateResult::Ignored));
    assert_eq!(h.engine.routing().route_to("A").unwrap().next_hop, "LAN:a");
}

#[test]
fn test_far_travelled_duplicate_does_not_refresh() {
    let h = Harness::new();
    let packet = chat("A").with_hop_count(1);
    h.ingest("LAN:a", &packet).unwrap();

    h.clock.advance(Duration::from_secs(20));
    assert!(h.ingest("LAN:a", &packet).is_err());
    assert_eq!(h.engine.routing().route_to("A").unwrap().last_update, NOW);

    h.clock.advance(Duration::from_secs(15));
    let costlier = packet_from("A", BROADCAST, PacketType::LinkState, "").with_timestamp(h.clock_now());
    let report = h.ingest("Cloud:c", &costlier).unwrap();
    assert_eq!(report.route_update, Some(RouteUpdateResult::UpdatedRoute));
}

#[test]
fn test_local_send_stamps_and_broadcasts_without_route() {
    let h = Harness::new();
    h.engine.set_battery(55);
    let mut packet = packet_from("ignored", "Z", PacketType::Chat, "x");
    packet.path_cost = 99.0;

    let outcome = h.engine.send_packet(packet.clone()).unwrap();
    assert_eq!(outcome, RelayOutcome::Broadcast);

    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    let stamped = sent[0].packet();
    assert!(matches!(&sent[0], Sent::All(_)));
    assert_eq!(stamped.sender_id, "me");
    assert_eq!(stamped.sender_battery, 55);
    assert_eq!(stamped.path_cost, 0.0);
    assert!(stamped.lamport_time > 0);
    assert!(h.engine.has_seen(&packet.id));
}

fn signed_engine(require_signatures: bool) -> (RelayEngine, SecurityManager) {
    let clock = Arc::new(ManualClock::new(NOW));
    let local = Arc::new(SecurityManager::new(
        Arc::new(SoftwareKeyStore::from_seeds([1u8; 32], [2u8; 32]).unwrap()),
        &SecurityConfig::default(),
        clock.clone(),
    ));
    let remote = SecurityManager::new(
        Arc::new(SoftwareKeyStore::from_seeds([3u8; 32], [4u8; 32]).unwrap()),
        &SecurityConfig::default(),
        clock.clone(),
    );
    let engine = RelayEngine::new(
        "placeholder",
        MeshConfig {
            require_signatures,
            ..MeshConfig::default()
        },
        Arc::new(TransportAggregator::new()),
        clock,
    )
    .with_security(local);
    (engine, remote)
}

#[test]
fn test_signature_verified_when_present() {
    let (engine, remote) = signed_engine(false);
    assert_eq!(engine.node_id().len(), 64);

    let mut packet = chat(remote.node_id()).with_hop_count(0);
    packet.signature = Some(remote.sign_packet(&packet.id, &packet.payload).unwrap());
    assert!(engine.process_incoming("LAN:r", &packet.to_bytes().unwrap()).is_ok());

    let mut forged = chat(remote.node_id()).with_hop_count(0);
    forged.signature = Some(remote.sign_packet(&forged.id, "something else").unwrap());
    assert!(matches!(
        engine.process_incoming("LAN:r", &forged.to_bytes().unwrap()),
        Err(MeshError::InvalidSignature { .. })
    ));
}

#[test]
fn test_unsigned_rejected_when_required() {
    let (engine, remote) = signed_engine(true);
    let packet = chat(remote.node_id()).with_hop_count(0);

    assert!(matches!(
        engine.process_incoming("LAN:r", &packet.to_bytes().unwrap()),
        Err(MeshError::InvalidSignature { .. })
    ));
}

#[test]
fn test_concurrent_ingest_is_safe() {
    let h = Arc::new(Harness::new());
    let packets: Vec<_> = (0..200).map(|_| chat("A").with_hop_count(0)).collect();

    std::thread::scope(|scope| {
        for chunk in packets.chunks(50) {
            let h = h.clone();
            scope.spawn(move || {
                for packet in chunk {
                    // Every packet is submitted twice from different endpoints
                    let _ = h.ingest("LAN:a", packet);
                    let _ = h.ingest("Bluetooth:b", packet);
                }
            });
        }
    });

    assert_eq!(h.collector.packet_count(), 200);
    assert_eq!(h.engine.stats().duplicates, 200);
}
