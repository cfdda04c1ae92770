//! Relay engine: ingest, local dispatch, and forwarding decisions.
//!
//! [`RelayEngine::process_incoming`] is the single entry point for bytes off
//! any transport. It is synchronous and safe to call from many ingress
//! workers at once; each call handles one packet start to finish.
//!
//! # Forwarding
//!
//! 1. Broadcast packets go to every neighbor except the one they came from.
//! 2. Unicast packets follow the routing table when the next hop is not the
//!    origin.
//! 3. Otherwise they are tunnelled through the cheapest reachable gateway.
//! 4. Failing that, or when the wrapped packet would be too large, they are
//!    broadcast. Loops are bounded by hop decay and the dedup cache only.
//!
//! # Topology gossip
//!
//! Nodes periodically tell direct neighbors the cost of their cheapest
//! routes (TOPOLOGY_UPDATE). A receiver offers each entry to its own table
//! through the gossiping neighbor, at the cost of reaching that neighbor
//! plus the advertised cost plus [`TOPOLOGY_HOP_PENALTY`].

use crate::dedup::DeduplicationCache;
use crate::error::{MeshError, MeshResult};
use crate::gateway::GatewayCoordinator;
use crate::handler::{LocationUpdate, PacketHandler, ProfileSink, ProfileUpdate};
use crate::packet::{Packet, PacketType, BROADCAST, MAX_PAYLOAD_BYTES, PROTOCOL_VERSION};
use crate::routing::{link_cost, RouteUpdateResult, RoutingTable};
use crate::transport::TransportAggregator;
use ghostmesh_core::{Clock, MeshConfig};
use ghostmesh_crypto::{verify_packet_signature, SecurityManager};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, trace, warn};

/// Tunnels nested deeper than this are dropped.
const MAX_TUNNEL_DEPTH: usize = 4;

/// Reputation earned per gateway announcement heard.
const GATEWAY_REPUTATION: u32 = 10;

/// Reputation earned per packet relayed.
const RELAY_REPUTATION: u32 = 1;

/// Most routes carried by one topology summary.
pub const TOPOLOGY_SUMMARY_ROUTES: usize = 10;

/// Extra cost of a route learned second-hand from topology gossip.
pub const TOPOLOGY_HOP_PENALTY: f32 = 2.0;

/// Duplicates still carrying at least this many hops refresh the route
/// they arrived on.
const HEARTBEAT_MIN_HOPS: i32 = 2;

/// Where a packet was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayOutcome {
    Unicast { next_hop: String },
    Tunneled { gateway: String },
    Broadcast,
}

/// What one `process_incoming` call did.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub packet_id: String,
    pub packet_type: PacketType,
    /// Handed to a local sink, handler, or the gateway table
    pub delivered: bool,
    pub relayed: Option<RelayOutcome>,
    pub route_update: Option<RouteUpdateResult>,
    /// Arrived wrapped in a tunnel addressed to this node
    pub decapsulated: bool,
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub received: u64,
    pub delivered: u64,
    pub relayed: u64,
    pub tunneled: u64,
    pub duplicates: u64,
    pub dropped: u64,
    pub acks_sent: u64,
    pub originated: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    relayed: AtomicU64,
    tunneled: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    acks_sent: AtomicU64,
    originated: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            tunneled: self.tunneled.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            originated: self.originated.load(Ordering::Relaxed),
        }
    }
}

/// The mesh relay. Sole writer of the dedup cache, routing table and
/// gateway records.
pub struct RelayEngine {
    node_id: String,
    node_name: RwLock<String>,
    config: MeshConfig,
    clock: Arc<dyn Clock>,
    security: Option<Arc<SecurityManager>>,
    transports: Arc<TransportAggregator>,
    packet_handler: Option<Arc<dyn PacketHandler>>,
    profile_sink: Option<Arc<dyn ProfileSink>>,
    dedup: Mutex<DeduplicationCache>,
    routing: RoutingTable,
    gateways: GatewayCoordinator,
    lamport: AtomicU64,
    reputation: AtomicU32,
    battery: AtomicU8,
    counters: Counters,
}

impl RelayEngine {
    pub fn new(
        node_id: impl Into<String>,
        config: MeshConfig,
        transports: Arc<TransportAggregator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            node_name: RwLock::new(config.node_name.clone()),
            dedup: Mutex::new(DeduplicationCache::new(config.cache_capacity)),
            routing: RoutingTable::new(node_id.clone()),
            node_id,
            config,
            clock,
            security: None,
            transports,
            packet_handler: None,
            profile_sink: None,
            gateways: GatewayCoordinator::new(),
            lamport: AtomicU64::new(0),
            reputation: AtomicU32::new(0),
            battery: AtomicU8::new(100),
            counters: Counters::default(),
        }
    }

    /// Sign outgoing packets and verify incoming ones with `security`.
    ///
    /// The node id becomes the manager's x-only public key.
    pub fn with_security(mut self, security: Arc<SecurityManager>) -> Self {
        self.node_id = security.node_id().to_string();
        self.routing = RoutingTable::new(self.node_id.clone());
        self.security = Some(security);
        self
    }

    pub fn with_packet_handler(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.packet_handler = Some(handler);
        self
    }

    pub fn with_profile_sink(mut self, sink: Arc<dyn ProfileSink>) -> Self {
        self.profile_sink = Some(sink);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_name(&self) -> String {
        self.node_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_node_name(&self, name: impl Into<String>) {
        *self.node_name.write().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn gateways(&self) -> &GatewayCoordinator {
        &self.gateways
    }

    pub fn transports(&self) -> &Arc<TransportAggregator> {
        &self.transports
    }

    pub fn battery(&self) -> u8 {
        self.battery.load(Ordering::Relaxed)
    }

    pub fn set_battery(&self, level: u8) {
        self.battery.store(level.min(100), Ordering::Relaxed);
    }

    pub fn reputation(&self) -> u32 {
        self.reputation.load(Ordering::Relaxed)
    }

    pub fn lamport_time(&self) -> u64 {
        self.lamport.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn tick(&self) -> u64 {
        self.lamport.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn merge_clock(&self, remote: u64) {
        let _ = self
            .lamport
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                Some(local.max(remote).saturating_add(1))
            });
    }

    /// Remove gateway records past their TTL.
    pub fn prune_gateways(&self) -> usize {
        self.gateways.prune(self.clock.now_ms())
    }

    /// Handle raw bytes that arrived from `origin` (a qualified endpoint).
    pub fn process_incoming(&self, origin: &str, raw: &[u8]) -> MeshResult<IngestReport> {
        Counters::bump(&self.counters.received);
        let now = self.clock.now_ms();
        self.gateways.prune(now);

        let result = Packet::from_bytes(raw).and_then(|packet| self.ingest(origin, packet, now, 0));

        match &result {
            Ok(report) => {
                if report.delivered {
                    Counters::bump(&self.counters.delivered);
                }
                if report.relayed.is_some() {
                    Counters::bump(&self.counters.relayed);
                }
            }
            Err(MeshError::DuplicatePacket { id }) => {
                Counters::bump(&self.counters.duplicates);
                trace!(packet_id = %id, origin = %origin, "Duplicate dropped");
            }
            Err(e) => {
                Counters::bump(&self.counters.dropped);
                debug!(origin = %origin, error = %e, "Packet dropped");
            }
        }
        result
    }

    fn admit(&self, packet: &Packet, now: u64) -> MeshResult<()> {
        packet
            .validate_at(now)
            .map_err(|reason| MeshError::InvalidPacket {
                id: packet.id.clone(),
                reason,
            })?;

        if packet.protocol_version > PROTOCOL_VERSION {
            return Err(MeshError::UnsupportedProtocol {
                version: packet.protocol_version,
                local: PROTOCOL_VERSION,
            });
        }

        let verified = match packet.signature.as_deref() {
            Some(signature) => match &self.security {
                Some(security) => {
                    security.verify_packet(&packet.sender_id, &packet.id, &packet.payload, signature)
                }
                None => verify_packet_signature(&packet.sender_id, &packet.id, &packet.payload, signature),
            },
            None => !self.config.require_signatures,
        };
        if !verified {
            return Err(MeshError::InvalidSignature {
                id: packet.id.clone(),
                sender_id: packet.sender_id.clone(),
            });
        }
        Ok(())
    }

    fn ingest(&self, origin: &str, packet: Packet, now: u64, depth: usize) -> MeshResult<IngestReport> {
        self.admit(&packet, now)?;

        let fresh = self
            .dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_and_insert(&packet.id);
        if !fresh {
            // a near-source copy through the current next hop keeps that route alive
            if packet.hop_count >= HEARTBEAT_MIN_HOPS
                && self.routing.refresh(&packet.sender_id, origin, now)
            {
                trace!(sender_id = %packet.sender_id, origin = %origin, "Route refreshed by duplicate");
            }
            return Err(MeshError::DuplicatePacket { id: packet.id });
        }

        self.merge_clock(packet.lamport_time);

        if packet.packet_type == PacketType::Tunnel && packet.receiver_id == self.node_id {
            if depth >= MAX_TUNNEL_DEPTH {
                return Err(MeshError::MalformedPacket(format!(
                    "tunnel nesting deeper than {}",
                    MAX_TUNNEL_DEPTH
                )));
            }
            let inner = Packet::from_json(&packet.payload)?;
            debug!(outer = %packet.id, inner = %inner.id, from = %packet.sender_id, "Decapsulating tunnel");
            let mut report = self.ingest(origin, inner, now, depth + 1)?;
            report.decapsulated = true;
            return Ok(report);
        }

        let candidate_cost = packet.path_cost + link_cost(origin, packet.sender_battery);

        let route_update = (packet.sender_id != self.node_id).then(|| {
            self.routing.update_route(
                &packet.sender_id,
                origin,
                candidate_cost,
                packet.sender_battery,
                now,
            )
        });

        let is_for_me = packet.receiver_id == self.node_id || packet.is_broadcast();
        let delivered = is_for_me && self.dispatch(&packet, origin, candidate_cost, now);

        let should_relay = packet.hop_count > 0 && (packet.is_broadcast() || packet.receiver_id != self.node_id);
        let relayed = if should_relay {
            let mut copy = packet.clone();
            copy.hop_count -= 1;
            copy.path_cost = candidate_cost;
            copy.sender_battery = self.battery();
            copy.lamport_time = self.tick();
            self.reputation.fetch_add(RELAY_REPUTATION, Ordering::Relaxed);

            match self.relay(&copy, Some(origin)) {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!(packet_id = %copy.id, error = %e, "Relay failed");
                    None
                }
            }
        } else {
            None
        };

        trace!(
            packet_id = %packet.id,
            packet_type = ?packet.packet_type,
            origin = %origin,
            delivered,
            relayed = relayed.is_some(),
            "Packet processed"
        );

        Ok(IngestReport {
            packet_id: packet.id,
            packet_type: packet.packet_type,
            delivered,
            relayed,
            route_update,
            decapsulated: false,
        })
    }

    /// Local handling of a packet addressed to this node or broadcast.
    fn dispatch(&self, packet: &Packet, origin: &str, path_cost: f32, now: u64) -> bool {
        match packet.packet_type {
            PacketType::TopologyUpdate => match self.merge_topology(packet, origin, path_cost, now) {
                Some(learned) => {
                    debug!(from = %packet.sender_id, learned, "Topology merged");
                    true
                }
                None => {
                    debug!(packet_id = %packet.id, "Unparseable topology payload");
                    false
                }
            },
            PacketType::GatewayAvailable => {
                self.gateways.record(&packet.sender_id, now);
                self.reputation.fetch_add(GATEWAY_REPUTATION, Ordering::Relaxed);
                true
            }
            PacketType::ProfileSync => match ProfileUpdate::parse(packet) {
                Some(update) => {
                    if let Some(sink) = &self.profile_sink {
                        sink.on_profile(update);
                    }
                    true
                }
                None => {
                    debug!(packet_id = %packet.id, "Unparseable profile payload");
                    false
                }
            },
            PacketType::LocationUpdate => match LocationUpdate::parse(packet) {
                Some(update) => {
                    if let Some(sink) = &self.profile_sink {
                        sink.on_location(update);
                    }
                    true
                }
                None => {
                    debug!(packet_id = %packet.id, "Unparseable location payload");
                    false
                }
            },
            kind if kind.is_application() => {
                if let Some(handler) = &self.packet_handler {
                    handler.on_packet(packet);
                }
                if kind.requires_ack() && !packet.is_broadcast() {
                    self.send_ack(packet);
                }
                true
            }
            _ => false,
        }
    }

    /// Offer every entry of a neighbor's route summary. Returns how many
    /// routes were added or replaced, `None` if the payload does not parse.
    fn merge_topology(&self, packet: &Packet, origin: &str, path_cost: f32, now: u64) -> Option<usize> {
        let summary: BTreeMap<String, f32> = serde_json::from_str(&packet.payload).ok()?;
        let learned = summary
            .into_iter()
            .filter(|(destination, remote)| {
                *destination != self.node_id
                    && *destination != packet.sender_id
                    && remote.is_finite()
                    && *remote >= 0.0
            })
            .filter(|(destination, remote)| {
                let cost = path_cost + remote + TOPOLOGY_HOP_PENALTY;
                matches!(
                    self.routing.update_route(destination, origin, cost, 100, now),
                    RouteUpdateResult::NewRoute | RouteUpdateResult::UpdatedRoute
                )
            })
            .count();
        Some(learned)
    }

    /// Cheapest known routes, destination to cost.
    pub fn topology_summary(&self) -> BTreeMap<String, f32> {
        self.routing
            .snapshot()
            .into_iter()
            .take(TOPOLOGY_SUMMARY_ROUTES)
            .map(|route| (route.destination, route.cost))
            .collect()
    }

    /// Tell direct neighbors about our cheapest routes.
    ///
    /// Nothing is sent while the routing table is empty.
    pub fn send_topology_update(&self) -> MeshResult<Option<RelayOutcome>> {
        let summary = self.topology_summary();
        if summary.is_empty() {
            return Ok(None);
        }
        let packet = Packet::new(
            self.node_id.clone(),
            self.node_name(),
            BROADCAST,
            PacketType::TopologyUpdate,
            serde_json::to_string(&summary)?,
        )
        .with_hop_count(1)
        .with_timestamp(self.clock.now_ms());
        self.send_packet(packet).map(Some)
    }

    fn send_ack(&self, packet: &Packet) {
        let ack = Packet::new(
            self.node_id.clone(),
            self.node_name(),
            packet.sender_id.clone(),
            PacketType::Ack,
            packet.id.clone(),
        )
        .with_hop_count(i32::from(self.config.default_hop_count))
        .with_timestamp(self.clock.now_ms());

        match self.send_packet(ack) {
            Ok(_) => Counters::bump(&self.counters.acks_sent),
            Err(e) => warn!(packet_id = %packet.id, error = %e, "Failed to send ACK"),
        }
    }

    /// Forward `packet`, never back to `exclude`.
    pub fn relay(&self, packet: &Packet, exclude: Option<&str>) -> MeshResult<RelayOutcome> {
        if packet.is_broadcast() {
            self.transports.broadcast_except(packet, exclude);
            return Ok(RelayOutcome::Broadcast);
        }

        if let Some(route) = self.routing.route_to(&packet.receiver_id) {
            if Some(route.next_hop.as_str()) != exclude {
                self.transports.send(packet, Some(&route.next_hop))?;
                return Ok(RelayOutcome::Unicast {
                    next_hop: route.next_hop,
                });
            }
        }

        if self.gateways.has_fresh_gateway(self.clock.now_ms()) {
            match self.tunnel(packet) {
                Ok(gateway) => return Ok(RelayOutcome::Tunneled { gateway }),
                Err(MeshError::RouteUnavailable { .. }) => {}
                Err(MeshError::OversizedPacket { size, .. }) => {
                    debug!(packet_id = %packet.id, size, "Too large to tunnel, broadcasting");
                }
                Err(e) => return Err(e),
            }
        }

        trace!(packet_id = %packet.id, destination = %packet.receiver_id, "No route, broadcasting");
        self.transports.broadcast_except(packet, exclude);
        Ok(RelayOutcome::Broadcast)
    }

    /// Wrap `packet` for the cheapest gateway we have a route to.
    ///
    /// Returns the gateway id.
    pub fn tunnel(&self, packet: &Packet) -> MeshResult<String> {
        let now = self.clock.now_ms();
        let (gateway, route) = self
            .gateways
            .fresh_gateways(now)
            .into_iter()
            .filter(|gateway| *gateway != self.node_id)
            .filter_map(|gateway| self.routing.route_to(&gateway).map(|route| (gateway, route)))
            .min_by(|(_, a), (_, b)| a.cost.total_cmp(&b.cost))
            .ok_or_else(|| MeshError::RouteUnavailable {
                destination: packet.receiver_id.clone(),
            })?;

        let payload = packet.to_json()?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(MeshError::OversizedPacket {
                size: payload.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        let mut outer = Packet::new(
            self.node_id.clone(),
            self.node_name(),
            gateway.clone(),
            PacketType::Tunnel,
            payload,
        )
        .with_hop_count(i32::from(self.config.tunnel_hop_count))
        .with_timestamp(now);
        self.stamp(&mut outer)?;
        self.mark_seen(&outer.id);

        self.transports.send(&outer, Some(&route.next_hop))?;
        Counters::bump(&self.counters.tunneled);
        debug!(
            packet_id = %packet.id,
            gateway = %gateway,
            next_hop = %route.next_hop,
            "Tunnelled via gateway"
        );
        Ok(gateway)
    }

    /// Originate `packet` from this node.
    ///
    /// Sender fields, battery, path cost, clock, reputation, protocol version
    /// and (with a security manager) the signature are overwritten.
    pub fn send_packet(&self, mut packet: Packet) -> MeshResult<RelayOutcome> {
        packet.sender_id = self.node_id.clone();
        packet.sender_name = self.node_name();
        self.stamp(&mut packet)?;
        self.mark_seen(&packet.id);
        Counters::bump(&self.counters.originated);
        self.relay(&packet, None)
    }

    fn stamp(&self, packet: &mut Packet) -> MeshResult<()> {
        packet.sender_battery = self.battery();
        packet.path_cost = 0.0;
        packet.lamport_time = self.tick();
        packet.reputation = self.reputation();
        packet.protocol_version = PROTOCOL_VERSION;
        if let Some(security) = &self.security {
            packet.signature = Some(security.sign_packet(&packet.id, &packet.payload)?);
        }
        Ok(())
    }

    fn mark_seen(&self, id: &str) {
        self.dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_and_insert(id);
    }

    /// Whether `id` is currently held by the dedup cache.
    pub fn has_seen(&self, id: &str) -> bool {
        self.dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}
