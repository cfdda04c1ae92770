//! Mesh node runtime.
//!
//! Wires the relay engine to its transports and owns every background task:
//!
//! - one ingress worker per transport, draining a bounded queue into
//!   [`RelayEngine::process_incoming`];
//! - a periodic gateway record sweep;
//! - a periodic KEEP_ALIVE broadcast;
//! - a periodic TOPOLOGY_UPDATE route summary;
//! - a connectivity watcher that brings the cloud transport up with
//!   exponential backoff while this node is a gateway.
//!
//! All tasks observe one [`CancellationToken`]. [`MeshNode::stop`] cancels
//! it and awaits every handle; [`MeshNode::start`] makes a fresh token, so
//! tasks never outlive a stop/start cycle.

use crate::error::{MeshError, MeshResult};
use crate::gateway::{gateway_announcement, neighbor_list, GatewayTransition, NeighborInfo};
use crate::handler::{PacketHandler, ProfileSink};
use crate::packet::{Packet, PacketType, BROADCAST};
use crate::relay::{EngineStats, RelayEngine, RelayOutcome};
use crate::routing::RouteEntry;
use crate::transport::{split_endpoint, Transport, TransportAggregator, TransportCallback};
use ghostmesh_core::{Clock, Config, SystemClock};
use ghostmesh_crypto::{SecurityManager, SoftwareKeyStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// First cloud reconnect delay.
pub const CLOUD_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Cloud reconnect delays stop doubling here.
pub const CLOUD_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Payload of the periodic keep-alive.
pub const KEEP_ALIVE_PAYLOAD: &str = "PULSE";

type Frame = (String, Vec<u8>);

/// Node-wide snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshStats {
    pub engine: EngineStats,
    pub routes: usize,
    pub known_gateways: usize,
    pub connections: usize,
    pub sessions: usize,
    pub is_gateway: bool,
    pub running: bool,
}

struct Runtime {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Builder for [`MeshNode`].
pub struct MeshNodeBuilder {
    config: Config,
    security: Option<Arc<SecurityManager>>,
    clock: Arc<dyn Clock>,
    transports: Vec<Arc<dyn Transport>>,
    cloud: Option<Arc<dyn Transport>>,
    packet_handler: Option<Arc<dyn PacketHandler>>,
    profile_sink: Option<Arc<dyn ProfileSink>>,
}

impl MeshNodeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            security: None,
            clock: Arc::new(SystemClock),
            transports: Vec::new(),
            cloud: None,
            packet_handler: None,
            profile_sink: None,
        }
    }

    pub fn security(mut self, security: Arc<SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Transport started only while this node acts as a gateway.
    pub fn cloud_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.cloud = Some(transport);
        self
    }

    pub fn packet_handler(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.packet_handler = Some(handler);
        self
    }

    pub fn profile_sink(mut self, sink: Arc<dyn ProfileSink>) -> Self {
        self.profile_sink = Some(sink);
        self
    }

    pub fn build(self) -> MeshResult<MeshNode> {
        self.config
            .validate()
            .map_err(|e| MeshError::Config(e.to_string()))?;

        let security = match self.security {
            Some(security) => security,
            None => Arc::new(SecurityManager::new(
                Arc::new(SoftwareKeyStore::generate()),
                &self.config.security,
                self.clock.clone(),
            )),
        };

        let mut aggregator = TransportAggregator::new();
        for transport in self.transports {
            aggregator = aggregator.with_transport(transport);
        }
        let cloud = match self.cloud {
            Some(cloud) => {
                let name = cloud.name().to_string();
                aggregator = aggregator.with_on_demand_transport(cloud);
                Some(name)
            }
            None => None,
        };
        let transports = Arc::new(aggregator);

        let handler = Arc::new(KeyExchangeHandler {
            security: security.clone(),
            inner: self.packet_handler,
        });
        let mut engine = RelayEngine::new(
            security.node_id(),
            self.config.mesh.clone(),
            transports.clone(),
            self.clock,
        )
        .with_security(security.clone())
        .with_packet_handler(handler);
        if let Some(sink) = self.profile_sink {
            engine = engine.with_profile_sink(sink);
        }

        let (cloud_wanted, _) = watch::channel(false);

        Ok(MeshNode {
            config: self.config,
            engine: Arc::new(engine),
            transports,
            security,
            cloud,
            cloud_wanted,
            runtime: Mutex::new(None),
        })
    }
}

/// Installs session keys from KEY_EXCHANGE packets before the application
/// sees them.
///
/// A key is only taken from a packet signed by the `senderId` it claims,
/// whatever `require_signatures` says. Rejected exchanges are not passed on.
struct KeyExchangeHandler {
    security: Arc<SecurityManager>,
    inner: Option<Arc<dyn PacketHandler>>,
}

impl KeyExchangeHandler {
    fn install_key(&self, packet: &Packet) -> bool {
        let Some(signature) = packet.signature.as_deref() else {
            warn!(peer_id = %packet.sender_id, packet_id = %packet.id, "Unsigned key exchange dropped");
            return false;
        };
        if !self
            .security
            .verify_packet(&packet.sender_id, &packet.id, &packet.payload, signature)
        {
            warn!(peer_id = %packet.sender_id, packet_id = %packet.id, "Key exchange signature invalid");
            return false;
        }

        match self
            .security
            .establish_session_base64(&packet.sender_id, &packet.payload)
        {
            Ok(()) => {
                info!(peer_id = %packet.sender_id, "Session key installed");
                true
            }
            Err(e) => {
                warn!(peer_id = %packet.sender_id, error = %e, "Key exchange rejected");
                false
            }
        }
    }
}

impl PacketHandler for KeyExchangeHandler {
    fn on_packet(&self, packet: &Packet) {
        if packet.packet_type == PacketType::KeyExchange && !self.install_key(packet) {
            return;
        }
        if let Some(inner) = &self.inner {
            inner.on_packet(packet);
        }
    }
}

/// Top-level callback: routes each transport's frames to its own worker.
struct IngressRouter {
    queues: HashMap<String, mpsc::Sender<Frame>>,
}

impl TransportCallback for IngressRouter {
    fn on_bytes_received(&self, endpoint_id: &str, raw: &[u8]) {
        let Some(queue) = split_endpoint(endpoint_id).and_then(|(name, _)| self.queues.get(name)) else {
            debug!(endpoint = %endpoint_id, "Frame from unregistered transport");
            return;
        };
        match queue.try_send((endpoint_id.to_string(), raw.to_vec())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(endpoint = %endpoint_id, "Ingress queue full, frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(endpoint = %endpoint_id, "Ingress worker gone, frame dropped");
            }
        }
    }

    fn on_connection_set_changed(&self, connections: HashMap<String, String>) {
        debug!(connections = connections.len(), "Neighbors changed");
    }

    fn on_error(&self, message: &str) {
        warn!(error = %message, "Transport error");
    }
}

/// A running (or stoppable) mesh participant.
pub struct MeshNode {
    config: Config,
    engine: Arc<RelayEngine>,
    transports: Arc<TransportAggregator>,
    security: Arc<SecurityManager>,
    cloud: Option<String>,
    cloud_wanted: watch::Sender<bool>,
    runtime: Mutex<Option<Runtime>>,
}

impl MeshNode {
    pub fn builder(config: Config) -> MeshNodeBuilder {
        MeshNodeBuilder::new(config)
    }

    pub fn node_id(&self) -> &str {
        self.engine.node_id()
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    /// Start transports and background tasks.
    pub async fn start(&self) -> MeshResult<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Err(MeshError::InvalidState("mesh node already running".to_string()));
        }

        let token = CancellationToken::new();
        let mesh = &self.config.mesh;
        let mut handles = Vec::new();
        let mut queues = HashMap::new();

        for name in self.transports.names() {
            let (tx, rx) = mpsc::channel(mesh.ingress_queue_depth);
            queues.insert(name.clone(), tx);
            handles.push(tokio::spawn(ingress_worker(
                name,
                self.engine.clone(),
                rx,
                token.clone(),
            )));
        }
        self.transports.set_callback(Arc::new(IngressRouter { queues }));

        let display_name = self.engine.node_name();
        let stealth = self.engine.gateways().is_stealth();
        let started = self.transports.start(&display_name, stealth);

        handles.push(tokio::spawn(prune_loop(
            self.engine.clone(),
            Duration::from_secs(mesh.gateway_prune_interval_secs.max(1)),
            token.clone(),
        )));

        if mesh.keep_alive_interval_secs > 0 {
            handles.push(tokio::spawn(keep_alive_loop(
                self.engine.clone(),
                Duration::from_secs(mesh.keep_alive_interval_secs),
                token.clone(),
            )));
        }

        if mesh.topology_interval_secs > 0 {
            handles.push(tokio::spawn(topology_loop(
                self.engine.clone(),
                Duration::from_secs(mesh.topology_interval_secs),
                token.clone(),
            )));
        }

        if let Some(cloud) = &self.cloud {
            handles.push(tokio::spawn(connectivity_watcher(
                self.engine.clone(),
                cloud.clone(),
                self.cloud_wanted.subscribe(),
                token.clone(),
            )));
        }

        info!(
            node_id = %self.node_id(),
            transports = started,
            tasks = handles.len(),
            "Mesh node started"
        );
        *runtime = Some(Runtime { token, handles });
        Ok(())
    }

    /// Cancel every task, wait for them, and stop every transport.
    pub async fn stop(&self) {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return;
        };

        runtime.token.cancel();
        for handle in runtime.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.transports.stop_all();
        self.transports.clear_callback();
        info!(node_id = %self.node_id(), "Mesh node stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Background tasks currently owned by the node.
    pub async fn task_count(&self) -> usize {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|runtime| runtime.handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Report upstream internet reachability.
    pub fn set_internet_reachable(&self, reachable: bool) {
        let transition = self.engine.gateways().set_internet_reachable(reachable);
        self.apply_transition(transition);
    }

    /// Toggle stealth. Running local transports are restarted so their
    /// advertisement follows the new flag.
    pub fn set_stealth(&self, stealth: bool) {
        let gateways = self.engine.gateways();
        let changed = gateways.is_stealth() != stealth;
        let transition = gateways.set_stealth(stealth);
        if changed {
            let restarted = self.transports.restart_running(&self.engine.node_name(), stealth);
            debug!(stealth, restarted, "Transports restarted for stealth change");
        }
        self.apply_transition(transition);
    }

    fn apply_transition(&self, transition: GatewayTransition) {
        match transition {
            GatewayTransition::Activate => {
                self.cloud_wanted.send_replace(true);
                let announcement = gateway_announcement(self.node_id(), &self.engine.node_name());
                if let Err(e) = self.engine.send_packet(announcement) {
                    warn!(error = %e, "Gateway announcement failed");
                }
            }
            GatewayTransition::Deactivate => {
                self.cloud_wanted.send_replace(false);
            }
            GatewayTransition::Unchanged => {}
        }
    }

    pub fn is_gateway(&self) -> bool {
        self.engine.gateways().is_gateway()
    }

    pub fn set_battery(&self, level: u8) {
        self.engine.set_battery(level);
    }

    /// Report the local neighbor list, most recently active first.
    ///
    /// While this node is a gateway, a changed selection is broadcast as
    /// NEIGHBOR_LIST. Returns whether one was sent.
    pub fn update_local_neighbors(&self, neighbors: &[NeighborInfo]) -> MeshResult<bool> {
        let Some(selected) = self.engine.gateways().select_proxied(neighbors) else {
            return Ok(false);
        };
        let packet = neighbor_list(self.node_id(), &self.engine.node_name(), &selected)?
            .with_timestamp(self.engine.now_ms());
        self.engine.send_packet(packet)?;
        info!(neighbors = selected.len(), "Neighbor list broadcast");
        Ok(true)
    }

    /// Originate a packet.
    pub fn send(&self, packet: Packet) -> MeshResult<RelayOutcome> {
        self.engine.send_packet(packet)
    }

    /// Encrypt and send a chat message. Returns the packet id.
    ///
    /// Unicast text needs an established session; without one this fails
    /// and nothing is sent.
    pub fn send_text(&self, receiver_id: &str, text: &str) -> MeshResult<String> {
        let peer = (receiver_id != BROADCAST).then_some(receiver_id);
        let ciphertext = self.security.encrypt(text, peer)?;

        let packet = Packet::new(
            self.node_id(),
            self.engine.node_name(),
            receiver_id,
            PacketType::Chat,
            ciphertext,
        )
        .with_hop_count(i32::from(self.config.mesh.default_hop_count))
        .with_timestamp(self.engine.now_ms());
        let id = packet.id.clone();

        self.engine.send_packet(packet)?;
        Ok(id)
    }

    /// Decrypt the payload of a received content packet.
    pub fn open_payload(&self, packet: &Packet) -> MeshResult<String> {
        let peer = (!packet.is_broadcast()).then_some(packet.sender_id.as_str());
        Ok(self.security.decrypt(&packet.payload, peer)?)
    }

    /// Send this node's agreement key to `receiver_id` (or everyone).
    pub fn announce_key(&self, receiver_id: &str) -> MeshResult<RelayOutcome> {
        let packet = Packet::new(
            self.node_id(),
            self.engine.node_name(),
            receiver_id,
            PacketType::KeyExchange,
            self.security.agreement_public_key_base64(),
        )
        .with_hop_count(i32::from(self.config.mesh.default_hop_count))
        .with_timestamp(self.engine.now_ms());
        self.engine.send_packet(packet)
    }

    pub fn routing_snapshot(&self) -> Vec<RouteEntry> {
        self.engine.routing().snapshot()
    }

    pub fn connections(&self) -> HashMap<String, String> {
        self.transports.connections()
    }

    pub async fn stats(&self) -> MeshStats {
        MeshStats {
            engine: self.engine.stats(),
            routes: self.engine.routing().len(),
            known_gateways: self.engine.gateways().len(),
            connections: self.transports.connections().len(),
            sessions: self.security.sessions().len(),
            is_gateway: self.is_gateway(),
            running: self.is_running().await,
        }
    }
}

async fn ingress_worker(
    transport: String,
    engine: Arc<RelayEngine>,
    mut frames: mpsc::Receiver<Frame>,
    token: CancellationToken,
) {
    debug!(transport = %transport, "Ingress worker started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = frames.recv() => match frame {
                // Drop reasons are logged inside the engine
                Some((origin, raw)) => {
                    let _ = engine.process_incoming(&origin, &raw);
                }
                None => break,
            },
        }
    }
    debug!(transport = %transport, "Ingress worker stopped");
}

async fn prune_loop(engine: Arc<RelayEngine>, period: Duration, token: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                engine.prune_gateways();
            }
        }
    }
}

async fn keep_alive_loop(engine: Arc<RelayEngine>, period: Duration, token: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let pulse = Packet::new(
                    engine.node_id(),
                    engine.node_name(),
                    BROADCAST,
                    PacketType::KeepAlive,
                    KEEP_ALIVE_PAYLOAD,
                )
                .with_hop_count(1)
                .with_timestamp(engine.now_ms());
                if let Err(e) = engine.send_packet(pulse) {
                    debug!(error = %e, "Keep-alive failed");
                }
            }
        }
    }
}

async fn topology_loop(engine: Arc<RelayEngine>, period: Duration, token: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => match engine.send_topology_update() {
                Ok(Some(_)) => trace!(routes = engine.routing().len(), "Topology update sent"),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Topology update failed"),
            },
        }
    }
}

/// Keep the cloud transport up exactly while it is wanted.
async fn connectivity_watcher(
    engine: Arc<RelayEngine>,
    cloud: String,
    mut wanted: watch::Receiver<bool>,
    token: CancellationToken,
) {
    let transports = engine.transports().clone();
    loop {
        let want = *wanted.borrow_and_update();
        let active = transports.is_running(&cloud);

        if want && !active {
            if !start_with_backoff(&engine, &cloud, &mut wanted, &token).await {
                if token.is_cancelled() {
                    break;
                }
                continue;
            }
        } else if !want && active {
            transports.stop_transport(&cloud);
            info!(transport = %cloud, "Cloud transport stopped");
        }

        tokio::select! {
            _ = token.cancelled() => break,
            changed = wanted.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// Returns `true` once started, `false` if no longer wanted or cancelled.
async fn start_with_backoff(
    engine: &RelayEngine,
    cloud: &str,
    wanted: &mut watch::Receiver<bool>,
    token: &CancellationToken,
) -> bool {
    let transports = engine.transports();
    let mut delay = CLOUD_BACKOFF_INITIAL;
    loop {
        match transports.start_transport(cloud, &engine.node_name(), false) {
            Ok(()) => {
                info!(transport = %cloud, "Cloud transport started");
                return true;
            }
            Err(e) => {
                warn!(transport = %cloud, error = %e, retry_in = ?delay, "Cloud transport failed to start");
            }
        }

        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
            changed = wanted.changed() => {
                if changed.is_err() || !*wanted.borrow_and_update() {
                    return false;
                }
            }
        }
        delay = (delay * 2).min(CLOUD_BACKOFF_MAX);
    }
}
