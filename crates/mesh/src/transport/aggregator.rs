use super::{qualify_endpoint, split_endpoint, Transport, TransportCallback};
use crate::error::{MeshError, MeshResult};
use crate::packet::Packet;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

type ConnectionMap = Arc<RwLock<HashMap<String, String>>>;
type UpstreamSlot = Arc<RwLock<Option<Arc<dyn TransportCallback>>>>;

/// Fan-in/fan-out across every registered transport.
///
/// A failing adapter never affects the others: its error is logged,
/// reported through `on_error`, and the remaining adapters still get the
/// packet.
pub struct TransportAggregator {
    transports: Vec<Arc<dyn Transport>>,
    /// Adapters started on demand rather than by [`Self::start`]
    on_demand: HashSet<String>,
    /// Merged qualified endpoint -> display name view
    connections: ConnectionMap,
    upstream: UpstreamSlot,
}

impl Default for TransportAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportAggregator {
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
            on_demand: HashSet::new(),
            connections: Arc::new(RwLock::new(HashMap::new())),
            upstream: Arc::new(RwLock::new(None)),
        }
    }

    /// Register an adapter started together with the mesh.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.install(transport);
        self
    }

    /// Register an adapter that is only started explicitly, such as the
    /// cloud relay.
    pub fn with_on_demand_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.on_demand.insert(transport.name().to_string());
        self.install(transport);
        self
    }

    fn install(&mut self, transport: Arc<dyn Transport>) {
        transport.set_callback(Arc::new(PrefixingCallback {
            transport: transport.name().to_string(),
            connections: self.connections.clone(),
            upstream: self.upstream.clone(),
        }));
        self.transports.push(transport);
    }

    /// Route every adapter's events to `callback`.
    pub fn set_callback(&self, callback: Arc<dyn TransportCallback>) {
        *self.upstream.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.upstream.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn names(&self) -> Vec<String> {
        self.transports.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.name() == name)
    }

    /// Start every adapter that is not on demand. Returns how many started.
    pub fn start(&self, display_name: &str, stealth: bool) -> usize {
        self.transports
            .iter()
            .filter(|t| !self.on_demand.contains(t.name()))
            .filter(|t| match t.start(display_name, stealth) {
                Ok(()) => true,
                Err(e) => {
                    self.report(t.name(), &e.to_string());
                    false
                }
            })
            .count()
    }

    /// Stop and start again every running adapter that is not on demand,
    /// so a changed display name or stealth flag reaches the advertisement.
    /// Returns how many came back up.
    pub fn restart_running(&self, display_name: &str, stealth: bool) -> usize {
        self.transports
            .iter()
            .filter(|t| !self.on_demand.contains(t.name()) && t.is_running())
            .filter(|t| {
                t.stop();
                self.forget_connections(t.name());
                match t.start(display_name, stealth) {
                    Ok(()) => true,
                    Err(e) => {
                        self.report(t.name(), &e.to_string());
                        false
                    }
                }
            })
            .count()
    }

    pub fn start_transport(&self, name: &str, display_name: &str, stealth: bool) -> MeshResult<()> {
        let transport = self
            .find(name)
            .ok_or_else(|| MeshError::Transport(format!("unknown transport '{}'", name)))?;
        if transport.is_running() {
            return Ok(());
        }
        transport.start(display_name, stealth)
    }

    pub fn stop_transport(&self, name: &str) {
        if let Some(transport) = self.find(name) {
            transport.stop();
            self.forget_connections(name);
        }
    }

    pub fn stop_all(&self) {
        for transport in &self.transports {
            transport.stop();
        }
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.find(name).map(|t| t.is_running()).unwrap_or(false)
    }

    /// Send to one endpoint, or to every adapter when `target` is `None`.
    ///
    /// A qualified target goes to exactly one adapter. An unqualified target
    /// is offered to every adapter. Returns how many adapters accepted.
    pub fn send(&self, packet: &Packet, target: Option<&str>) -> MeshResult<usize> {
        let Some(target) = target else {
            return Ok(self.fan_out(|t| t.send(packet, None)));
        };

        match split_endpoint(target) {
            Some((name, raw)) => {
                let transport = self.find(name).ok_or_else(|| {
                    MeshError::Transport(format!("unknown transport '{}' in endpoint {}", name, target))
                })?;
                transport.send(packet, Some(raw)).map_err(|e| {
                    self.report(name, &e.to_string());
                    e
                })?;
                Ok(1)
            }
            None => Ok(self.fan_out(|t| t.send(packet, Some(target)))),
        }
    }

    /// Send to every adapter; the adapter owning `origin` skips that endpoint.
    pub fn broadcast_except(&self, packet: &Packet, origin: Option<&str>) -> usize {
        let skip = origin.and_then(split_endpoint);
        self.fan_out(|t| match skip {
            Some((name, raw)) if name == t.name() => t.broadcast_except(packet, raw),
            _ => t.send(packet, None),
        })
    }

    fn fan_out(&self, mut op: impl FnMut(&Arc<dyn Transport>) -> MeshResult<()>) -> usize {
        self.transports
            .iter()
            .filter(|t| match op(t) {
                Ok(()) => true,
                Err(e) => {
                    self.report(t.name(), &e.to_string());
                    false
                }
            })
            .count()
    }

    fn report(&self, name: &str, message: &str) {
        warn!(transport = %name, error = %message, "Transport failure");
        let upstream = self
            .upstream
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(upstream) = upstream {
            upstream.on_error(&format!("[{}] {}", name, message));
        }
    }

    fn forget_connections(&self, name: &str) {
        let snapshot = {
            let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
            let prefix = qualify_endpoint(name, "");
            connections.retain(|id, _| !id.starts_with(&prefix));
            connections.clone()
        };
        let upstream = self
            .upstream
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(upstream) = upstream {
            upstream.on_connection_set_changed(snapshot);
        }
    }

    /// Merged view of every adapter's reachable endpoints.
    pub fn connections(&self) -> HashMap<String, String> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Wraps an adapter's callback to qualify its endpoint ids.
struct PrefixingCallback {
    transport: String,
    connections: ConnectionMap,
    upstream: UpstreamSlot,
}

impl PrefixingCallback {
    fn upstream(&self) -> Option<Arc<dyn TransportCallback>> {
        self.upstream
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TransportCallback for PrefixingCallback {
    fn on_bytes_received(&self, endpoint_id: &str, raw: &[u8]) {
        if let Some(upstream) = self.upstream() {
            upstream.on_bytes_received(&qualify_endpoint(&self.transport, endpoint_id), raw);
        }
    }

    fn on_connection_set_changed(&self, connections: HashMap<String, String>) {
        let snapshot = {
            let mut merged = self.connections.write().unwrap_or_else(PoisonError::into_inner);
            let prefix = qualify_endpoint(&self.transport, "");
            merged.retain(|id, _| !id.starts_with(&prefix));
            merged.extend(
                connections
                    .into_iter()
                    .map(|(id, name)| (qualify_endpoint(&self.transport, &id), name)),
            );
            merged.clone()
        };
        debug!(transport = %self.transport, total = snapshot.len(), "Connection set changed");

        if let Some(upstream) = self.upstream() {
            upstream.on_connection_set_changed(snapshot);
        }
    }

    fn on_error(&self, message: &str) {
        warn!(transport = %self.transport, error = %message, "Transport reported error");
        if let Some(upstream) = self.upstream() {
            upstream.on_error(&format!("[{}] {}", self.transport, message));
        }
    }
}
