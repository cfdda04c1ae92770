#![allow(dead_code)]

use ghostmesh_core::{Clock, Config, ManualClock, MeshConfig};
use ghostmesh_mesh::{
    LocationUpdate, MeshError, MeshResult, Packet, PacketHandler, PacketType, ProfileSink,
    ProfileUpdate, RelayEngine, Transport, TransportAggregator, TransportCallback, BROADCAST,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub const NOW: u64 = 1_700_000_000_000;

/// What a recording transport was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    To(String, Packet),
    All(Packet),
    AllExcept(String, Packet),
}

impl Sent {
    pub fn packet(&self) -> &Packet {
        match self {
            Sent::To(_, p) | Sent::All(p) | Sent::AllExcept(_, p) => p,
        }
    }
}

/// Transport that records sends instead of delivering them.
pub struct RecordingTransport {
    name: String,
    pub sent: Mutex<Vec<Sent>>,
    callback: RwLock<Option<Arc<dyn TransportCallback>>>,
    running: Mutex<bool>,
    /// Number of upcoming `start` calls that fail
    pub failing_starts: AtomicUsize,
    pub start_attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
            callback: RwLock::new(None),
            running: Mutex::new(false),
            failing_starts: AtomicUsize::new(0),
            start_attempts: AtomicUsize::new(0),
        })
    }

    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn inject(&self, endpoint: &str, raw: &[u8]) {
        let callback = self.callback.read().unwrap().clone();
        callback.expect("callback installed").on_bytes_received(endpoint, raw);
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, _display_name: &str, _stealth: bool) -> MeshResult<()> {
        self.start_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(MeshError::Transport("socket refused".to_string()));
        }
        *self.running.lock().unwrap() = true;
        Ok(())
    }

    fn stop(&self) {
        *self.running.lock().unwrap() = false;
    }

    fn send(&self, packet: &Packet, target: Option<&str>) -> MeshResult<()> {
        let record = match target {
            Some(target) => Sent::To(target.to_string(), packet.clone()),
            None => Sent::All(packet.clone()),
        };
        self.sent.lock().unwrap().push(record);
        Ok(())
    }

    fn broadcast_except(&self, packet: &Packet, skip_endpoint: &str) -> MeshResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::AllExcept(skip_endpoint.to_string(), packet.clone()));
        Ok(())
    }

    fn set_callback(&self, callback: Arc<dyn TransportCallback>) {
        *self.callback.write().unwrap() = Some(callback);
    }

    fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }
}

#[derive(Default)]
pub struct Collector {
    pub packets: Mutex<Vec<Packet>>,
    pub profiles: Mutex<Vec<ProfileUpdate>>,
    pub locations: Mutex<Vec<LocationUpdate>>,
}

impl Collector {
    pub fn packet_count(&self) -> usize {
        self.packets.lock().unwrap().len()
    }
}

impl PacketHandler for Collector {
    fn on_packet(&self, packet: &Packet) {
        self.packets.lock().unwrap().push(packet.clone());
    }
}

impl ProfileSink for Collector {
    fn on_profile(&self, update: ProfileUpdate) {
        self.profiles.lock().unwrap().push(update);
    }

    fn on_location(&self, update: LocationUpdate) {
        self.locations.lock().unwrap().push(update);
    }
}

/// Engine "me" with one LAN and one Bluetooth recording transport.
pub struct Harness {
    pub engine: RelayEngine,
    pub clock: Arc<ManualClock>,
    pub lan: Arc<RecordingTransport>,
    pub bluetooth: Arc<RecordingTransport>,
    pub collector: Arc<Collector>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(MeshConfig::default())
    }

    pub fn with_config(config: MeshConfig) -> Self {
        let clock = Arc::new(ManualClock::new(NOW));
        let lan = RecordingTransport::new("LAN");
        let bluetooth = RecordingTransport::new("Bluetooth");
        let transports = Arc::new(
            TransportAggregator::new()
                .with_transport(lan.clone())
                .with_transport(bluetooth.clone()),
        );
        let collector = Arc::new(Collector::default());
        let engine = RelayEngine::new("me", config, transports, clock.clone())
            .with_packet_handler(collector.clone())
            .with_profile_sink(collector.clone());

        Self {
            engine,
            clock,
            lan,
            bluetooth,
            collector,
        }
    }

    pub fn ingest(&self, origin: &str, packet: &Packet) -> MeshResult<ghostmesh_mesh::IngestReport> {
        self.engine.process_incoming(origin, &packet.to_bytes().unwrap())
    }

    pub fn clock_now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn sent(&self) -> Vec<Sent> {
        let mut sent = self.lan.take();
        sent.extend(self.bluetooth.take());
        sent
    }
}

pub fn packet_from(sender: &str, receiver: &str, packet_type: PacketType, payload: &str) -> Packet {
    Packet::new(sender, sender, receiver, packet_type, payload).with_timestamp(NOW)
}

pub fn chat(sender: &str) -> Packet {
    packet_from(sender, BROADCAST, PacketType::Chat, "hello")
}

pub fn quiet_config() -> Config {
    let mut config = Config::default_config();
    config.mesh.keep_alive_interval_secs = 0;
    config.mesh.topology_interval_secs = 0;
    config
}
