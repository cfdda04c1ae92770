//! Transport contract and the aggregator that multiplexes adapters.
//!
//! Platform drivers (Bluetooth, Wi-Fi Direct, LAN discovery, the cloud relay
//! socket) live outside this crate and implement [`Transport`]. Sends are
//! fire-and-forget: an adapter queues internally and returns immediately.
//!
//! Endpoint ids handed to an adapter are always its own raw ids. Above the
//! [`TransportAggregator`] every endpoint is qualified as
//! `{transportName}:{rawId}`.

mod aggregator;
mod channel;

pub use aggregator::TransportAggregator;
pub use channel::{ChannelHub, ChannelTransport};

use crate::error::MeshResult;
use crate::packet::Packet;
use std::collections::HashMap;
use std::sync::Arc;

/// Events an adapter reports upward.
pub trait TransportCallback: Send + Sync {
    /// Raw bytes arrived from `endpoint_id`.
    fn on_bytes_received(&self, endpoint_id: &str, raw: &[u8]);

    /// Full current set of reachable endpoints, id -> display name.
    fn on_connection_set_changed(&self, connections: HashMap<String, String>);

    fn on_error(&self, message: &str);
}

/// A single link technology.
pub trait Transport: Send + Sync {
    /// Stable name, used as the endpoint prefix.
    fn name(&self) -> &str;

    fn start(&self, display_name: &str, stealth: bool) -> MeshResult<()>;

    fn stop(&self);

    /// Send to one raw endpoint, or to every connected endpoint when `None`.
    fn send(&self, packet: &Packet, target: Option<&str>) -> MeshResult<()>;

    /// Send to every connected endpoint except `skip_endpoint`.
    ///
    /// Adapters that cannot address peers individually fall back to a
    /// plain broadcast.
    fn broadcast_except(&self, packet: &Packet, skip_endpoint: &str) -> MeshResult<()> {
        let _ = skip_endpoint;
        self.send(packet, None)
    }

    fn set_callback(&self, callback: Arc<dyn TransportCallback>);

    fn is_running(&self) -> bool;
}

/// Split a qualified endpoint into transport name and raw id.
pub fn split_endpoint(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once(':')
}

/// `{transport}:{raw}`.
pub fn qualify_endpoint(transport: &str, raw: &str) -> String {
    format!("{}:{}", transport, raw)
}
