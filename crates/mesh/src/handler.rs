//! Application-facing sinks fed by the relay engine.
//!
//! The engine never stores chat content or profiles; it hands each locally
//! addressed packet to whatever the application plugged in here.

use crate::packet::Packet;
use serde::{Deserialize, Serialize};

/// Receives content packets addressed to this node or broadcast.
pub trait PacketHandler: Send + Sync {
    fn on_packet(&self, packet: &Packet);
}

/// Receives profile and presence updates.
pub trait ProfileSink: Send + Sync {
    fn on_profile(&self, update: ProfileUpdate);

    fn on_location(&self, update: LocationUpdate) {
        let _ = update;
    }
}

/// Parsed PROFILE_SYNC payload (`name|status|color`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub node_id: String,
    pub name: String,
    pub status: String,
    pub color: Option<String>,
    pub battery: u8,
}

impl ProfileUpdate {
    /// Missing trailing fields are tolerated; an empty name is not.
    pub fn parse(packet: &Packet) -> Option<Self> {
        let mut parts = packet.payload.splitn(3, '|');
        let name = parts.next().filter(|name| !name.is_empty())?;
        let status = parts.next().unwrap_or_default();
        let color = parts.next().filter(|c| !c.is_empty()).map(str::to_string);

        Some(Self {
            node_id: packet.sender_id.clone(),
            name: name.to_string(),
            status: status.to_string(),
            color,
            battery: packet.sender_battery,
        })
    }

    pub fn to_payload(&self) -> String {
        format!(
            "{}|{}|{}",
            self.name,
            self.status,
            self.color.as_deref().unwrap_or_default()
        )
    }
}

/// Parsed LOCATION_UPDATE payload (`lat|lon`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub node_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationUpdate {
    pub fn parse(packet: &Packet) -> Option<Self> {
        let (lat, lon) = packet.payload.split_once('|')?;
        let latitude: f64 = lat.trim().parse().ok()?;
        let longitude: f64 = lon.trim().parse().ok()?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }
        Some(Self {
            node_id: packet.sender_id.clone(),
            latitude,
            longitude,
        })
    }
}
