//! Wire packet and its validity rules.
//!
//! One JSON object per packet, camelCase field names, SCREAMING_SNAKE_CASE
//! packet types. The payload is opaque to the relay: plaintext for control
//! traffic, base64 ciphertext for user content, a nested serialized packet
//! for tunnels.

use crate::error::{MeshError, MeshResult};
use ghostmesh_core::config::MAX_HOP_BUDGET;
use ghostmesh_core::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Receiver id addressing every node.
pub const BROADCAST: &str = "ALL";

/// Protocol revision stamped on every packet this node originates.
pub const PROTOCOL_VERSION: u32 = 2;

/// Largest accepted payload.
pub const MAX_PAYLOAD_BYTES: usize = 102_400;

/// Allowance for the non-payload fields of the JSON envelope.
pub const HEADER_OVERHEAD_BYTES: usize = 512;

/// Raw inputs longer than this are dropped without parsing.
pub const MAX_WIRE_BYTES: usize = MAX_PAYLOAD_BYTES + HEADER_OVERHEAD_BYTES;

/// How far ahead of local time a packet may be stamped.
pub const MAX_FUTURE_SKEW_MS: u64 = 300_000;

/// How far behind local time a packet may be stamped.
pub const MAX_PACKET_AGE_MS: u64 = 3_600_000;

/// Hop budget given to locally originated packets unless overridden.
pub const DEFAULT_HOP_COUNT: i32 = 3;

/// Packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
    Chat,
    Image,
    Voice,
    File,
    Ack,
    KeyExchange,
    ProfileSync,
    TypingStart,
    TypingStop,
    Reaction,
    LastSeen,
    ProfileImage,
    GatewayAvailable,
    Tunnel,
    LinkState,
    BatteryHeartbeat,
    LocationUpdate,
    KeepAlive,
    NeighborList,
    TopologyUpdate,
}

impl PacketType {
    /// Content types whose unicast delivery is acknowledged.
    pub fn requires_ack(self) -> bool {
        matches!(self, Self::Chat | Self::Image | Self::Voice | Self::File)
    }

    /// Types handed to the application packet handler.
    pub fn is_application(self) -> bool {
        matches!(
            self,
            Self::Chat
                | Self::Image
                | Self::Voice
                | Self::File
                | Self::Ack
                | Self::TypingStart
                | Self::TypingStop
                | Self::Reaction
                | Self::KeyExchange
                | Self::LastSeen
                | Self::ProfileImage
        )
    }
}

fn default_battery() -> u8 {
    100
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// A mesh packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Globally unique packet id
    pub id: String,
    /// Originating node id (hex x-only public key when signed)
    pub sender_id: String,
    /// Display name of the originator
    #[serde(default)]
    pub sender_name: String,
    /// Destination node id or [`BROADCAST`]
    pub receiver_id: String,
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    pub payload: String,
    /// Remaining relay budget
    pub hop_count: i32,
    #[serde(default)]
    pub is_self_destruct: bool,
    #[serde(default)]
    pub expiry_seconds: u32,
    /// Origination time, unix milliseconds
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_sender: Option<String>,
    /// Battery of the last hop, 0-100
    #[serde(default = "default_battery")]
    pub sender_battery: u8,
    /// Accumulated link cost up to the last hop
    #[serde(default)]
    pub path_cost: f32,
    #[serde(default)]
    pub lamport_time: u64,
    #[serde(default)]
    pub reputation: u32,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    /// Hex BIP-340 signature over SHA-256(id || payload)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Packet {
    /// New packet with a fresh id, stamped now, default hop budget.
    pub fn new(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        receiver_id: impl Into<String>,
        packet_type: PacketType,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            receiver_id: receiver_id.into(),
            packet_type,
            payload: payload.into(),
            hop_count: DEFAULT_HOP_COUNT,
            is_self_destruct: false,
            expiry_seconds: 0,
            timestamp: current_timestamp_ms(),
            reply_to_id: None,
            reply_to_content: None,
            reply_to_sender: None,
            sender_battery: default_battery(),
            path_cost: 0.0,
            lamport_time: 0,
            reputation: 0,
            protocol_version: PROTOCOL_VERSION,
            signature: None,
        }
    }

    pub fn with_hop_count(mut self, hop_count: i32) -> Self {
        self.hop_count = hop_count;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST
    }

    /// Check the validity predicate against `now_ms`.
    ///
    /// Both freshness bounds are inclusive.
    pub fn validate_at(&self, now_ms: u64) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("blank packet id".to_string());
        }
        if self.sender_id.trim().is_empty() {
            return Err("blank sender id".to_string());
        }
        if self.timestamp > now_ms.saturating_add(MAX_FUTURE_SKEW_MS) {
            return Err(format!(
                "timestamp {} is more than {} ms ahead of {}",
                self.timestamp, MAX_FUTURE_SKEW_MS, now_ms
            ));
        }
        if self.timestamp < now_ms.saturating_sub(MAX_PACKET_AGE_MS) {
            return Err(format!(
                "timestamp {} is more than {} ms behind {}",
                self.timestamp, MAX_PACKET_AGE_MS, now_ms
            ));
        }
        if !(0..=i32::from(MAX_HOP_BUDGET)).contains(&self.hop_count) {
            return Err(format!("hop count {} outside 0..={}", self.hop_count, MAX_HOP_BUDGET));
        }
        if self.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(format!(
                "payload {} bytes exceeds {}",
                self.payload.len(),
                MAX_PAYLOAD_BYTES
            ));
        }
        Ok(())
    }

    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        self.validate_at(now_ms).is_ok()
    }

    pub fn to_json(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire packet, enforcing the raw size bound first.
    pub fn from_bytes(raw: &[u8]) -> MeshResult<Self> {
        if raw.len() > MAX_WIRE_BYTES {
            return Err(MeshError::OversizedPacket {
                size: raw.len(),
                limit: MAX_WIRE_BYTES,
            });
        }
        serde_json::from_slice(raw).map_err(|e| MeshError::MalformedPacket(e.to_string()))
    }

    /// Decode a packet nested in a tunnel payload.
    pub fn from_json(json: &str) -> MeshResult<Self> {
        Self::from_bytes(json.as_bytes())
    }
}
