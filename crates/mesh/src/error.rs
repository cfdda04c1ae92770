//! Error types for GhostMesh relay operations.
//!
//! Every ingest failure is a drop reason: the ingress worker logs it and
//! moves on. Only [`MeshError::Crypto`] is meant to reach an application
//! caller, since it guards against sending cleartext.

use ghostmesh_crypto::SecurityError;
use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Raw input exceeded the wire bound; rejected before parsing
    #[error("Packet too large: {size} bytes (limit {limit})")]
    OversizedPacket { size: usize, limit: usize },

    /// Input did not decode as a packet
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Packet decoded but failed the validity predicate
    #[error("Invalid packet {id}: {reason}")]
    InvalidPacket { id: String, reason: String },

    /// Packet was produced by a newer protocol revision
    #[error("Unsupported protocol version {version} (local {local})")]
    UnsupportedProtocol { version: u32, local: u32 },

    /// Signature missing or did not verify against the sender id
    #[error("Signature verification failed for packet {id} from {sender_id}")]
    InvalidSignature { id: String, sender_id: String },

    /// Packet id already seen
    #[error("Duplicate packet: {id}")]
    DuplicatePacket { id: String },

    /// Security and cryptographic errors
    #[error("Security error: {0}")]
    Crypto(#[from] SecurityError),

    /// Transport adapter failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// No route and no usable gateway for a destination
    #[error("No route found to destination: {destination}")]
    RouteUnavailable { destination: String },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
