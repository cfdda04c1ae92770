//! Cryptographic layer for the GhostMesh relay.
//!
//! Provides everything the mesh needs to keep payloads private between two
//! peers and to prove who originated a packet:
//!
//! - **Key Store**: capability interface over the device key material, with
//!   a software implementation that doubles as the test store
//! - **Session Keys**: X25519 agreement hashed with BLAKE3 into a per-peer
//!   ChaCha20-Poly1305 key
//! - **Fallback Key**: a shared, daily-rotating key for broadcast traffic
//! - **Packet Signatures**: BIP-340 Schnorr over SHA-256(id || payload)
//!
//! # Supported Algorithms
//!
//! - **Signatures**: BIP-340 Schnorr over secp256k1
//! - **Hashing**: BLAKE3 for key derivation, SHA-256 for signed digests
//! - **Encryption**: ChaCha20-Poly1305
//! - **Key Exchange**: X25519 (Diffie-Hellman)
//!
//! # Security Principles
//!
//! - Secret key material never leaves the [`KeyStore`]
//! - Failures are explicit; nothing silently degrades to plaintext
//! - Session keys are zeroized on drop and never persisted

pub mod error;
pub mod fallback;
pub mod keystore;
pub mod security;
pub mod session;
pub mod signing;

pub use error::{SecurityError, SecurityResult};
pub use fallback::{fallback_key_for_day, FALLBACK_KEY_CONTEXT};
pub use keystore::{KeyStore, SoftwareKeyStore};
pub use security::SecurityManager;
pub use session::{open, seal, SessionKey, SessionTable, ENVELOPE_OVERHEAD, NONCE_SIZE, TAG_SIZE};
pub use signing::{packet_digest, verify_packet_signature};
