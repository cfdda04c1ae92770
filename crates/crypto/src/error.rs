//! Error types for GhostMesh cryptographic operations.

use thiserror::Error;

/// Errors surfaced by the security layer.
///
/// Callers must treat every variant as "do not send": there is no fallback to
/// cleartext anywhere in this crate.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Peer public key was unusable for agreement
    #[error("Key agreement failed: {0}")]
    KeyAgreement(String),

    /// No session has been established with the peer
    #[error("No session key for peer {peer_id}")]
    MissingKey { peer_id: String },

    /// AEAD encryption failed
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Authentication tag mismatch or undecodable plaintext
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Envelope shorter than nonce and tag
    #[error("Ciphertext truncated: {len} bytes (minimum {min})")]
    Truncated { len: usize, min: usize },

    /// Base64 or hex decoding failed
    #[error("Invalid encoding: {0}")]
    Encoding(String),

    /// Key store refused or failed an operation
    #[error("Key store error: {0}")]
    KeyStore(String),
}

/// Result type for security operations.
pub type SecurityResult<T> = Result<T, SecurityError>;
