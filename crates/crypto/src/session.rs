//! Per-peer session keys and ChaCha20-Poly1305 envelopes.
//!
//! A session key is BLAKE3(X25519 shared secret). Keys live only in memory,
//! indexed by peer id, and are replaced wholesale when the handshake is run
//! again (each replacement bumps the peer's epoch).
//!
//! # Envelope Format
//!
//! ```text
//! +-----------+----------+------------------+
//! | nonce(12) | tag(16)  | ciphertext(n)    |
//! +-----------+----------+------------------+
//! ```
//!
//! The nonce is drawn fresh from the OS RNG for every call. No associated
//! data is bound; packet authenticity is the job of the signature layer.

use crate::error::{SecurityError, SecurityResult};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for ChaCha20-Poly1305 (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Bytes an envelope adds on top of the plaintext.
pub const ENVELOPE_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// 256-bit symmetric key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Derive a session key from a raw agreement output.
    pub fn derive(shared_secret: &[u8; 32]) -> Self {
        Self(*blake3::hash(shared_secret).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short non-secret identifier, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(&self.0).as_bytes()[..4])
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

/// Encrypt `plaintext` into a `nonce || tag || ciphertext` envelope.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut buffer)
        .map_err(|e| SecurityError::Encryption(e.to_string()))?;

    let mut envelope = Vec::with_capacity(ENVELOPE_OVERHEAD + buffer.len());
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(tag.as_slice());
    envelope.extend_from_slice(&buffer);
    Ok(envelope)
}

/// Authenticate and decrypt an envelope produced by [`seal`].
pub fn open(key: &SessionKey, envelope: &[u8]) -> SecurityResult<Vec<u8>> {
    if envelope.len() < ENVELOPE_OVERHEAD {
        return Err(SecurityError::Truncated {
            len: envelope.len(),
            min: ENVELOPE_OVERHEAD,
        });
    }

    let (nonce, rest) = envelope.split_at(NONCE_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut buffer, Tag::from_slice(tag))
        .map_err(|_| SecurityError::Decryption("authentication tag mismatch".to_string()))?;

    Ok(buffer)
}

struct SessionEntry {
    key: SessionKey,
    epoch: u64,
    established_at_ms: u64,
}

/// Concurrent peer id -> session key map.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the key for `peer_id`. Returns the new epoch,
    /// 0 for a first handshake.
    pub fn install(&self, peer_id: &str, key: SessionKey, now_ms: u64) -> u64 {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let epoch = sessions
            .get(peer_id)
            .map(|existing| existing.epoch + 1)
            .unwrap_or(0);
        sessions.insert(
            peer_id.to_string(),
            SessionEntry {
                key,
                epoch,
                established_at_ms: now_ms,
            },
        );
        epoch
    }

    /// Run `f` against the peer's key without letting it escape the lock.
    pub fn with_key<R>(&self, peer_id: &str, f: impl FnOnce(&SessionKey) -> R) -> Option<R> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(peer_id).map(|entry| f(&entry.key))
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer_id)
    }

    /// Rotation counter for the peer's current key.
    pub fn epoch(&self, peer_id: &str) -> Option<u64> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .map(|entry| entry.epoch)
    }

    pub fn established_at_ms(&self, peer_id: &str) -> Option<u64> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer_id)
            .map(|entry| entry.established_at_ms)
    }

    /// Drop the peer's key. Returns whether one existed.
    pub fn remove(&self, peer_id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
