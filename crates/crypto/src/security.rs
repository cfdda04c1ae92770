//! Security manager: the one object the mesh layer talks to for crypto.
//!
//! Owns the node's [`KeyStore`], the per-peer [`SessionTable`], and the
//! fallback salt. It is constructed explicitly and injected; there is no
//! process-wide instance.

use crate::error::{SecurityError, SecurityResult};
use crate::fallback::fallback_key_for_day;
use crate::keystore::{KeyStore, SoftwareKeyStore};
use crate::session::{self, SessionKey, SessionTable};
use crate::signing::{packet_digest, verify_packet_signature};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ghostmesh_core::{Clock, SecurityConfig, SystemClock};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use x25519_dalek::PublicKey as X25519PublicKey;

/// Per-peer encryption, broadcast obfuscation, and packet signatures.
pub struct SecurityManager {
    keystore: Arc<dyn KeyStore>,
    sessions: SessionTable,
    fallback_salt: String,
    clock: Arc<dyn Clock>,
    node_id: String,
}

impl SecurityManager {
    pub fn new(keystore: Arc<dyn KeyStore>, config: &SecurityConfig, clock: Arc<dyn Clock>) -> Self {
        let node_id = keystore.network_public_key().to_string();
        Self {
            keystore,
            sessions: SessionTable::new(),
            fallback_salt: config.fallback_salt.clone(),
            clock,
            node_id,
        }
    }

    /// Manager over freshly generated in-memory keys and the system clock.
    pub fn with_software_keys(config: &SecurityConfig) -> Self {
        Self::new(
            Arc::new(SoftwareKeyStore::generate()),
            config,
            Arc::new(SystemClock),
        )
    }

    /// Hex x-only network public key. This is the node's `senderId`.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn agreement_public_key(&self) -> [u8; 32] {
        self.keystore.agreement_public_key().to_bytes()
    }

    /// Agreement key as carried in a KEY_EXCHANGE payload.
    pub fn agreement_public_key_base64(&self) -> String {
        BASE64.encode(self.agreement_public_key())
    }

    /// Derive and install a session key for `peer_id`.
    ///
    /// Running this again for the same peer replaces the key.
    pub fn establish_session(&self, peer_id: &str, peer_public_key: &[u8]) -> SecurityResult<()> {
        let bytes: [u8; 32] = peer_public_key.try_into().map_err(|_| {
            SecurityError::KeyAgreement(format!(
                "expected 32-byte public key, got {} bytes",
                peer_public_key.len()
            ))
        })?;

        let shared = self.keystore.diffie_hellman(&X25519PublicKey::from(bytes))?;
        if shared.iter().all(|b| *b == 0) {
            return Err(SecurityError::KeyAgreement(
                "non-contributory public key".to_string(),
            ));
        }

        let key = SessionKey::derive(&shared);
        let fingerprint = key.fingerprint();
        let epoch = self.sessions.install(peer_id, key, self.clock.now_ms());

        debug!(peer_id = %peer_id, epoch, key = %fingerprint, "Session established");
        Ok(())
    }

    /// [`Self::establish_session`] for a base64 public key off the wire.
    pub fn establish_session_base64(&self, peer_id: &str, peer_public_key: &str) -> SecurityResult<()> {
        let bytes = BASE64
            .decode(peer_public_key.trim())
            .map_err(|e| SecurityError::Encoding(e.to_string()))?;
        self.establish_session(peer_id, &bytes)
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains(peer_id)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Encrypt for `peer_id`, or with today's fallback key when `None`.
    ///
    /// Returns base64(nonce || tag || ciphertext).
    pub fn encrypt(&self, plaintext: &str, peer_id: Option<&str>) -> SecurityResult<String> {
        let envelope = match peer_id {
            Some(peer_id) => self
                .sessions
                .with_key(peer_id, |key| session::seal(key, plaintext.as_bytes()))
                .ok_or_else(|| SecurityError::MissingKey {
                    peer_id: peer_id.to_string(),
                })??,
            None => session::seal(&self.fallback_key(), plaintext.as_bytes())?,
        };
        Ok(BASE64.encode(envelope))
    }

    /// Inverse of [`Self::encrypt`].
    ///
    /// Without a peer, today's fallback key is tried first and then
    /// yesterday's, so traffic sealed just before midnight still opens.
    pub fn decrypt(&self, ciphertext: &str, peer_id: Option<&str>) -> SecurityResult<String> {
        let envelope = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| SecurityError::Encoding(e.to_string()))?;

        let plaintext = match peer_id {
            Some(peer_id) => self
                .sessions
                .with_key(peer_id, |key| session::open(key, &envelope))
                .ok_or_else(|| SecurityError::MissingKey {
                    peer_id: peer_id.to_string(),
                })??,
            None => {
                let today = self.clock.epoch_day();
                match session::open(&fallback_key_for_day(&self.fallback_salt, today), &envelope) {
                    Ok(plaintext) => plaintext,
                    Err(SecurityError::Decryption(_)) if today > 0 => session::open(
                        &fallback_key_for_day(&self.fallback_salt, today - 1),
                        &envelope,
                    )?,
                    Err(e) => return Err(e),
                }
            }
        };

        String::from_utf8(plaintext)
            .map_err(|e| SecurityError::Decryption(format!("plaintext is not UTF-8: {}", e)))
    }

    /// Today's broadcast key. Recomputed on every call.
    pub fn fallback_key(&self) -> SessionKey {
        fallback_key_for_day(&self.fallback_salt, self.clock.epoch_day())
    }

    /// Hex BIP-340 signature over SHA-256(id || payload).
    pub fn sign_packet(&self, id: &str, payload: &str) -> SecurityResult<String> {
        let signature = self.keystore.sign(&packet_digest(id, payload))?;
        Ok(signature.to_string())
    }

    /// Check `signature` against `sender_id` read as a hex x-only public key.
    pub fn verify_packet(&self, sender_id: &str, id: &str, payload: &str, signature: &str) -> bool {
        let valid = verify_packet_signature(sender_id, id, payload, signature);
        if !valid {
            warn!(sender_id = %sender_id, packet_id = %id, "Signature verification failed");
        }
        valid
    }
}

impl fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityManager")
            .field("node_id", &self.node_id)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostmesh_core::time::MS_PER_DAY;
    use ghostmesh_core::ManualClock;

    fn manager(seed: u8, clock: Arc<ManualClock>) -> SecurityManager {
        SecurityManager::new(
            Arc::new(SoftwareKeyStore::from_seeds([seed; 32], [seed.wrapping_add(100); 32]).unwrap()),
            &SecurityConfig::default(),
            clock,
        )
    }

    fn paired() -> (SecurityManager, SecurityManager) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let alice = manager(1, clock.clone());
        let bob = manager(2, clock);

        alice
            .establish_session(bob.node_id(), &bob.agreement_public_key())
            .unwrap();
        bob.establish_session(alice.node_id(), &alice.agreement_public_key())
            .unwrap();
        (alice, bob)
    }

    #[test]
    fn test_peer_roundtrip() {
        let (alice, bob) = paired();

        let ciphertext = alice.encrypt("meet at the bridge", Some(bob.node_id())).unwrap();
        assert_ne!(ciphertext, "meet at the bridge");
        assert_eq!(
            bob.decrypt(&ciphertext, Some(alice.node_id())).unwrap(),
            "meet at the bridge"
        );
    }

    #[test]
    fn test_wrong_peer_fails() {
        let (alice, bob) = paired();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let carol = manager(3, clock);
        carol
            .establish_session(alice.node_id(), &alice.agreement_public_key())
            .unwrap();

        let ciphertext = alice.encrypt("for bob", Some(bob.node_id())).unwrap();
        assert!(matches!(
            carol.decrypt(&ciphertext, Some(alice.node_id())),
            Err(SecurityError::Decryption(_))
        ));
    }

    #[test]
    fn test_missing_key_never_plaintext() {
        let clock = Arc::new(ManualClock::new(0));
        let alice = manager(1, clock);

        assert!(matches!(
            alice.encrypt("hello", Some("stranger")),
            Err(SecurityError::MissingKey { .. })
        ));
        assert!(matches!(
            alice.decrypt("AAAA", Some("stranger")),
            Err(SecurityError::MissingKey { .. })
        ));
    }

    #[test]
    fn test_bad_encoding_and_truncation() {
        let (alice, bob) = paired();

        assert!(matches!(
            alice.decrypt("!!not base64!!", Some(bob.node_id())),
            Err(SecurityError::Encoding(_))
        ));
        assert!(matches!(
            alice.decrypt(&BASE64.encode([0u8; 10]), Some(bob.node_id())),
            Err(SecurityError::Truncated { .. })
        ));
    }

    #[test]
    fn test_fallback_roundtrip_between_nodes() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let alice = manager(1, clock.clone());
        let bob = manager(2, clock);

        let ciphertext = alice.encrypt("broadcast", None).unwrap();
        assert_eq!(bob.decrypt(&ciphertext, None).unwrap(), "broadcast");
    }

    #[test]
    fn test_fallback_accepts_previous_day() {
        let clock = Arc::new(ManualClock::new(20_000 * MS_PER_DAY + 1_000));
        let alice = manager(1, clock.clone());

        let ciphertext = alice.encrypt("late night", None).unwrap();
        clock.set(20_001 * MS_PER_DAY + 1_000);
        assert_eq!(alice.decrypt(&ciphertext, None).unwrap(), "late night");

        clock.set(20_002 * MS_PER_DAY + 1_000);
        assert!(alice.decrypt(&ciphertext, None).is_err());
    }

    #[test]
    fn test_rehandshake_rotates_key() {
        let (alice, bob) = paired();
        let old = alice.encrypt("before rotation", Some(bob.node_id())).unwrap();

        let fresh = SoftwareKeyStore::from_seeds([9u8; 32], [10u8; 32]).unwrap();
        bob.establish_session(alice.node_id(), &fresh.agreement_public_key().to_bytes())
            .unwrap();

        assert_eq!(bob.sessions().epoch(alice.node_id()), Some(1));
        assert!(bob.decrypt(&old, Some(alice.node_id())).is_err());
    }

    #[test]
    fn test_establish_rejects_bad_key() {
        let clock = Arc::new(ManualClock::new(0));
        let alice = manager(1, clock);

        assert!(matches!(
            alice.establish_session("peer", &[1u8; 16]),
            Err(SecurityError::KeyAgreement(_))
        ));
        assert!(matches!(
            alice.establish_session("peer", &[0u8; 32]),
            Err(SecurityError::KeyAgreement(_))
        ));
        assert!(!alice.has_session("peer"));
    }

    #[test]
    fn test_base64_handshake() {
        let clock = Arc::new(ManualClock::new(0));
        let alice = manager(1, clock.clone());
        let bob = manager(2, clock);

        alice
            .establish_session_base64(bob.node_id(), &bob.agreement_public_key_base64())
            .unwrap();
        assert!(alice.has_session(bob.node_id()));
    }

    #[test]
    fn test_sign_and_verify() {
        let (alice, bob) = paired();

        let signature = alice.sign_packet("pkt-1", "payload").unwrap();
        assert!(bob.verify_packet(alice.node_id(), "pkt-1", "payload", &signature));
        assert!(!bob.verify_packet(bob.node_id(), "pkt-1", "payload", &signature));
        assert!(!bob.verify_packet(alice.node_id(), "pkt-1", "tampered", &signature));
    }

    #[test]
    fn test_node_id_is_x_only_hex() {
        let alice = manager(1, Arc::new(ManualClock::new(0)));
        assert_eq!(alice.node_id().len(), 64);
        assert!(alice.node_id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(alice.sign_packet("pkt-1", "payload").unwrap().len(), 128);
    }
}
