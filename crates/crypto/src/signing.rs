//! Packet origin signatures.
//!
//! A signature is BIP-340 Schnorr over `SHA-256(id || payload)`, carried hex
//! encoded in the packet's `signature` field. The verifying key is the
//! sender's node id (hex x-only secp256k1 public key), so no separate key
//! directory is needed and the cloud relay can check the same signature.
//!
//! Only the original sender signs. Relays decrement `hopCount` and rewrite
//! `senderName`, neither of which is covered.

use secp256k1::{schnorr::Signature, Message, XOnlyPublicKey, SECP256K1};
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// Digest that gets signed for a packet.
pub fn packet_digest(id: &str, payload: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(payload.as_bytes());
    hasher.finalize().into()
}

/// Verify a hex signature against a hex x-only public key.
///
/// Malformed keys or signatures verify as `false`; there is no error path,
/// since the caller's only decision is whether to drop the packet.
pub fn verify_packet_signature(
    public_key_hex: &str,
    id: &str,
    payload: &str,
    signature_hex: &str,
) -> bool {
    let Ok(public_key) = XOnlyPublicKey::from_str(public_key_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_str(signature_hex) else {
        return false;
    };

    let message = Message::from_digest(packet_digest(id, payload));
    SECP256K1.verify_schnorr(&signature, &message, &public_key).is_ok()
}
