//! Daily-rotating shared key for broadcast traffic.
//!
//! Every node that knows the network salt derives the same key for a given
//! UTC day, so broadcast payloads can be opened by anyone in the mesh without
//! a handshake. This is obfuscation against casual observation, not
//! confidentiality: anyone who knows the salt can read the traffic, and the
//! default salt ships with every install.

use crate::session::SessionKey;

/// Domain separator mixed into every fallback key derivation.
pub const FALLBACK_KEY_CONTEXT: &str = "ghostmesh fallback key v1";

/// Key for `epoch_day` days since 1970-01-01 UTC.
pub fn fallback_key_for_day(salt: &str, epoch_day: u64) -> SessionKey {
    let mut hasher = blake3::Hasher::new_derive_key(FALLBACK_KEY_CONTEXT);
    hasher.update(salt.as_bytes());
    hasher.update(&epoch_day.to_be_bytes());
    SessionKey::from_bytes(*hasher.finalize().as_bytes())
}
