//! Device key material behind a capability interface.
//!
//! A node owns two independent keypairs:
//!
//! 1. an X25519 agreement key, used only to derive per-peer session keys;
//! 2. a secp256k1 network-identity key, used only for BIP-340 Schnorr
//!    signatures. Its x-only public half, hex encoded, is the node id other
//!    peers see in `senderId`, the same form a public relay expects as an
//!    event pubkey.
//!
//! Implementations never hand out the secret halves. A hardware-backed store
//! performs the operations in place; [`SoftwareKeyStore`] keeps them in
//! process memory and is what tests use.

use crate::error::{SecurityError, SecurityResult};
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{schnorr, Keypair, Message, XOnlyPublicKey, SECP256K1};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// Operations the security layer needs from device key storage.
pub trait KeyStore: Send + Sync {
    /// Public half of the agreement keypair.
    fn agreement_public_key(&self) -> X25519PublicKey;

    /// Raw X25519 shared secret with `peer_public`.
    fn diffie_hellman(&self, peer_public: &X25519PublicKey) -> SecurityResult<Zeroizing<[u8; 32]>>;

    /// X-only public half of the network-identity keypair.
    fn network_public_key(&self) -> XOnlyPublicKey;

    /// BIP-340 signature over a 32-byte digest, without auxiliary randomness.
    fn sign(&self, digest: &[u8; 32]) -> SecurityResult<schnorr::Signature>;
}

/// In-memory key store.
pub struct SoftwareKeyStore {
    agreement: StaticSecret,
    identity: Keypair,
}

impl SoftwareKeyStore {
    /// Generate fresh keys from the OS RNG.
    pub fn generate() -> Self {
        let mut agreement_seed = [0u8; 32];
        OsRng.fill_bytes(&mut agreement_seed);
        let agreement = StaticSecret::from(agreement_seed);
        agreement_seed.zeroize();

        // a random scalar is out of range with negligible probability
        let identity = loop {
            let mut seed = Zeroizing::new([0u8; 32]);
            OsRng.fill_bytes(seed.as_mut());
            if let Ok(keypair) = Keypair::from_seckey_slice(SECP256K1, seed.as_ref()) {
                break keypair;
            }
        };

        Self { agreement, identity }
    }

    /// Rebuild a store from known seeds. Deterministic, for fixtures.
    ///
    /// `identity_seed` is the secp256k1 secret scalar and must be non-zero
    /// and below the group order.
    pub fn from_seeds(agreement_seed: [u8; 32], identity_seed: [u8; 32]) -> SecurityResult<Self> {
        let identity = Keypair::from_seckey_slice(SECP256K1, &identity_seed)
            .map_err(|e| SecurityError::KeyStore(format!("invalid identity seed: {}", e)))?;
        Ok(Self {
            agreement: StaticSecret::from(agreement_seed),
            identity,
        })
    }
}

impl KeyStore for SoftwareKeyStore {
    fn agreement_public_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.agreement)
    }

    fn diffie_hellman(&self, peer_public: &X25519PublicKey) -> SecurityResult<Zeroizing<[u8; 32]>> {
        let shared = self.agreement.diffie_hellman(peer_public);
        Ok(Zeroizing::new(*shared.as_bytes()))
    }

    fn network_public_key(&self) -> XOnlyPublicKey {
        self.identity.x_only_public_key().0
    }

    fn sign(&self, digest: &[u8; 32]) -> SecurityResult<schnorr::Signature> {
        let message = Message::from_digest(*digest);
        Ok(SECP256K1.sign_schnorr_no_aux_rand(&message, &self.identity))
    }
}

impl fmt::Debug for SoftwareKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareKeyStore")
            .field("agreement_public", &hex::encode(self.agreement_public_key().as_bytes()))
            .field("identity_public", &self.network_public_key().to_string())
            .finish()
    }
}
