//! Identity, signed-prekey, one-time-prekey and profile-key generation.
//!
//! This module is the registration-time counterpart to [`crate::x3dh`]: it
//! produces the key material a device publishes (and the secret halves it
//! must persist locally) without touching the network or the store itself.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, PublicKeyBytes};
use crate::primitives;

/// An X25519 signed prekey: the public half plus an Ed25519 signature by
/// the owning identity key over the raw public key bytes.
pub struct SignedPreKeyPair {
    pub secret: StaticSecret,
    pub public: X25519Public,
    pub signature: [u8; 64],
}

/// A single one-time prekey. Indexed by its public half once uploaded;
/// the store contract consumes (deletes) it by that public key.
pub struct OneTimePreKeyPair {
    pub secret: StaticSecret,
    pub public: X25519Public,
}

/// A peer's published key bundle, as fetched from the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Ed25519 identity public key, base64 (standard alphabet).
    pub identity_key: String,
    /// X25519 signed prekey public, base64.
    pub signed_prekey: String,
    /// Ed25519 signature over the raw signed-prekey bytes, base64.
    pub signed_prekey_sig: String,
    /// X25519 one-time prekey public, base64. The server returns at most
    /// one per fetch and deletes it server-side in the same operation.
    pub one_time_prekey: Option<String>,
}

/// Everything a fresh registration needs to upload, plus the secret
/// material the caller is responsible for persisting locally.
pub struct RegistrationKeys {
    pub identity: IdentityKeyPair,
    pub signed_prekey: SignedPreKeyPair,
    pub one_time_prekeys: Vec<OneTimePreKeyPair>,
}

impl RegistrationKeys {
    /// Public identity key, base64 (wire alphabet).
    pub fn identity_public_b64(&self) -> String {
        primitives::b64_encode(&self.identity.public.0)
    }

    /// Public signed-prekey + signature, base64 (wire alphabet).
    pub fn signed_prekey_public_b64(&self) -> String {
        primitives::b64_encode(self.signed_prekey.public.as_bytes())
    }

    pub fn signed_prekey_signature_b64(&self) -> String {
        primitives::b64_encode(&self.signed_prekey.signature)
    }

    /// Public one-time-prekey halves, base64 (wire alphabet), in upload order.
    pub fn one_time_prekey_publics_b64(&self) -> Vec<String> {
        self.one_time_prekeys
            .iter()
            .map(|k| primitives::b64_encode(k.public.as_bytes()))
            .collect()
    }
}

/// Generate a fresh long-term Ed25519 identity keypair.
pub fn generate_identity() -> Result<IdentityKeyPair, CryptoError> {
    IdentityKeyPair::generate()
}

/// Generate a fresh X25519 Diffie-Hellman keypair.
pub fn generate_dh_pair() -> (StaticSecret, X25519Public) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    (secret, public)
}

/// Generate a signed prekey: a fresh X25519 pair, public half signed by
/// the caller's Ed25519 identity key.
pub fn generate_signed_prekey(identity: &IdentityKeyPair) -> Result<SignedPreKeyPair, CryptoError> {
    let (secret, public) = generate_dh_pair();
    let sig_vec = identity.sign(public.as_bytes());
    let signature: [u8; 64] = sig_vec
        .try_into()
        .map_err(|_| CryptoError::KeyGeneration("Ed25519 signature was not 64 bytes".into()))?;
    Ok(SignedPreKeyPair { secret, public, signature })
}

/// Generate `n` fresh one-time prekeys.
pub fn generate_one_time_prekeys(n: usize) -> Vec<OneTimePreKeyPair> {
    (0..n)
        .map(|_| {
            let (secret, public) = generate_dh_pair();
            OneTimePreKeyPair { secret, public }
        })
        .collect()
}

/// Verify an Ed25519 signature. Returns `false` rather than an error on
/// any malformed input (length mismatch, bad point encoding) so callers
/// can treat verification uniformly as a boolean predicate.
pub fn verify_signature(signature: &[u8], msg: &[u8], ed_pub: &[u8]) -> bool {
    IdentityKeyPair::verify(ed_pub, msg, signature).is_ok()
}

/// Generate a fresh 32-byte profile key.
pub fn generate_profile_key() -> [u8; 32] {
    primitives::random_32()
}

/// Generate the full set of registration material for a new account:
/// identity, signed prekey, and a batch of one-time prekeys.
pub fn prepare_registration_keys(one_time_prekey_count: usize) -> Result<RegistrationKeys, CryptoError> {
    let identity = generate_identity()?;
    let signed_prekey = generate_signed_prekey(&identity)?;
    let one_time_prekeys = generate_one_time_prekeys(one_time_prekey_count);
    Ok(RegistrationKeys { identity, signed_prekey, one_time_prekeys })
}

impl KeyBundle {
    pub fn identity_key_bytes(&self) -> Result<[u8; 32], CryptoError> {
        let raw = primitives::b64_decode(&self.identity_key)?;
        raw.try_into()
            .map_err(|_| CryptoError::InvalidPeerKey("identity key must be 32 bytes".into()))
    }

    pub fn signed_prekey_bytes(&self) -> Result<[u8; 32], CryptoError> {
        let raw = primitives::b64_decode(&self.signed_prekey)?;
        raw.try_into()
            .map_err(|_| CryptoError::InvalidPeerKey("signed prekey must be 32 bytes".into()))
    }

    pub fn signed_prekey_sig_bytes(&self) -> Result<[u8; 64], CryptoError> {
        let raw = primitives::b64_decode(&self.signed_prekey_sig)?;
        raw.try_into()
            .map_err(|_| CryptoError::InvalidPeerKey("signature must be 64 bytes".into()))
    }

    pub fn one_time_prekey_bytes(&self) -> Result<Option<[u8; 32]>, CryptoError> {
        match &self.one_time_prekey {
            None => Ok(None),
            Some(s) => {
                let raw = primitives::b64_decode(s)?;
                let arr: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| CryptoError::InvalidPeerKey("one-time prekey must be 32 bytes".into()))?;
                Ok(Some(arr))
            }
        }
    }

    /// Human-readable identity fingerprint for out-of-band safety-number
    /// comparison.
    pub fn identity_fingerprint(&self) -> Result<String, CryptoError> {
        Ok(PublicKeyBytes(self.identity_key_bytes()?.to_vec()).fingerprint())
    }
}
