//! Sender Keys: per-(sender, channel) symmetric chain for group messaging.
//!
//! Unlike the Double Ratchet, a sender key chain only ever moves forward —
//! there is no DH ratchet and no per-recipient pairwise state. One sender
//! per channel maintains exactly one chain; every other member distributes
//! nothing and simply ratchets the chain forward as envelopes arrive.
//!
//! State machine (this device as sender, one instance per channel):
//!   `Uninitialized` → [`generate_sender_key`] → `Undistributed` →
//!   (caller distributes SKDMs to members) → `Distributed` → (forever, or
//!   until [`SenderKeyState::invalidate`] resets to `Uninitialized`).
//!
//! A sender key never rolls back: once a message has been sent at a given
//! `chain_index`, the chain can only advance.

use ed25519_dalek::VerifyingKey;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::primitives;

const CHAIN_MSG_KEY: u8 = 0x01;
const CHAIN_NEXT_KEY: u8 = 0x02;

/// A single sender-key chain: distribution id, current chain key, and the
/// next message index to send or expect.
#[derive(ZeroizeOnDrop)]
pub struct SenderKeyChain {
    #[zeroize(skip)]
    pub distribution_id: [u8; 16],
    chain_key: [u8; 32],
    pub chain_index: u32,
}

/// This device's outbound state for one channel.
pub enum SenderKeyState {
    Uninitialized,
    Undistributed(SenderKeyChain),
    Distributed(SenderKeyChain),
}

impl Default for SenderKeyState {
    fn default() -> Self {
        SenderKeyState::Uninitialized
    }
}

impl SenderKeyState {
    pub fn new() -> Self {
        SenderKeyState::Uninitialized
    }

    /// `Uninitialized -> Undistributed`: mint a fresh chain. Also callable
    /// from any other state to rotate onto a brand new chain (e.g. after
    /// [`SenderKeyState::invalidate`]).
    pub fn generate_sender_key(&mut self) {
        let chain = SenderKeyChain {
            distribution_id: primitives::random_16(),
            chain_key: primitives::random_32(),
            chain_index: 0,
        };
        *self = SenderKeyState::Undistributed(chain);
    }

    fn chain(&self) -> Option<&SenderKeyChain> {
        match self {
            SenderKeyState::Uninitialized => None,
            SenderKeyState::Undistributed(c) | SenderKeyState::Distributed(c) => Some(c),
        }
    }

    /// Build the 52-byte SKDM payload for the current chain:
    /// `distribution_id(16) ‖ chain_index(u32 LE) ‖ chain_key(32)`.
    pub fn create_skdm_payload(&self) -> Result<[u8; 52], CryptoError> {
        let chain = self.chain().ok_or(CryptoError::NotReady)?;
        let mut out = [0u8; 52];
        out[..16].copy_from_slice(&chain.distribution_id);
        out[16..20].copy_from_slice(&chain.chain_index.to_le_bytes());
        out[20..].copy_from_slice(&chain.chain_key);
        Ok(out)
    }

    /// `Undistributed -> Distributed`. Call once every member's SKDM has
    /// been posted to the API.
    pub fn mark_distributed(&mut self) {
        if let SenderKeyState::Undistributed(_) = self {
            let old = std::mem::replace(self, SenderKeyState::Uninitialized);
            if let SenderKeyState::Undistributed(chain) = old {
                *self = SenderKeyState::Distributed(chain);
            }
        }
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, SenderKeyState::Distributed(_))
    }

    /// The chain's distribution id, if one has been generated yet.
    pub fn distribution_id(&self) -> Option<[u8; 16]> {
        self.chain().map(|c| c.distribution_id)
    }

    /// One ratchet step: `mk = HMAC(ck, 0x01)`, `ck' = HMAC(ck, 0x02)`, then
    /// XChaCha20-Poly1305-encrypt with a random 24-byte nonce. Returns the
    /// chain index this message was sent at, the nonce, and the ciphertext.
    /// Only valid once distributed; the chain never rolls back.
    pub fn sender_key_encrypt(&mut self, plaintext: &[u8]) -> Result<(u32, [u8; 24], Vec<u8>), CryptoError> {
        let chain = match self {
            SenderKeyState::Distributed(c) => c,
            _ => return Err(CryptoError::NotReady),
        };

        let mk = primitives::hmac_sha256(&chain.chain_key, &[CHAIN_MSG_KEY]);
        let new_ck = primitives::hmac_sha256(&chain.chain_key, &[CHAIN_NEXT_KEY]);

        let index = chain.chain_index;
        let nonce = primitives::random_24();
        let aad = envelope_aad(&chain.distribution_id, index);
        let ciphertext = primitives::aead_encrypt_with_nonce(&mk, &nonce, plaintext, &aad)?;

        chain.chain_key = new_ck;
        chain.chain_index += 1;
        Ok((index, nonce, ciphertext))
    }

    /// `-> Uninitialized`. On member removal or policy rotation; the next
    /// send path regenerates a new chain and redistributes.
    pub fn invalidate(&mut self) {
        *self = SenderKeyState::Uninitialized;
    }
}

fn envelope_aad(distribution_id: &[u8; 16], chain_index: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(20);
    aad.extend_from_slice(distribution_id);
    aad.extend_from_slice(&chain_index.to_le_bytes());
    aad
}

/// Seal a 52-byte SKDM payload to one member's Ed25519 identity public key.
pub fn encrypt_skdm(payload: &[u8; 52], member_identity_ed_pub: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let member_x = primitives::ed25519_pub_to_x25519(member_identity_ed_pub)?;
    primitives::seal(&member_x, payload)
}

/// Open a sealed SKDM addressed to our identity and parse its payload.
pub fn decrypt_skdm(sealed: &[u8], our_identity: &IdentityKeyPair) -> Result<[u8; 52], CryptoError> {
    let our_x_secret = primitives::ed25519_secret_to_x25519(our_identity.secret_bytes());
    let payload = primitives::unseal(&our_x_secret, sealed)?;
    payload
        .try_into()
        .map_err(|_| CryptoError::Truncated("SKDM payload must be 52 bytes".into()))
}

/// Parse a raw 52-byte SKDM payload.
pub fn parse_skdm_payload(payload: &[u8; 52]) -> ([u8; 16], u32, [u8; 32]) {
    let mut distribution_id = [0u8; 16];
    distribution_id.copy_from_slice(&payload[..16]);
    let chain_index = u32::from_le_bytes(payload[16..20].try_into().expect("fixed-size payload"));
    let mut chain_key = [0u8; 32];
    chain_key.copy_from_slice(&payload[20..]);
    (distribution_id, chain_index, chain_key)
}

/// Receiver-side cache entry: one chain per `(channel_id, distribution_id)`.
#[derive(ZeroizeOnDrop)]
pub struct ReceivedSenderKey {
    #[zeroize(skip)]
    pub from_user_id: String,
    #[zeroize(skip)]
    pub distribution_id: [u8; 16],
    chain_key: [u8; 32],
    pub chain_index: u32,
}

impl ReceivedSenderKey {
    pub fn from_skdm(from_user_id: String, distribution_id: [u8; 16], chain_index: u32, chain_key: [u8; 32]) -> Self {
        Self { from_user_id, distribution_id, chain_key, chain_index }
    }

    /// Decrypt a group envelope. Ratchets the chain forward to
    /// `envelope_chain_index` without storing intermediate keys (group
    /// messages are not recoverable out-of-order beyond monotonic growth),
    /// then advances the stored chain to `envelope_chain_index + 1`.
    ///
    /// `envelope_chain_index < self.chain_index` is a replay.
    pub fn decrypt(&mut self, envelope_chain_index: u32, nonce: &[u8; 24], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope_chain_index < self.chain_index {
            return Err(CryptoError::Replay { got: envelope_chain_index as u64, stored: self.chain_index as u64 });
        }

        let mut chain_key = self.chain_key;
        for _ in self.chain_index..envelope_chain_index {
            chain_key = primitives::hmac_sha256(&chain_key, &[CHAIN_NEXT_KEY]);
        }
        let mk = primitives::hmac_sha256(&chain_key, &[CHAIN_MSG_KEY]);
        let next_chain_key = primitives::hmac_sha256(&chain_key, &[CHAIN_NEXT_KEY]);

        let aad = envelope_aad(&self.distribution_id, envelope_chain_index);
        let plaintext = primitives::aead_decrypt_with_nonce(&mk, nonce, ciphertext, &aad)?;

        self.chain_key = next_chain_key;
        self.chain_index = envelope_chain_index + 1;
        Ok(plaintext)
    }
}

/// Convenience: derive the X25519 identity form used when sealing/opening
/// SKDMs, exposed for callers that already hold an [`VerifyingKey`] rather
/// than raw bytes.
pub fn identity_x25519_from_verifying(vk: &VerifyingKey) -> Result<x25519_dalek::PublicKey, CryptoError> {
    primitives::ed25519_pub_to_x25519(&vk.to_bytes())
}
