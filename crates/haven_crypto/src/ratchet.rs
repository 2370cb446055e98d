//! Double Ratchet: per-peer session state, symmetric and DH ratchets, and
//! the skipped-message-key cache for out-of-order delivery.
//!
//! Reference: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   `root_key`             — updated on every DH ratchet step
//!   `send_chain_key`       — updated per sent message
//!   `recv_chain_key`       — updated per received message
//!   message key            — derived from a chain key, used exactly once, then wiped
//!
//! A DH ratchet step mixes a fresh Diffie-Hellman output into the root key
//! via HKDF, producing a new root key and a new chain key — this is what
//! gives post-compromise security. The symmetric chain step (`KDF_CK`)
//! inside one DH epoch gives forward secrecy message-to-message.
//!
//! AEAD failure partway through a DH ratchet must not leave the session in
//! a half-ratcheted state: every code path here computes the full result
//! of a decrypt attempt into local variables and only writes back into
//! `self` after the AEAD open has succeeded (draft-and-swap).

use std::collections::{HashMap, VecDeque};

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::primitives;

const RATCHET_INFO: &[u8] = b"haven_ratchet";
const CHAIN_MSG_KEY: u8 = 0x01;
const CHAIN_NEXT_KEY: u8 = 0x02;

/// Bound on the total number of skipped message keys retained across the
/// whole session. Oldest entries are evicted first once exceeded.
pub const MAX_SKIP: u64 = 1000;

const ZERO_NONCE: [u8; 24] = [0u8; 24];

// ── Ratchet header ─────────────────────────────────────────────────────────

/// Carried alongside every ciphertext, unencrypted but bound into the AEAD
/// associated data. Wire layout: `dh_pub(32) ‖ pn(u32 BE) ‖ n(u32 BE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    pub dh_pub: X25519Public,
    pub pn: u32,
    pub n: u32,
}

impl RatchetHeader {
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(self.dh_pub.as_bytes());
        out[32..36].copy_from_slice(&self.pn.to_be_bytes());
        out[36..].copy_from_slice(&self.n.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() < 40 {
            return Err(CryptoError::Truncated("ratchet header shorter than 40 bytes".into()));
        }
        let dh_pub = X25519Public::from(<[u8; 32]>::try_from(&bytes[..32]).expect("checked length"));
        let pn = u32::from_be_bytes(bytes[32..36].try_into().expect("checked length"));
        let n = u32::from_be_bytes(bytes[36..40].try_into().expect("checked length"));
        Ok(Self { dh_pub, pn, n })
    }
}

// ── Session state ──────────────────────────────────────────────────────────

/// Full Double Ratchet session state for one peer. Every field here is
/// either public key material or secret key material zeroized on drop.
pub struct RatchetSession {
    root_key: [u8; 32],

    dh_self_secret: [u8; 32],
    dh_self_pub: X25519Public,
    dh_remote_pub: Option<X25519Public>,

    send_chain_key: Option<[u8; 32]>,
    recv_chain_key: Option<[u8; 32]>,

    send_n: u32,
    recv_n: u32,
    prev_send_n: u32,

    /// `(dh_remote_pub bytes, counter) -> message key`, bounded by MAX_SKIP.
    skipped_keys: HashMap<([u8; 32], u32), [u8; 32]>,
    /// Insertion order of `skipped_keys`, for FIFO eviction.
    skipped_order: VecDeque<([u8; 32], u32)>,

    /// Fixed at session creation: `alice_identity_pub ‖ bob_identity_pub`.
    ad: [u8; 64],
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_self_secret.zeroize();
        if let Some(ck) = self.send_chain_key.as_mut() {
            ck.zeroize();
        }
        if let Some(ck) = self.recv_chain_key.as_mut() {
            ck.zeroize();
        }
        for mk in self.skipped_keys.values_mut() {
            mk.zeroize();
        }
    }
}

impl RatchetSession {
    /// Initiator (Alice) construction: she performs the first DH ratchet
    /// step immediately, against Bob's signed prekey acting as his initial
    /// ratchet public key.
    pub fn init_alice(shared_key: [u8; 32], ad: [u8; 64], bob_spk_pub: &X25519Public) -> Result<Self, CryptoError> {
        let dh_self_secret = StaticSecret::random_from_rng(OsRng);
        let dh_self_pub = X25519Public::from(&dh_self_secret);

        let dh_output = primitives::dh(&dh_self_secret, bob_spk_pub)?;
        let (root_key, send_ck) = kdf_rk(&shared_key, &dh_output)?;

        Ok(Self {
            root_key,
            dh_self_secret: dh_self_secret.to_bytes(),
            dh_self_pub,
            dh_remote_pub: Some(*bob_spk_pub),
            send_chain_key: Some(send_ck),
            recv_chain_key: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            skipped_keys: HashMap::new(),
            skipped_order: VecDeque::new(),
            ad,
        })
    }

    /// Responder (Bob) construction: his signed-prekey pair acts as his
    /// initial ratchet keypair. He has no chains yet — those are
    /// established by the DH ratchet step triggered by Alice's first message.
    pub fn init_bob(shared_key: [u8; 32], ad: [u8; 64], my_spk_secret: &StaticSecret, my_spk_pub: &X25519Public) -> Self {
        Self {
            root_key: shared_key,
            dh_self_secret: my_spk_secret.to_bytes(),
            dh_self_pub: *my_spk_pub,
            dh_remote_pub: None,
            send_chain_key: None,
            recv_chain_key: None,
            send_n: 0,
            recv_n: 0,
            prev_send_n: 0,
            skipped_keys: HashMap::new(),
            skipped_order: VecDeque::new(),
            ad,
        }
    }

    pub fn our_ratchet_pub(&self) -> X25519Public {
        self.dh_self_pub
    }

    fn build_aad(&self, header: &RatchetHeader) -> Vec<u8> {
        let mut aad = Vec::with_capacity(64 + 40);
        aad.extend_from_slice(&self.ad);
        aad.extend_from_slice(&header.to_bytes());
        aad
    }

    fn remember_skip_capacity(&self, additional: u64) -> Result<(), CryptoError> {
        if self.skipped_keys.len() as u64 + additional > MAX_SKIP {
            return Err(CryptoError::TooManySkipped(self.skipped_keys.len() as u64 + additional));
        }
        Ok(())
    }

    fn commit_skips(&mut self, skips: Vec<(([u8; 32], u32), [u8; 32])>) {
        for (key, mk) in skips {
            self.skipped_keys.insert(key, mk);
            self.skipped_order.push_back(key);
        }
        while self.skipped_keys.len() as u64 > MAX_SKIP {
            if let Some(oldest) = self.skipped_order.pop_front() {
                if let Some(mut mk) = self.skipped_keys.remove(&oldest) {
                    mk.zeroize();
                }
            } else {
                break;
            }
        }
    }

    // ── Encrypt ────────────────────────────────────────────────────────────

    /// Encrypt a message. Advances the sending chain and returns the header
    /// to send alongside the ciphertext.
    pub fn encrypt_step(&mut self, plaintext: &[u8]) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
        let send_ck = self.send_chain_key.ok_or(CryptoError::NotReady)?;
        let (new_ck, mk) = kdf_ck(&send_ck);

        let header = RatchetHeader { dh_pub: self.dh_self_pub, pn: self.prev_send_n, n: self.send_n };
        let aad = {
            let mut a = Vec::with_capacity(64 + 40);
            a.extend_from_slice(&self.ad);
            a.extend_from_slice(&header.to_bytes());
            a
        };
        let ciphertext = primitives::secretbox_encrypt_with_nonce(&mk, &ZERO_NONCE, plaintext, &aad)?;

        self.send_chain_key = Some(new_ck);
        self.send_n += 1;
        Ok((header, ciphertext))
    }

    // ── Decrypt ────────────────────────────────────────────────────────────

    /// Decrypt a received message, advancing the receiving (and possibly
    /// sending) ratchet as needed. Nothing in `self` is mutated unless the
    /// AEAD open at the end of this call succeeds.
    pub fn decrypt_step(&mut self, header: &RatchetHeader, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let same_epoch = self.dh_remote_pub.map(|cur| cur.as_bytes() == header.dh_pub.as_bytes()).unwrap_or(false);

        if same_epoch {
            return self.decrypt_same_epoch(header, ciphertext);
        }
        self.decrypt_new_epoch(header, ciphertext)
    }

    fn decrypt_same_epoch(&mut self, header: &RatchetHeader, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let skip_key = (*header.dh_pub.as_bytes(), header.n);
        if let Some(mk) = self.skipped_keys.get(&skip_key).copied() {
            let aad = self.build_aad(header);
            let plaintext = primitives::secretbox_decrypt_with_nonce(&mk, &ZERO_NONCE, ciphertext, &aad)?;
            if let Some(mut stored) = self.skipped_keys.remove(&skip_key) {
                stored.zeroize();
            }
            self.skipped_order.retain(|k| *k != skip_key);
            return Ok(plaintext);
        }

        let recv_ck = self.recv_chain_key.ok_or(CryptoError::NotReady)?;
        if header.n < self.recv_n {
            // Counter for an index we've already advanced past and whose
            // skipped key (if any) is gone: either a duplicate delivery of
            // an already-consumed message or a stale replay.
            return Err(CryptoError::BadCiphertext);
        }

        let skip_count = (header.n - self.recv_n) as u64;
        self.remember_skip_capacity(skip_count)?;

        let mut chain = recv_ck;
        let mut new_skips = Vec::with_capacity(skip_count as usize);
        for i in self.recv_n..header.n {
            let (next_ck, mk) = kdf_ck(&chain);
            new_skips.push(((*header.dh_pub.as_bytes(), i), mk));
            chain = next_ck;
        }
        let (final_ck, mk) = kdf_ck(&chain);

        let aad = self.build_aad(header);
        let plaintext = primitives::secretbox_decrypt_with_nonce(&mk, &ZERO_NONCE, ciphertext, &aad)?;

        self.commit_skips(new_skips);
        self.recv_chain_key = Some(final_ck);
        self.recv_n = header.n + 1;
        Ok(plaintext)
    }

    fn decrypt_new_epoch(&mut self, header: &RatchetHeader, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Step 1: skip remaining messages in the outgoing (old) receiving
        // chain, up to header.pn, computed from local state only.
        let mut pre_skips = Vec::new();
        if let (Some(old_recv_ck), Some(old_remote_pub)) = (self.recv_chain_key, self.dh_remote_pub) {
            if header.pn > self.recv_n {
                let skip_count = (header.pn - self.recv_n) as u64;
                self.remember_skip_capacity(skip_count)?;
                let mut chain = old_recv_ck;
                for i in self.recv_n..header.pn {
                    let (next_ck, mk) = kdf_ck(&chain);
                    pre_skips.push(((*old_remote_pub.as_bytes(), i), mk));
                    chain = next_ck;
                }
            }
        }

        // Step 2: receiving DH ratchet step.
        let dh_self_secret = StaticSecret::from(self.dh_self_secret);
        let dh_recv_output = primitives::dh(&dh_self_secret, &header.dh_pub)?;
        let (rk_after_recv, new_recv_ck_start) = kdf_rk(&self.root_key, &dh_recv_output)?;

        // Step 3: derive message keys in the new receiving chain up to header.n.
        self.remember_skip_capacity(pre_skips.len() as u64 + header.n as u64)?;
        let mut chain = new_recv_ck_start;
        let mut epoch_skips = Vec::with_capacity(header.n as usize);
        for i in 0..header.n {
            let (next_ck, mk) = kdf_ck(&chain);
            epoch_skips.push(((*header.dh_pub.as_bytes(), i), mk));
            chain = next_ck;
        }
        let (final_recv_ck, mk) = kdf_ck(&chain);

        let aad = {
            let mut a = Vec::with_capacity(64 + 40);
            a.extend_from_slice(&self.ad);
            a.extend_from_slice(&header.to_bytes());
            a
        };
        let plaintext = primitives::secretbox_decrypt_with_nonce(&mk, &ZERO_NONCE, ciphertext, &aad)?;

        // Step 4: sending DH ratchet step, computed but not yet committed.
        let new_dh_self_secret = StaticSecret::random_from_rng(OsRng);
        let new_dh_self_pub = X25519Public::from(&new_dh_self_secret);
        let dh_send_output = primitives::dh(&new_dh_self_secret, &header.dh_pub)?;
        let (rk_after_send, new_send_ck) = kdf_rk(&rk_after_recv, &dh_send_output)?;

        // Commit point: everything above succeeded, including the AEAD
        // open, so it is now safe to mutate `self`.
        self.commit_skips(pre_skips);
        self.commit_skips(epoch_skips);
        self.dh_remote_pub = Some(header.dh_pub);
        self.root_key = rk_after_send;
        self.recv_chain_key = Some(final_recv_ck);
        self.recv_n = header.n + 1;
        self.prev_send_n = self.send_n;
        self.send_n = 0;
        self.send_chain_key = Some(new_send_ck);
        self.dh_self_secret = new_dh_self_secret.to_bytes();
        self.dh_self_pub = new_dh_self_pub;

        Ok(plaintext)
    }

    // ── Serialization ──────────────────────────────────────────────────────

    /// Serialize the full session state, including the skipped-key map, to
    /// a deterministic byte string for storage.
    pub fn serialize_session(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(1u8); // format version
        out.extend_from_slice(&self.root_key);
        out.extend_from_slice(&self.dh_self_secret);
        out.extend_from_slice(self.dh_self_pub.as_bytes());

        match self.dh_remote_pub {
            Some(p) => {
                out.push(1);
                out.extend_from_slice(p.as_bytes());
            }
            None => out.push(0),
        }
        match self.send_chain_key {
            Some(ck) => {
                out.push(1);
                out.extend_from_slice(&ck);
            }
            None => out.push(0),
        }
        match self.recv_chain_key {
            Some(ck) => {
                out.push(1);
                out.extend_from_slice(&ck);
            }
            None => out.push(0),
        }

        out.extend_from_slice(&self.send_n.to_be_bytes());
        out.extend_from_slice(&self.recv_n.to_be_bytes());
        out.extend_from_slice(&self.prev_send_n.to_be_bytes());
        out.extend_from_slice(&self.ad);

        out.extend_from_slice(&(self.skipped_order.len() as u32).to_be_bytes());
        for key in &self.skipped_order {
            let mk = self.skipped_keys.get(key).expect("skipped_order and skipped_keys stay in sync");
            out.extend_from_slice(&key.0);
            out.extend_from_slice(&key.1.to_be_bytes());
            out.extend_from_slice(mk);
        }
        out
    }

    /// Inverse of [`RatchetSession::serialize_session`]; validates field
    /// widths and rejects truncated input.
    pub fn deserialize_session(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize, bytes: &[u8]| -> Result<Vec<u8>, CryptoError> {
            if bytes.len() < *pos + n {
                return Err(CryptoError::Truncated(format!("ratchet session truncated at offset {pos}")));
            }
            let slice = bytes[*pos..*pos + n].to_vec();
            *pos += n;
            Ok(slice)
        };

        let version = take(&mut pos, 1, bytes)?[0];
        if version != 1 {
            return Err(CryptoError::InvalidKey(format!("unsupported ratchet session version {version}")));
        }

        let root_key: [u8; 32] = take(&mut pos, 32, bytes)?.try_into().expect("checked length");
        let dh_self_secret: [u8; 32] = take(&mut pos, 32, bytes)?.try_into().expect("checked length");
        let dh_self_pub = X25519Public::from(<[u8; 32]>::try_from(take(&mut pos, 32, bytes)?.as_slice()).expect("checked length"));

        let dh_remote_pub = if take(&mut pos, 1, bytes)?[0] == 1 {
            Some(X25519Public::from(<[u8; 32]>::try_from(take(&mut pos, 32, bytes)?.as_slice()).expect("checked length")))
        } else {
            None
        };
        let send_chain_key = if take(&mut pos, 1, bytes)?[0] == 1 {
            Some(<[u8; 32]>::try_from(take(&mut pos, 32, bytes)?.as_slice()).expect("checked length"))
        } else {
            None
        };
        let recv_chain_key = if take(&mut pos, 1, bytes)?[0] == 1 {
            Some(<[u8; 32]>::try_from(take(&mut pos, 32, bytes)?.as_slice()).expect("checked length"))
        } else {
            None
        };

        let send_n = u32::from_be_bytes(take(&mut pos, 4, bytes)?.try_into().expect("checked length"));
        let recv_n = u32::from_be_bytes(take(&mut pos, 4, bytes)?.try_into().expect("checked length"));
        let prev_send_n = u32::from_be_bytes(take(&mut pos, 4, bytes)?.try_into().expect("checked length"));
        let ad: [u8; 64] = take(&mut pos, 64, bytes)?.try_into().expect("checked length");

        let skip_count = u32::from_be_bytes(take(&mut pos, 4, bytes)?.try_into().expect("checked length"));
        let mut skipped_keys = HashMap::new();
        let mut skipped_order = VecDeque::new();
        for _ in 0..skip_count {
            let dh_pub: [u8; 32] = take(&mut pos, 32, bytes)?.try_into().expect("checked length");
            let n = u32::from_be_bytes(take(&mut pos, 4, bytes)?.try_into().expect("checked length"));
            let mk: [u8; 32] = take(&mut pos, 32, bytes)?.try_into().expect("checked length");
            skipped_keys.insert((dh_pub, n), mk);
            skipped_order.push_back((dh_pub, n));
        }

        Ok(Self {
            root_key,
            dh_self_secret,
            dh_self_pub,
            dh_remote_pub,
            send_chain_key,
            recv_chain_key,
            send_n,
            recv_n,
            prev_send_n,
            skipped_keys,
            skipped_order,
            ad,
        })
    }

    #[cfg(test)]
    pub(crate) fn skipped_len(&self) -> usize {
        self.skipped_keys.len()
    }
}

// ── KDF helpers ──────────────────────────────────────────────────────────

fn kdf_rk(rk: &[u8; 32], dh_output: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut out = [0u8; 64];
    primitives::hkdf(rk, dh_output, RATCHET_INFO, &mut out)?;
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    new_rk.copy_from_slice(&out[..32]);
    ck.copy_from_slice(&out[32..]);
    Ok((new_rk, ck))
}

fn kdf_ck(ck: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let new_ck = primitives::hmac_sha256(ck, &[CHAIN_NEXT_KEY]);
    let mk = primitives::hmac_sha256(ck, &[CHAIN_MSG_KEY]);
    (new_ck, mk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_pair(shared_key: [u8; 32], ad: [u8; 64]) -> (RatchetSession, RatchetSession) {
        let bob_spk = StaticSecret::random_from_rng(OsRng);
        let bob_spk_pub = X25519Public::from(&bob_spk);
        let alice = RatchetSession::init_alice(shared_key, ad, &bob_spk_pub).unwrap();
        let bob = RatchetSession::init_bob(shared_key, ad, &bob_spk, &bob_spk_pub);
        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = fresh_pair([42u8; 32], [7u8; 64]);

        for i in 0..3 {
            let (header, ct) = alice.encrypt_step(format!("msg {i}").as_bytes()).unwrap();
            let pt = bob.decrypt_step(&header, &ct).unwrap();
            assert_eq!(pt, format!("msg {i}").into_bytes());
        }

        for i in 0..2 {
            let (header, ct) = bob.encrypt_step(format!("reply {i}").as_bytes()).unwrap();
            let pt = alice.decrypt_step(&header, &ct).unwrap();
            assert_eq!(pt, format!("reply {i}").into_bytes());
        }

        let (header, ct) = alice.encrypt_step(b"again").unwrap();
        let pt = bob.decrypt_step(&header, &ct).unwrap();
        assert_eq!(pt, b"again");
    }

    #[test]
    fn out_of_order_messages_return_to_empty_skip_cache() {
        let (mut alice, mut bob) = fresh_pair([99u8; 32], [3u8; 64]);

        let (h0, ct0) = alice.encrypt_step(b"zero").unwrap();
        let (h1, ct1) = alice.encrypt_step(b"one").unwrap();
        let (h2, ct2) = alice.encrypt_step(b"two").unwrap();

        assert_eq!(bob.decrypt_step(&h2, &ct2).unwrap(), b"two");
        assert_eq!(bob.skipped_len(), 2);
        assert_eq!(bob.decrypt_step(&h0, &ct0).unwrap(), b"zero");
        assert_eq!(bob.decrypt_step(&h1, &ct1).unwrap(), b"one");
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn tampered_ciphertext_is_rejected_without_advancing_state() {
        let (mut alice, mut bob) = fresh_pair([5u8; 32], [1u8; 64]);
        let (header, mut ct) = alice.encrypt_step(b"hello").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(bob.decrypt_step(&header, &ct).is_err());
        assert!(bob.recv_chain_key.is_none());
        assert!(bob.dh_remote_pub.is_none());
    }

    #[test]
    fn serialize_roundtrips_including_skipped_keys() {
        let (mut alice, mut bob) = fresh_pair([11u8; 32], [2u8; 64]);
        let (h0, ct0) = alice.encrypt_step(b"a").unwrap();
        let (_h1, _ct1) = alice.encrypt_step(b"b").unwrap();
        let (h2, ct2) = alice.encrypt_step(b"c").unwrap();

        bob.decrypt_step(&h2, &ct2).unwrap();
        assert_eq!(bob.skipped_len(), 2);

        let bytes = bob.serialize_session();
        let mut restored = RatchetSession::deserialize_session(&bytes).unwrap();
        assert_eq!(restored.skipped_len(), 2);
        assert_eq!(restored.decrypt_step(&h0, &ct0).unwrap(), b"a");
    }

    #[test]
    fn too_many_skipped_messages_is_rejected() {
        let (mut alice, mut bob) = fresh_pair([13u8; 32], [4u8; 64]);
        for _ in 0..=MAX_SKIP {
            alice.encrypt_step(b"x").unwrap();
        }
        let (header, ct) = alice.encrypt_step(b"last").unwrap();
        assert!(matches!(bob.decrypt_step(&header, &ct), Err(CryptoError::TooManySkipped(_))));
    }
}
