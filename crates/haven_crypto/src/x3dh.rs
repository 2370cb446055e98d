//! X3DH (Extended Triple Diffie-Hellman) asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519), RFC 5869 (HKDF)
//!
//! Alice (initiator) fetches Bob's published [`KeyBundle`]:
//!   `IK_B` (identity, Ed25519 → converted to X25519), `SPK_B` (signed
//!   prekey, X25519) with its Ed25519 signature, and an optional `OPK_B`.
//!
//! Alice generates one ephemeral X25519 keypair `EK_A` and computes:
//!   `DH1 = DH(IK_A_x, SPK_B)` — mutual authentication
//!   `DH2 = DH(EK_A, IK_B_x)`  — forward secrecy
//!   `DH3 = DH(EK_A, SPK_B)`   — replay protection
//!   `DH4 = DH(EK_A, OPK_B)`   — one-time forward secrecy, if an OPK was offered
//!
//! `SK = HKDF(salt = 0×32, IKM = PADDING ‖ DH1 ‖ DH2 ‖ DH3 [‖ DH4], INFO)`.
//! Bob reconstructs the same DH set with mirrored operands and derives the
//! identical SK, which feeds [`crate::ratchet`] as the initial root key.

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;
use crate::keys::KeyBundle;
use crate::primitives;

const INFO: &[u8] = b"haven_x3dh";

fn padding() -> [u8; 32] {
    [0xFFu8; 32]
}

fn salt() -> [u8; 32] {
    [0u8; 32]
}

/// Result of the initiator's X3DH computation.
pub struct X3DHResult {
    /// 32-byte shared secret; feeds the Double Ratchet as the initial root key.
    pub shared_key: [u8; 32],
    /// 64-byte associated data: `IK_A_ed ‖ IK_B_ed`, bound into every
    /// subsequent ratchet AEAD call for this session.
    pub ad: [u8; 64],
    /// Alice's ephemeral X25519 public key — goes in the `0x01` envelope header.
    pub ephemeral_pub: X25519Public,
    /// Whether Bob's bundle offered (and this call consumed) a one-time prekey.
    pub used_otp: bool,
    /// The one-time prekey public half that was consumed, if any.
    pub otp_pub: Option<X25519Public>,
}

fn build_ikm(dh1: &[u8; 32], dh2: &[u8; 32], dh3: &[u8; 32], dh4: Option<&[u8; 32]>) -> Vec<u8> {
    let mut ikm = Vec::with_capacity(32 * 5);
    ikm.extend_from_slice(&padding());
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4);
    }
    ikm
}

fn derive_shared_key(ikm: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut sk = [0u8; 32];
    primitives::hkdf(&salt(), ikm, INFO, &mut sk)?;
    Ok(sk)
}

/// Alice initiates a session with Bob given her identity keypair and Bob's
/// published key bundle.
///
/// Verifies `bundle.signed_prekey_sig` under `bundle.identity_key` first;
/// on failure returns [`CryptoError::InvalidSignedPreKey`] without
/// performing any Diffie-Hellman computation.
pub fn initiate(my_identity: &IdentityKeyPair, bundle: &KeyBundle) -> Result<X3DHResult, CryptoError> {
    let ik_b_ed = bundle.identity_key_bytes()?;
    let spk_b_raw = bundle.signed_prekey_bytes()?;
    let spk_sig = bundle.signed_prekey_sig_bytes()?;

    IdentityKeyPair::verify(&ik_b_ed, &spk_b_raw, &spk_sig).map_err(|_| CryptoError::InvalidSignedPreKey)?;

    let ik_a_x = primitives::ed25519_secret_to_x25519(my_identity.secret_bytes());
    let ik_b_x = primitives::ed25519_pub_to_x25519(&ik_b_ed)?;
    let spk_b = X25519Public::from(spk_b_raw);

    let ek_a = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let dh1 = primitives::dh(&ik_a_x, &spk_b)?;
    let dh2 = primitives::dh(&ek_a, &ik_b_x)?;
    let dh3 = primitives::dh(&ek_a, &spk_b)?;

    let (dh4, used_otp, otp_pub) = match bundle.one_time_prekey_bytes()? {
        Some(otp_raw) => {
            let otp_pub = X25519Public::from(otp_raw);
            let dh4 = primitives::dh(&ek_a, &otp_pub)?;
            (Some(dh4), true, Some(otp_pub))
        }
        None => (None, false, None),
    };

    let mut ikm = build_ikm(&dh1, &dh2, &dh3, dh4.as_ref());
    let shared_key = derive_shared_key(&ikm)?;
    ikm.zeroize();

    let mut ad = [0u8; 64];
    ad[..32].copy_from_slice(&my_identity.public.0);
    ad[32..].copy_from_slice(&ik_b_ed);

    Ok(X3DHResult { shared_key, ad, ephemeral_pub: ek_a_pub, used_otp, otp_pub })
}

/// Bob (responder) reconstructs the shared secret from Alice's identity
/// public key and ephemeral public key, his own signed-prekey secret, and
/// (if Alice's envelope says one was used) the consumed one-time-prekey
/// secret.
pub fn respond(
    my_identity: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_otp_secret: Option<&StaticSecret>,
    their_identity_ed_pub: &[u8; 32],
    their_ephemeral_pub: &X25519Public,
) -> Result<([u8; 32], [u8; 64]), CryptoError> {
    let ik_a_x = primitives::ed25519_pub_to_x25519(their_identity_ed_pub)?;
    let ik_b_x = primitives::ed25519_secret_to_x25519(my_identity.secret_bytes());

    // Mirror Alice's operands: DH1 = IK_A x SPK_B, DH2 = EK_A x IK_B, DH3 = EK_A x SPK_B.
    let dh1 = primitives::dh(my_spk_secret, &ik_a_x)?;
    let dh2 = primitives::dh(&ik_b_x, their_ephemeral_pub)?;
    let dh3 = primitives::dh(my_spk_secret, their_ephemeral_pub)?;

    let dh4 = match my_otp_secret {
        Some(otp_secret) => Some(primitives::dh(otp_secret, their_ephemeral_pub)?),
        None => None,
    };

    let mut ikm = build_ikm(&dh1, &dh2, &dh3, dh4.as_ref());
    let shared_key = derive_shared_key(&ikm)?;
    ikm.zeroize();

    let mut ad = [0u8; 64];
    ad[..32].copy_from_slice(their_identity_ed_pub);
    ad[32..].copy_from_slice(&my_identity.public.0);

    Ok((shared_key, ad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    fn bundle_from(bob_identity: &IdentityKeyPair, spk: &keys::SignedPreKeyPair, otp_pub: Option<&X25519Public>) -> KeyBundle {
        KeyBundle {
            identity_key: primitives::b64_encode(&bob_identity.public.0),
            signed_prekey: primitives::b64_encode(spk.public.as_bytes()),
            signed_prekey_sig: primitives::b64_encode(&spk.signature),
            one_time_prekey: otp_pub.map(|p| primitives::b64_encode(p.as_bytes())),
        }
    }

    #[test]
    fn x3dh_roundtrip_without_otp() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let spk = keys::generate_signed_prekey(&bob_ik).unwrap();
        let bundle = bundle_from(&bob_ik, &spk, None);

        let result = initiate(&alice_ik, &bundle).unwrap();
        assert!(!result.used_otp);

        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let (bob_sk, bob_ad) =
            respond(&bob_ik, &spk.secret, None, &alice_ik_ed, &result.ephemeral_pub).unwrap();

        assert_eq!(result.shared_key, bob_sk);
        assert_eq!(result.ad, bob_ad);
    }

    #[test]
    fn x3dh_roundtrip_with_otp() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let spk = keys::generate_signed_prekey(&bob_ik).unwrap();
        let otps = keys::generate_one_time_prekeys(1);
        let bundle = bundle_from(&bob_ik, &spk, Some(&otps[0].public));

        let result = initiate(&alice_ik, &bundle).unwrap();
        assert!(result.used_otp);
        assert_eq!(result.otp_pub.unwrap().as_bytes(), otps[0].public.as_bytes());

        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let (bob_sk, bob_ad) = respond(
            &bob_ik,
            &spk.secret,
            Some(&otps[0].secret),
            &alice_ik_ed,
            &result.ephemeral_pub,
        )
        .unwrap();

        assert_eq!(result.shared_key, bob_sk);
        assert_eq!(result.ad, bob_ad);
    }

    #[test]
    fn rejects_invalid_spk_signature() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let evil_ik = IdentityKeyPair::generate().unwrap();

        let spk = keys::generate_signed_prekey(&bob_ik).unwrap();
        let evil_sig = evil_ik.sign(spk.public.as_bytes());

        let bundle = KeyBundle {
            identity_key: primitives::b64_encode(&bob_ik.public.0),
            signed_prekey: primitives::b64_encode(spk.public.as_bytes()),
            signed_prekey_sig: primitives::b64_encode(&evil_sig),
            one_time_prekey: None,
        };

        let err = initiate(&alice_ik, &bundle);
        assert!(matches!(err, Err(CryptoError::InvalidSignedPreKey)));
    }

    #[test]
    fn ad_matches_key_conversion_consistency_property() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let spk = keys::generate_signed_prekey(&bob_ik).unwrap();
        let bundle = bundle_from(&bob_ik, &spk, None);

        let result = initiate(&alice_ik, &bundle).unwrap();
        assert_eq!(&result.ad[..32], &alice_ik.public.0[..]);
        assert_eq!(&result.ad[32..], &bob_ik.public.0[..]);
    }
}
