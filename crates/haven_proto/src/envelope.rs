//! Binary wire envelope — what travels between clients through the relay.
//!
//! The relay is a DUMB RELAY: it only ever sees `channel_id`,
//! `sender_token`, and the opaque `encrypted_body` bytes below, base64-
//! encoded into the server message model (see `crate::api::ServerMessage`).
//! It never sees envelope type, plaintext, or any Double-Ratchet/Sender-Key
//! state.
//!
//! Four envelope types, single discriminant byte first:
//!
//! | Type   | Bytes 1..N |
//! |--------|------------|
//! | `0x00` | `payload_json_bytes` (legacy cleartext, receive-only) |
//! | `0x01` | `sender_identity_ed_pub[32] ‖ sender_ephemeral_x_pub[32] ‖ used_otp[1] ‖ (opt otp_pub[32]) ‖ DR_serialized_message` |
//! | `0x02` | `DR_serialized_message` |
//! | `0x03` | `distribution_id[16] ‖ chain_index u32 LE ‖ nonce[24] ‖ aead_ciphertext_with_tag` |
//!
//! `DR_serialized_message` is `dh_pub[32] ‖ pn u32 BE ‖ n u32 BE ‖
//! aead_ciphertext_with_tag` — the same layout as
//! [`haven_crypto::ratchet::RatchetHeader::to_bytes`] with the ciphertext
//! appended. All multi-byte integers are little-endian except where the
//! layout above states BE (the DR header keeps the big-endian convention
//! `haven_crypto::ratchet` already uses internally).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use haven_crypto::ratchet::RatchetHeader;

const TYPE_LEGACY_CLEARTEXT: u8 = 0x00;
const TYPE_DM_INITIAL: u8 = 0x01;
const TYPE_DM_FOLLOW_UP: u8 = 0x02;
const TYPE_GROUP: u8 = 0x03;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unknown envelope type byte {0:#04x}")]
    UnknownType(u8),
    #[error("envelope truncated: {0}")]
    Truncated(String),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A Double-Ratchet-serialized ciphertext: header plus AEAD body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrMessage {
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
}

impl DrMessage {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40 + self.ciphertext.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < 40 {
            return Err(EnvelopeError::Truncated("DR message shorter than 40-byte header".into()));
        }
        let (header_bytes, ciphertext) = bytes.split_at(40);
        let header = RatchetHeader::from_bytes(header_bytes)
            .map_err(|e| EnvelopeError::Truncated(e.to_string()))?;
        Ok(Self { header, ciphertext: ciphertext.to_vec() })
    }
}

/// A decoded wire envelope. `Envelope::decode`/`encode` are the only place
/// the binary layout above is implemented; every dispatcher call goes
/// through these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Unencrypted JSON payload. Caller-configurable whether to accept
    /// these at all (see `HavenConfig::accept_legacy_cleartext`).
    LegacyCleartext(Vec<u8>),
    /// First message on a new DM session: carries the X3DH handshake
    /// material plus the first Double-Ratchet message.
    DmInitial {
        sender_identity_ed_pub: [u8; 32],
        sender_ephemeral_x_pub: [u8; 32],
        used_otp: bool,
        otp_pub: Option<[u8; 32]>,
        message: DrMessage,
    },
    /// Any subsequent message on an established DM session.
    DmFollowUp { message: DrMessage },
    /// A Sender-Key-encrypted group/channel message.
    Group {
        distribution_id: [u8; 16],
        chain_index: u32,
        nonce: [u8; 24],
        ciphertext: Vec<u8>,
    },
}

impl Envelope {
    pub fn type_byte(&self) -> u8 {
        match self {
            Envelope::LegacyCleartext(_) => TYPE_LEGACY_CLEARTEXT,
            Envelope::DmInitial { .. } => TYPE_DM_INITIAL,
            Envelope::DmFollowUp { .. } => TYPE_DM_FOLLOW_UP,
            Envelope::Group { .. } => TYPE_GROUP,
        }
    }

    /// Serialize to the exact binary wire layout (discriminant byte first).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.type_byte()];
        match self {
            Envelope::LegacyCleartext(payload) => out.extend_from_slice(payload),
            Envelope::DmInitial { sender_identity_ed_pub, sender_ephemeral_x_pub, used_otp, otp_pub, message } => {
                out.extend_from_slice(sender_identity_ed_pub);
                out.extend_from_slice(sender_ephemeral_x_pub);
                out.push(if *used_otp { 1 } else { 0 });
                if let Some(otp) = otp_pub {
                    out.extend_from_slice(otp);
                }
                out.extend_from_slice(&message.encode());
            }
            Envelope::DmFollowUp { message } => out.extend_from_slice(&message.encode()),
            Envelope::Group { distribution_id, chain_index, nonce, ciphertext } => {
                out.extend_from_slice(distribution_id);
                out.extend_from_slice(&chain_index.to_le_bytes());
                out.extend_from_slice(nonce);
                out.extend_from_slice(ciphertext);
            }
        }
        out
    }

    /// Parse a binary wire envelope (discriminant byte first).
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let (&type_byte, rest) = bytes
            .split_first()
            .ok_or_else(|| EnvelopeError::Truncated("envelope is empty".into()))?;
        match type_byte {
            TYPE_LEGACY_CLEARTEXT => Ok(Envelope::LegacyCleartext(rest.to_vec())),
            TYPE_DM_INITIAL => {
                if rest.len() < 65 {
                    return Err(EnvelopeError::Truncated("DM-initial envelope shorter than fixed prefix".into()));
                }
                let sender_identity_ed_pub: [u8; 32] = rest[0..32].try_into().unwrap();
                let sender_ephemeral_x_pub: [u8; 32] = rest[32..64].try_into().unwrap();
                let used_otp = rest[64] != 0;
                let mut cursor = 65;
                let otp_pub = if used_otp {
                    if rest.len() < cursor + 32 {
                        return Err(EnvelopeError::Truncated("DM-initial envelope missing OTP public key".into()));
                    }
                    let otp: [u8; 32] = rest[cursor..cursor + 32].try_into().unwrap();
                    cursor += 32;
                    Some(otp)
                } else {
                    None
                };
                let message = DrMessage::decode(&rest[cursor..])?;
                Ok(Envelope::DmInitial { sender_identity_ed_pub, sender_ephemeral_x_pub, used_otp, otp_pub, message })
            }
            TYPE_DM_FOLLOW_UP => Ok(Envelope::DmFollowUp { message: DrMessage::decode(rest)? }),
            TYPE_GROUP => {
                if rest.len() < 16 + 4 + 24 {
                    return Err(EnvelopeError::Truncated("group envelope shorter than fixed prefix".into()));
                }
                let distribution_id: [u8; 16] = rest[0..16].try_into().unwrap();
                let chain_index = u32::from_le_bytes(rest[16..20].try_into().unwrap());
                let nonce: [u8; 24] = rest[20..44].try_into().unwrap();
                let ciphertext = rest[44..].to_vec();
                Ok(Envelope::Group { distribution_id, chain_index, nonce, ciphertext })
            }
            other => Err(EnvelopeError::UnknownType(other)),
        }
    }

    /// Base64-encode the wire bytes for the `encrypted_body` field of the
    /// server message model (standard, padded alphabet).
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.encode())
    }

    pub fn from_base64(s: &str) -> Result<Self, EnvelopeError> {
        let bytes = STANDARD.decode(s)?;
        Self::decode(&bytes)
    }
}
