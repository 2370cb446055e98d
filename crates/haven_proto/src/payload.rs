//! Plaintext message payload — what a Double Ratchet or Sender Key envelope
//! decrypts to. This is the only structure the crypto layer ever sees
//! inside a ciphertext; everything else (server message IDs, delivery
//! receipts, typing indicators) lives above the encrypted channel and is
//! out of scope here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub sender_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatting: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link_previews: Vec<LinkPreview>,
}

impl MessagePayload {
    pub fn text(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            text: text.into(),
            attachments: Vec::new(),
            content_type: None,
            formatting: None,
            link_previews: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Reference to an attachment encrypted with
/// `haven_crypto::profile::encrypt_file`. The attachment key and nonce
/// travel inside the payload so only the session's recipients (who already
/// decrypted the envelope) can fetch and decrypt the blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Storage reference (URL or opaque key) for the encrypted blob.
    pub storage_ref: String,
    /// Base64 32-byte secretbox key.
    pub key: String,
    /// Base64 24-byte secretbox nonce.
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkPreview {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}
