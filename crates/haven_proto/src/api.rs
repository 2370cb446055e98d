//! REST request/response shapes the core consumes through
//! [`crate::client::ApiClient`] (or an embedder's own HTTP client). Base64
//! strings throughout, using the wire alphabet in
//! `haven_crypto::primitives::b64_encode`.
//!
//! The core never talks to a socket directly — these are just the payload
//! shapes an implementation of `ApiClient` sends and parses.

use serde::{Deserialize, Serialize};

/// A published key bundle, as returned by a "fetch key bundle for user"
/// endpoint. Mirrors [`haven_crypto::keys::KeyBundle`] on the wire; kept as
/// a separate type here so the protocol crate has no dependency on the
/// crypto crate's internal representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBundleResponse {
    pub identity_key: String,
    pub signed_prekey: String,
    pub signed_prekey_sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<String>,
}

/// Upload a fresh batch of one-time prekeys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPrekeysRequest {
    pub prekeys: Vec<String>,
}

/// How many one-time prekeys the server still holds for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyCountResponse {
    pub count: u32,
    pub needs_replenishment: bool,
}

/// One entry in a channel's member list, used to target SKDM distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMemberKey {
    pub user_id: String,
    pub identity_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMemberKeysResponse {
    pub members: Vec<ChannelMemberKey>,
}

/// One SKDM addressed to a single channel member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkdmDistribution {
    pub to_user_id: String,
    /// Hex-encoded 16-byte distribution id.
    pub distribution_id: String,
    /// Sealed-box ciphertext, base64.
    pub encrypted_skdm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributeSkdmsRequest {
    pub channel_id: String,
    pub distributions: Vec<SkdmDistribution>,
}

/// A pending SKDM addressed to us, as returned by the "fetch pending SKDMs
/// for a channel" endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSkdm {
    pub from_user_id: String,
    pub distribution_id: String,
    pub encrypted_skdm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSkdmsResponse {
    pub pending: Vec<PendingSkdm>,
}

/// Send a previously-encoded wire envelope to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub channel_id: String,
    /// Fresh random per-message token, opaque to the server; generated by
    /// the dispatcher so the server cannot correlate envelopes by sender.
    pub sender_token: String,
    /// Base64-encoded wire envelope (`haven_proto::envelope`).
    pub encrypted_body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub envelope_id: String,
}

/// A server message as delivered by the realtime push channel or returned
/// from a poll/history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    pub envelope_id: String,
    pub channel_id: String,
    pub sender_token: String,
    pub encrypted_body: String,
}
