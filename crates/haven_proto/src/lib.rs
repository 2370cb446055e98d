//! haven_proto — Wire types, envelopes, and serialisation for Haven's
//! secure channel.
//!
//! All on-wire types are serialised to JSON and base64-wrapped; nothing
//! here touches the network or the crypto primitives directly.
//!
//! # Modules
//! - `envelope` — Encrypted message envelope (what the relay sees)
//! - `payload`  — Plaintext message payload (inside the encrypted envelope)
//! - `codec`    — Padding, batching, and wire framing
//! - `api`      — API request/response types shared between clients and services

pub mod api;
pub mod codec;
pub mod envelope;
pub mod payload;

pub use codec::{BatchingMode, PaddingMode};
pub use envelope::Envelope;
pub use payload::{Attachment, LinkPreview, MessagePayload};
