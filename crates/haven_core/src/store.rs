//! Persisted-store contract (spec §6). The core is storage-agnostic: it
//! depends only on this trait, never on a concrete database. See
//! `haven_store_sqlite` for a reference SQLite-backed implementation.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store entry not found: {0}")]
    NotFound(String),
}

/// One-time prekey pair as persisted: secret half plus the public half it
/// is indexed and consumed by.
#[derive(Debug, Clone)]
pub struct StoredOneTimePrekey {
    pub secret: [u8; 32],
    pub public: [u8; 32],
}

/// Identity, signed-prekey, one-time-prekey pool, and Double-Ratchet
/// session persistence. Every method is `async` because every real
/// implementation is backed by I/O; the pure crypto layer never appears
/// in this trait's signatures.
///
/// Implementations MUST make `consume_one_time_prekey` atomic: under
/// concurrent inbound initial envelopes targeting the same public key,
/// exactly one caller may observe `Some(..)`.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn save_identity(&self, secret: &[u8; 32]) -> Result<(), StoreError>;
    async fn load_identity(&self) -> Result<Option<[u8; 32]>, StoreError>;

    async fn save_signed_prekey(
        &self,
        secret: &[u8; 32],
        public: &[u8; 32],
        signature: &[u8; 64],
    ) -> Result<(), StoreError>;
    /// Returns `(secret, public, signature)`.
    async fn load_signed_prekey(&self) -> Result<Option<([u8; 32], [u8; 32], [u8; 64])>, StoreError>;

    async fn add_one_time_prekeys(&self, keys: &[StoredOneTimePrekey]) -> Result<(), StoreError>;
    /// Atomic delete-and-return by public key. `Ok(None)` if the key was
    /// never stored or was already consumed.
    async fn consume_one_time_prekey(&self, public: &[u8; 32]) -> Result<Option<[u8; 32]>, StoreError>;
    async fn count_one_time_prekeys(&self) -> Result<u32, StoreError>;

    async fn save_dr_session(&self, peer_id: &str, session_bytes: &[u8]) -> Result<(), StoreError>;
    async fn load_dr_session(&self, peer_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn delete_dr_session(&self, peer_id: &str) -> Result<(), StoreError>;

    /// Persist which peer a DM channel is bound to. `dm_sessions` is keyed
    /// by peer id, not channel id, so the dispatcher needs this mapping to
    /// find a peer's session again after a restart.
    async fn save_channel_peer(&self, channel_id: &str, peer_id: &str) -> Result<(), StoreError>;
    /// The peer id `channel_id` was last bound to, if any.
    async fn load_peer_for_channel(&self, channel_id: &str) -> Result<Option<String>, StoreError>;
}
