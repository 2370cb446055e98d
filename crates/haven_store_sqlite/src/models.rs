//! Database row models — these map to/from the tables in `migrations/`,
//! one per facet of the `PersistentStore` contract.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdentityRow {
    pub id: i64,
    /// Vault-encrypted Ed25519 identity secret key, base64.
    pub secret_enc: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignedPrekeyRow {
    pub id: i64,
    /// Vault-encrypted X25519 secret key, base64.
    pub secret_enc: String,
    pub public: Vec<u8>,
    pub signature: Vec<u8>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimePrekeyRow {
    pub public: Vec<u8>,
    /// Vault-encrypted X25519 secret key, base64.
    pub secret_enc: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DrSessionRow {
    pub peer_id: String,
    /// Vault-encrypted, serialized `RatchetSession`, base64.
    pub session_enc: String,
    pub updated_at: String,
}
