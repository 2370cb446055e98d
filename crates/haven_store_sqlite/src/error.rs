use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("vault is locked — unlock with password first")]
    VaultLocked,

    #[error("crypto error: {0}")]
    Crypto(#[from] haven_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("migration error: {0}")]
    Migration(String),
}

/// Maps this crate's richer error into the contract-level error that
/// `haven_core::store::PersistentStore` signatures speak.
impl From<StoreError> for haven_core::store::StoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => haven_core::store::StoreError::NotFound(what),
            other => haven_core::store::StoreError::Backend(other.to_string()),
        }
    }
}
