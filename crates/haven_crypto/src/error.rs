use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("used before initialisation")]
    NotReady,

    #[error("invalid peer key: {0}")]
    InvalidPeerKey(String),

    #[error("signed prekey signature verification failed")]
    InvalidSignedPreKey,

    #[error("AEAD authentication failed (bad ciphertext)")]
    BadCiphertext,

    #[error("input shorter than required prefix: {0}")]
    Truncated(String),

    #[error("skipped-message-key cache would exceed MAX_SKIP ({0})")]
    TooManySkipped(u64),

    #[error("group envelope chain_index {got} <= stored chain_index {stored}")]
    Replay { got: u64, stored: u64 },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("certificate validation failed: {0}")]
    CertificateValidation(String),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
