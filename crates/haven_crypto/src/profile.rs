//! Profile, file, and backup encryption.
//!
//! These are the "offline" AEAD uses: encrypting a profile blob under a
//! symmetric [`ProfileKey`] that is itself distributed to contacts via
//! [`crate::primitives::seal`]/[`crate::primitives::unseal`], encrypting
//! attachments under a fresh per-file key, and deriving a passphrase-based
//! key for local session backups.

use crate::error::CryptoError;
use crate::kdf;
use crate::primitives;

/// Encrypt a JSON-serialisable profile payload under `profile_key`.
/// Wire format: `nonce(24) ‖ ciphertext+tag`.
pub fn encrypt_profile(profile_key: &[u8; 32], fields_json: &[u8]) -> Result<Vec<u8>, CryptoError> {
    primitives::aead_encrypt(profile_key, fields_json, b"")
}

/// Inverse of [`encrypt_profile`]. Rejects inputs shorter than the 24-byte
/// nonce with [`CryptoError::Truncated`].
pub fn decrypt_profile(profile_key: &[u8; 32], wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wire.len() < 24 {
        return Err(CryptoError::Truncated("profile ciphertext shorter than nonce".into()));
    }
    primitives::aead_decrypt(profile_key, wire, b"")
}

/// Seal a profile key to a contact's Ed25519 identity public key so only
/// they can recover it.
pub fn encrypt_profile_key_for(profile_key: &[u8; 32], recipient_identity_ed_pub: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    let recipient_x = primitives::ed25519_pub_to_x25519(recipient_identity_ed_pub)?;
    primitives::seal(&recipient_x, profile_key)
}

/// Recover a profile key sealed with [`encrypt_profile_key_for`].
pub fn decrypt_profile_key(my_identity_ed_secret: &[u8; 32], sealed: &[u8]) -> Result<[u8; 32], CryptoError> {
    let my_x_secret = primitives::ed25519_secret_to_x25519(my_identity_ed_secret);
    let plaintext = primitives::unseal(&my_x_secret, sealed)?;
    plaintext
        .try_into()
        .map_err(|_| CryptoError::Truncated("unsealed profile key is not 32 bytes".into()))
}

/// Result of [`encrypt_file`]: a fresh random key and nonce, plus the
/// ciphertext. The key and nonce travel alongside (or ahead of) the
/// ciphertext via whatever channel the caller uses for attachment metadata.
pub struct EncryptedFile {
    pub ct: Vec<u8>,
    pub key: [u8; 32],
    pub nonce: [u8; 24],
}

/// Encrypt attachment bytes under a fresh random key (secretbox).
pub fn encrypt_file(plaintext: &[u8]) -> Result<EncryptedFile, CryptoError> {
    let key = primitives::random_32();
    let nonce = primitives::random_24();
    let ct = primitives::secretbox_encrypt_with_nonce(&key, &nonce, plaintext, b"")?;
    Ok(EncryptedFile { ct, key, nonce })
}

/// Inverse of [`encrypt_file`].
pub fn decrypt_file(ct: &[u8], key: &[u8; 32], nonce: &[u8; 24]) -> Result<Vec<u8>, CryptoError> {
    primitives::secretbox_decrypt_with_nonce(key, nonce, ct, b"")
}

/// Derive a 32-byte backup key from a passphrase and salt using the same
/// interactive-profile Argon2id parameters as the local vault key.
pub fn derive_backup_key(passphrase: &[u8], salt: &[u8; 16]) -> Result<[u8; 32], CryptoError> {
    let vault_key = kdf::vault_key_from_password(passphrase, salt)?;
    Ok(vault_key.0)
}

/// Encrypt an opaque backup payload (e.g. a serialized session set) under a
/// backup key (secretbox, random nonce).
pub fn encrypt_backup(payload: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
    primitives::secretbox_encrypt(key, payload)
}

/// Inverse of [`encrypt_backup`].
pub fn decrypt_backup(key: &[u8; 32], wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
    primitives::secretbox_decrypt(key, wire)
}
