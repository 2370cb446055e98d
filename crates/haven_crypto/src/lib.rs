//! haven_crypto — end-to-end encryption core for Haven
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - All public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `primitives`        — HKDF/HMAC, AEAD (XChaCha20-Poly1305), secretbox (XSalsa20-Poly1305),
//!                          Ed25519↔X25519 conversion, sealed-box anonymous encryption
//! - `identity`          — long-term Ed25519 identity + device keys + device certificates
//! - `keys`              — signed prekeys, one-time prekeys, key bundles, profile keys
//! - `x3dh`              — X3DH asynchronous key agreement (SPK verification, proper DH)
//! - `ratchet`           — full Double Ratchet with DH ratchet steps + skipped message keys
//! - `sender_keys`       — Signal-style Sender Keys for group/channel fan-out
//! - `profile`           — profile/file/backup AEAD
//! - `kdf`               — Argon2id password-based key derivation
//! - `error`             — unified error type

pub mod error;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod primitives;
pub mod profile;
pub mod ratchet;
pub mod sender_keys;
pub mod x3dh;

pub use error::CryptoError;
