//! haven_store_sqlite — reference `PersistentStore` implementation backed
//! by SQLite.
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. We use application-level encryption:
//! - Every secret half persisted here (identity key, signed-prekey secret,
//!   one-time-prekey secrets, serialized ratchet sessions) is stored as
//!   XChaCha20-Poly1305 ciphertext under the vault key, base64-encoded.
//! - The vault key is derived from the user password via Argon2id and held
//!   in memory only while the vault is unlocked.
//! - Non-sensitive metadata (public keys, peer IDs, timestamps) is stored
//!   in plaintext to allow indexed lookups.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on first open.
//!
//! [`Store`] implements `haven_core::store::PersistentStore`; nothing in
//! `haven_core` depends on this crate directly — an embedding application
//! wires the two together.

pub mod db;
pub mod models;
pub mod vault;
pub mod error;

pub use db::Store;
pub use vault::Vault;
pub use error::StoreError;
