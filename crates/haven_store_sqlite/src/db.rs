//! Database abstraction over SQLite via sqlx, and the `PersistentStore`
//! implementation backing it.

use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
    SqlitePool as Pool,
};

use haven_core::store::{PersistentStore, StoreError as CoreStoreError, StoredOneTimePrekey};

use crate::{error::StoreError, vault::Vault};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Central store handle. Cheap to clone (pool and vault are both
/// internally reference-counted).
#[derive(Clone)]
pub struct Store {
    pub pool: Pool,
    pub vault: Vault,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path`.
    /// Runs all pending migrations automatically.
    ///
    /// WAL journal mode and foreign-key enforcement are configured at connection
    /// time here — NOT inside a migration, because SQLite forbids changing
    /// `journal_mode` inside a transaction and sqlx wraps every migration in
    /// one (which produced SQLITE_ERROR code 1 during the first login).
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        Ok(Self { pool, vault })
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    /// Encrypt a plaintext value with the vault key. Returns base64.
    async fn encrypt_value(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        self.vault
            .with_key(|key| {
                let ct = haven_crypto::primitives::aead_encrypt(key, plaintext, b"haven-store-v1")
                    .map_err(StoreError::Crypto)?;
                Ok(B64.encode(ct))
            })
            .await
    }

    /// Decrypt a vault-encrypted value.
    async fn decrypt_value(&self, b64: &str) -> Result<Vec<u8>, StoreError> {
        let ct = B64
            .decode(b64)
            .map_err(|e| StoreError::Crypto(haven_crypto::CryptoError::Base64Decode(e)))?;

        self.vault
            .with_key(|key| {
                haven_crypto::primitives::aead_decrypt(key, &ct, b"haven-store-v1")
                    .map_err(StoreError::Crypto)
            })
            .await
    }
}

#[async_trait]
impl PersistentStore for Store {
    async fn save_identity(&self, secret: &[u8; 32]) -> Result<(), CoreStoreError> {
        let enc = self.encrypt_value(secret).await?;
        sqlx::query(
            "INSERT INTO identity (id, secret_enc) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET secret_enc = excluded.secret_enc",
        )
        .bind(&enc)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn load_identity(&self) -> Result<Option<[u8; 32]>, CoreStoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT secret_enc FROM identity WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

        let Some((enc,)) = row else {
            return Ok(None);
        };
        let plaintext = self.decrypt_value(&enc).await?;
        let secret: [u8; 32] = plaintext
            .try_into()
            .map_err(|_| CoreStoreError::Backend("stored identity secret is not 32 bytes".into()))?;
        Ok(Some(secret))
    }

    async fn save_signed_prekey(
        &self,
        secret: &[u8; 32],
        public: &[u8; 32],
        signature: &[u8; 64],
    ) -> Result<(), CoreStoreError> {
        let enc = self.encrypt_value(secret).await?;
        sqlx::query(
            "INSERT INTO signed_prekey (id, secret_enc, public, signature) VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET secret_enc = excluded.secret_enc,
                                           public = excluded.public,
                                           signature = excluded.signature",
        )
        .bind(&enc)
        .bind(&public[..])
        .bind(&signature[..])
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn load_signed_prekey(
        &self,
    ) -> Result<Option<([u8; 32], [u8; 32], [u8; 64])>, CoreStoreError> {
        let row: Option<(String, Vec<u8>, Vec<u8>)> = sqlx::query_as(
            "SELECT secret_enc, public, signature FROM signed_prekey WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let Some((enc, public, signature)) = row else {
            return Ok(None);
        };
        let secret_bytes = self.decrypt_value(&enc).await?;
        let secret: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CoreStoreError::Backend("stored signed-prekey secret is not 32 bytes".into()))?;
        let public: [u8; 32] = public
            .try_into()
            .map_err(|_| CoreStoreError::Backend("stored signed-prekey public is not 32 bytes".into()))?;
        let signature: [u8; 64] = signature
            .try_into()
            .map_err(|_| CoreStoreError::Backend("stored signed-prekey signature is not 64 bytes".into()))?;
        Ok(Some((secret, public, signature)))
    }

    async fn add_one_time_prekeys(&self, keys: &[StoredOneTimePrekey]) -> Result<(), CoreStoreError> {
        for key in keys {
            let enc = self.encrypt_value(&key.secret).await?;
            sqlx::query(
                "INSERT INTO one_time_prekeys (public, secret_enc) VALUES (?, ?)
                 ON CONFLICT(public) DO NOTHING",
            )
            .bind(&key.public[..])
            .bind(&enc)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        }
        Ok(())
    }

    async fn consume_one_time_prekey(&self, public: &[u8; 32]) -> Result<Option<[u8; 32]>, CoreStoreError> {
        // DELETE ... RETURNING is atomic: under concurrent callers racing on
        // the same public key, exactly one caller observes the row.
        let row: Option<(String,)> = sqlx::query_as(
            "DELETE FROM one_time_prekeys WHERE public = ? RETURNING secret_enc",
        )
        .bind(&public[..])
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        let Some((enc,)) = row else {
            return Ok(None);
        };
        let plaintext = self.decrypt_value(&enc).await?;
        let secret: [u8; 32] = plaintext
            .try_into()
            .map_err(|_| CoreStoreError::Backend("stored one-time-prekey secret is not 32 bytes".into()))?;
        Ok(Some(secret))
    }

    async fn count_one_time_prekeys(&self) -> Result<u32, CoreStoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM one_time_prekeys")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(count as u32)
    }

    async fn save_dr_session(&self, peer_id: &str, session_bytes: &[u8]) -> Result<(), CoreStoreError> {
        let enc = self.encrypt_value(session_bytes).await?;
        sqlx::query(
            "INSERT INTO dr_sessions (peer_id, session_enc, updated_at) VALUES (?, ?, datetime('now'))
             ON CONFLICT(peer_id) DO UPDATE SET session_enc = excluded.session_enc,
                                                updated_at = excluded.updated_at",
        )
        .bind(peer_id)
        .bind(&enc)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn load_dr_session(&self, peer_id: &str) -> Result<Option<Vec<u8>>, CoreStoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT session_enc FROM dr_sessions WHERE peer_id = ?")
                .bind(peer_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)?;

        let Some((enc,)) = row else {
            return Ok(None);
        };
        Ok(Some(self.decrypt_value(&enc).await?))
    }

    async fn delete_dr_session(&self, peer_id: &str) -> Result<(), CoreStoreError> {
        sqlx::query("DELETE FROM dr_sessions WHERE peer_id = ?")
            .bind(peer_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn save_channel_peer(&self, channel_id: &str, peer_id: &str) -> Result<(), CoreStoreError> {
        sqlx::query(
            "INSERT INTO channel_peers (channel_id, peer_id, updated_at) VALUES (?, ?, datetime('now'))
             ON CONFLICT(channel_id) DO UPDATE SET peer_id = excluded.peer_id,
                                                    updated_at = excluded.updated_at",
        )
        .bind(channel_id)
        .bind(peer_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    async fn load_peer_for_channel(&self, channel_id: &str) -> Result<Option<String>, CoreStoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT peer_id FROM channel_peers WHERE channel_id = ?")
                .bind(channel_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::from)?;
        Ok(row.map(|(peer_id,)| peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_crypto::keys::{generate_identity, generate_one_time_prekeys};
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn open_test_store() -> (Store, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/haven-store-test-{}.db", Uuid::new_v4()));
        let vault = Vault::new();
        vault.unlock(b"correct horse battery staple", &[7u8; 16]).await.unwrap();
        let store = Store::open(&db_path, vault).await.expect("open store");
        (store, db_path)
    }

    fn cleanup(db_path: &PathBuf) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn identity_round_trip() {
        let (store, db_path) = open_test_store().await;

        assert!(store.load_identity().await.unwrap().is_none());

        let identity = generate_identity().unwrap();
        let secret: [u8; 32] = identity.secret_bytes().to_owned();
        store.save_identity(&secret).await.unwrap();

        let loaded = store.load_identity().await.unwrap().unwrap();
        assert_eq!(loaded, secret);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn one_time_prekey_consume_is_exactly_once() {
        let (store, db_path) = open_test_store().await;

        let prekeys = generate_one_time_prekeys(3);
        let stored: Vec<StoredOneTimePrekey> = prekeys
            .iter()
            .map(|p| StoredOneTimePrekey {
                secret: p.secret.to_bytes(),
                public: *p.public.as_bytes(),
            })
            .collect();
        store.add_one_time_prekeys(&stored).await.unwrap();
        assert_eq!(store.count_one_time_prekeys().await.unwrap(), 3);

        let target = stored[0].public;
        let consumed = store.consume_one_time_prekey(&target).await.unwrap();
        assert_eq!(consumed, Some(stored[0].secret));

        // Second consume of the same public key must return None — it was
        // already deleted.
        let consumed_again = store.consume_one_time_prekey(&target).await.unwrap();
        assert!(consumed_again.is_none());

        assert_eq!(store.count_one_time_prekeys().await.unwrap(), 2);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn dr_session_round_trip_and_delete() {
        let (store, db_path) = open_test_store().await;

        assert!(store.load_dr_session("bob").await.unwrap().is_none());

        let blob = b"serialized ratchet session bytes".to_vec();
        store.save_dr_session("bob", &blob).await.unwrap();
        assert_eq!(store.load_dr_session("bob").await.unwrap(), Some(blob.clone()));

        // Two independent peers don't collide.
        store.save_dr_session("carol", b"other session").await.unwrap();
        assert_eq!(store.load_dr_session("bob").await.unwrap(), Some(blob));

        store.delete_dr_session("bob").await.unwrap();
        assert!(store.load_dr_session("bob").await.unwrap().is_none());
        assert!(store.load_dr_session("carol").await.unwrap().is_some());

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn channel_peer_round_trip() {
        let (store, db_path) = open_test_store().await;

        assert!(store.load_peer_for_channel("dm-1").await.unwrap().is_none());

        store.save_channel_peer("dm-1", "bob").await.unwrap();
        assert_eq!(store.load_peer_for_channel("dm-1").await.unwrap(), Some("bob".to_string()));

        // Rebinding the same channel (e.g. a rejoin) overwrites, not duplicates.
        store.save_channel_peer("dm-1", "carol").await.unwrap();
        assert_eq!(store.load_peer_for_channel("dm-1").await.unwrap(), Some("carol".to_string()));

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn dr_session_and_channel_peer_survive_reopen() {
        let db_path = PathBuf::from(format!("/tmp/haven-store-test-{}.db", Uuid::new_v4()));
        let vault = Vault::new();
        vault.unlock(b"correct horse battery staple", &[7u8; 16]).await.unwrap();
        let store = Store::open(&db_path, vault).await.expect("open store");

        store.save_channel_peer("dm-1", "bob").await.unwrap();
        store.save_dr_session("bob", b"serialized ratchet session bytes").await.unwrap();

        // A fresh `Store::open` against the same file models a process
        // restart: the dispatcher must be able to resume from here.
        let vault2 = Vault::new();
        vault2.unlock(b"correct horse battery staple", &[7u8; 16]).await.unwrap();
        let reopened = Store::open(&db_path, vault2).await.expect("reopen store");

        assert_eq!(reopened.load_peer_for_channel("dm-1").await.unwrap(), Some("bob".to_string()));
        assert_eq!(
            reopened.load_dr_session("bob").await.unwrap(),
            Some(b"serialized ratchet session bytes".to_vec())
        );

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn operations_fail_while_vault_locked() {
        let db_path = PathBuf::from(format!("/tmp/haven-store-test-{}.db", Uuid::new_v4()));
        let vault = Vault::new();
        let store = Store::open(&db_path, vault).await.expect("open store");

        let err = store.save_identity(&[1u8; 32]).await.unwrap_err();
        assert!(matches!(err, CoreStoreError::Backend(_)));

        cleanup(&db_path);
    }
}
