//! Session dispatcher (spec §4.H): routes plaintext to the Double Ratchet
//! or Sender Keys subsystem, lazily establishing sessions and sender-key
//! distributions as needed, and keeps the in-process caches in
//! `crate::cache` consistent with the persisted store.
//!
//! The only suspension points are the I/O calls through `ApiClient` and
//! `PersistentStore`; every state transition in between runs synchronously
//! under the per-key lock it was fetched from.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use haven_crypto::identity::IdentityKeyPair;
use haven_crypto::keys::KeyBundle;
use haven_crypto::primitives;
use haven_crypto::ratchet::RatchetSession;
use haven_crypto::sender_keys::{self, ReceivedSenderKey, SenderKeyState};
use haven_crypto::x3dh;
use haven_crypto::CryptoError;
use haven_proto::api::{
    ChannelMemberKeysResponse, DistributeSkdmsRequest, SendMessageRequest, SendMessageResponse,
    ServerMessage, SkdmDistribution,
};
use haven_proto::envelope::{DrMessage, Envelope};
use haven_proto::payload::MessagePayload;

use crate::api::ApiClient;
use crate::cache::{DispatcherState, PendingInitial};
use crate::config::HavenConfig;
use crate::error::CoreError;
use crate::store::PersistentStore;

/// Owns the dispatcher caches plus this device's long-term key material.
/// Constructed once at login (after the persistent store is opened) and
/// dropped at logout, zeroizing every secret it holds.
pub struct Dispatcher<A: ApiClient, S: PersistentStore> {
    api: A,
    store: S,
    config: HavenConfig,
    state: DispatcherState,
    identity: IdentityKeyPair,
    spk_secret: StaticSecret,
    spk_public: X25519Public,
}

impl<A: ApiClient, S: PersistentStore> Dispatcher<A, S> {
    /// Loads the device identity and signed prekey from `store`. Fails
    /// with `CryptoError::NotReady` if registration hasn't happened yet.
    pub async fn new(api: A, store: S, config: HavenConfig) -> Result<Self, CoreError> {
        let identity_secret = store.load_identity().await?.ok_or(CryptoError::NotReady)?;
        let identity = IdentityKeyPair::from_bytes(&identity_secret)?;

        let (spk_secret_bytes, spk_public_bytes, _sig) =
            store.load_signed_prekey().await?.ok_or(CryptoError::NotReady)?;
        let spk_secret = StaticSecret::from(spk_secret_bytes);
        let spk_public = X25519Public::from(spk_public_bytes);

        Ok(Self {
            api,
            store,
            config,
            state: DispatcherState::new(),
            identity,
            spk_secret,
            spk_public,
        })
    }

    pub fn config(&self) -> &HavenConfig {
        &self.config
    }

    /// Resolve `channel_id` to its bound peer id, consulting the in-process
    /// cache first and falling back to the persisted association on a miss
    /// (e.g. the first call after a restart). Hydrates the cache on a store
    /// hit so later calls in this process stay in memory.
    async fn resolve_channel_peer(&self, channel_id: &str) -> Result<Option<String>, CoreError> {
        if let Some(peer_id) = self.state.channel_to_peer.lock().await.get(channel_id).cloned() {
            return Ok(Some(peer_id));
        }
        match self.store.load_peer_for_channel(channel_id).await? {
            Some(peer_id) => {
                self.state.channel_to_peer.lock().await.insert(channel_id.to_string(), peer_id.clone());
                Ok(Some(peer_id))
            }
            None => Ok(None),
        }
    }

    /// Bind `channel_id` to `peer_id`, in memory and in the store, so the
    /// association survives a restart.
    async fn remember_channel_peer(&self, channel_id: &str, peer_id: &str) -> Result<(), CoreError> {
        self.state.channel_to_peer.lock().await.insert(channel_id.to_string(), peer_id.to_string());
        self.store.save_channel_peer(channel_id, peer_id).await?;
        Ok(())
    }

    /// Resolve a Double Ratchet session for `peer_id`, consulting the
    /// in-process cache first and falling back to the persisted session on
    /// a miss. Hydrates the cache on a store hit, so a process that
    /// restarted mid-conversation resumes the existing ratchet instead of
    /// reporting no session.
    async fn hydrate_dm_session(&self, peer_id: &str) -> Result<Option<Arc<Mutex<RatchetSession>>>, CoreError> {
        if let Some(session_arc) = self.state.dm_sessions.lock().await.get(peer_id).cloned() {
            return Ok(Some(session_arc));
        }
        match self.store.load_dr_session(peer_id).await? {
            Some(bytes) => {
                let session = RatchetSession::deserialize_session(&bytes)?;
                let session_arc = Arc::new(Mutex::new(session));
                self.state.dm_sessions.lock().await.insert(peer_id.to_string(), session_arc.clone());
                Ok(Some(session_arc))
            }
            None => Ok(None),
        }
    }

    /// Lazily establish an outbound DM session for `channel_id` with
    /// `peer_id` if one doesn't already exist: fetches the peer's key
    /// bundle, runs the X3DH initiator steps, and performs Alice's first
    /// DH ratchet step. Idempotent — a second call for an already
    /// established channel (in memory or persisted from an earlier run)
    /// just re-registers the channel mapping.
    #[instrument(skip(self))]
    pub async fn ensure_dm_session(&self, channel_id: &str, peer_id: &str) -> Result<(), CoreError> {
        let already_established = self.hydrate_dm_session(peer_id).await?.is_some();
        if already_established {
            self.remember_channel_peer(channel_id, peer_id).await?;
            return Ok(());
        }

        let bundle = self.api.fetch_key_bundle(peer_id).await?;
        let crypto_bundle = KeyBundle {
            identity_key: bundle.identity_key,
            signed_prekey: bundle.signed_prekey,
            signed_prekey_sig: bundle.signed_prekey_sig,
            one_time_prekey: bundle.one_time_prekey,
        };

        let result = x3dh::initiate(&self.identity, &crypto_bundle)?;
        let bob_spk_pub = X25519Public::from(crypto_bundle.signed_prekey_bytes()?);
        let session = RatchetSession::init_alice(result.shared_key, result.ad, &bob_spk_pub)?;

        let identity_ed_pub: [u8; 32] = self
            .identity
            .public
            .0
            .clone()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity public key must be 32 bytes".into()))?;

        self.store
            .save_dr_session(peer_id, &session.serialize_session())
            .await?;
        self.state
            .dm_sessions
            .lock()
            .await
            .insert(peer_id.to_string(), Arc::new(Mutex::new(session)));
        self.state.dm_ad.lock().await.insert(peer_id.to_string(), result.ad);
        self.remember_channel_peer(channel_id, peer_id).await?;
        self.state.pending_initial.lock().await.insert(
            peer_id.to_string(),
            PendingInitial {
                identity_ed_pub,
                ephemeral_pub: result.ephemeral_pub,
                used_otp: result.used_otp,
                otp_pub: result.otp_pub,
            },
        );

        debug!(channel_id, peer_id, "established outbound DM session via X3DH");
        Ok(())
    }

    /// Encrypt `payload` for `channel_id` and send it. Routes to the
    /// Double Ratchet if `channel_id` already has a registered DM peer
    /// (see [`Self::ensure_dm_session`]), otherwise to Sender Keys.
    #[instrument(skip(self, payload))]
    pub async fn encrypt_outgoing(
        &self,
        channel_id: &str,
        payload: &MessagePayload,
    ) -> Result<SendMessageResponse, CoreError> {
        let sender_token = STANDARD.encode(primitives::random_32());
        let plaintext = payload.to_json()?;

        let peer_id = self.resolve_channel_peer(channel_id).await?;
        let session_arc = match &peer_id {
            Some(peer_id) => self.hydrate_dm_session(peer_id).await?,
            None => None,
        };

        let envelope = match (peer_id, session_arc) {
            (Some(peer_id), Some(session_arc)) => {
                let pending = self.state.pending_initial.lock().await.remove(&peer_id);
                let mut session = session_arc.lock().await;
                let (header, ciphertext) = session.encrypt_step(&plaintext)?;
                self.store
                    .save_dr_session(&peer_id, &session.serialize_session())
                    .await?;
                let message = DrMessage { header, ciphertext };
                match pending {
                    Some(p) => Envelope::DmInitial {
                        sender_identity_ed_pub: p.identity_ed_pub,
                        sender_ephemeral_x_pub: *p.ephemeral_pub.as_bytes(),
                        used_otp: p.used_otp,
                        otp_pub: p.otp_pub.map(|k| *k.as_bytes()),
                        message,
                    },
                    None => Envelope::DmFollowUp { message },
                }
            }
            _ => {
                self.ensure_sender_key_distributed(channel_id).await?;
                let chain_arc = self
                    .state
                    .my_sender_keys
                    .lock()
                    .await
                    .get(channel_id)
                    .cloned()
                    .expect("ensure_sender_key_distributed populates this entry");
                let mut chain = chain_arc.lock().await;
                let (chain_index, nonce, ciphertext) = chain.sender_key_encrypt(&plaintext)?;
                let distribution_id = chain.distribution_id().expect("distributed chain always has an id");
                Envelope::Group { distribution_id, chain_index, nonce, ciphertext }
            }
        };

        let response = self
            .api
            .send_message(SendMessageRequest {
                channel_id: channel_id.to_string(),
                sender_token,
                encrypted_body: envelope.to_base64(),
            })
            .await?;
        Ok(response)
    }

    /// Generate (if needed) and distribute this device's sender key for
    /// `channel_id` to every other channel member. A no-op once already
    /// distributed.
    #[instrument(skip(self))]
    pub async fn ensure_sender_key_distributed(&self, channel_id: &str) -> Result<(), CoreError> {
        let chain_arc = {
            let mut chains = self.state.my_sender_keys.lock().await;
            chains
                .entry(channel_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SenderKeyState::new())))
                .clone()
        };

        let needs_distribution = {
            let mut chain = chain_arc.lock().await;
            if chain.distribution_id().is_none() {
                chain.generate_sender_key();
            }
            !chain.is_distributed()
        };
        if !needs_distribution {
            return Ok(());
        }

        if self.state.distributed_channels.lock().await.contains(channel_id) {
            chain_arc.lock().await.mark_distributed();
            return Ok(());
        }

        let payload = chain_arc.lock().await.create_skdm_payload()?;
        let distribution_id_hex = hex::encode(&payload[..16]);

        let ChannelMemberKeysResponse { members } = self.api.fetch_channel_member_keys(channel_id).await?;
        let my_identity_b64 = self.identity.public_b64();

        let mut distributions = Vec::with_capacity(members.len());
        for member in members {
            if member.identity_key == my_identity_b64 {
                continue;
            }
            let member_identity: [u8; 32] = primitives::b64_decode(&member.identity_key)?
                .try_into()
                .map_err(|_| CryptoError::InvalidPeerKey("channel member identity key must be 32 bytes".into()))?;
            let sealed = sender_keys::encrypt_skdm(&payload, &member_identity)?;
            distributions.push(SkdmDistribution {
                to_user_id: member.user_id,
                distribution_id: distribution_id_hex.clone(),
                encrypted_skdm: STANDARD.encode(sealed),
            });
        }

        self.api
            .distribute_skdms(DistributeSkdmsRequest { channel_id: channel_id.to_string(), distributions })
            .await?;

        chain_arc.lock().await.mark_distributed();
        self.state.distributed_channels.lock().await.insert(channel_id.to_string());
        debug!(channel_id, "distributed sender key to channel members");
        Ok(())
    }

    /// Drops this device's outgoing sender key for `channel_id`. Call on
    /// member removal or policy rotation; the next `encrypt_outgoing`/
    /// `ensure_sender_key_distributed` call re-enters `Uninitialized`,
    /// generates a fresh chain under a new distribution id, and redistributes
    /// it to the channel's current members. Messages already sent under the
    /// old distribution remain decryptable by anyone still holding that
    /// chain — invalidation only affects what gets sent from here on.
    #[instrument(skip(self))]
    pub async fn invalidate_channel(&self, channel_id: &str) {
        if let Some(chain_arc) = self.state.my_sender_keys.lock().await.get(channel_id) {
            chain_arc.lock().await.invalidate();
        }
        self.state.distributed_channels.lock().await.remove(channel_id);
        debug!(channel_id, "invalidated sender key");
    }

    /// Triggered by a `SenderKeysUpdated { channel_id }` realtime hint:
    /// fetch and cache any pending SKDMs addressed to this device for the
    /// channel, without waiting for a group envelope to arrive first.
    #[instrument(skip(self))]
    pub async fn on_sender_keys_updated(&self, channel_id: &str) -> Result<(), CoreError> {
        self.refresh_received_sender_keys(channel_id).await
    }

    async fn refresh_received_sender_keys(&self, channel_id: &str) -> Result<(), CoreError> {
        let pending = self.api.fetch_pending_skdms(channel_id).await?;
        let mut cache = self.state.received_sender_keys.lock().await;
        for p in pending.pending {
            let mut distribution_id = [0u8; 16];
            hex::decode_to_slice(&p.distribution_id, &mut distribution_id).map_err(CryptoError::from)?;
            let key = (channel_id.to_string(), distribution_id);
            if cache.contains_key(&key) {
                continue;
            }
            let sealed = STANDARD.decode(&p.encrypted_skdm).map_err(CryptoError::from)?;
            let opened = sender_keys::decrypt_skdm(&sealed, &self.identity)?;
            let (distribution_id, chain_index, chain_key) = sender_keys::parse_skdm_payload(&opened);
            let received = ReceivedSenderKey::from_skdm(p.from_user_id, distribution_id, chain_index, chain_key);
            cache.insert(key, Arc::new(Mutex::new(received)));
        }
        Ok(())
    }

    /// Decrypt a server-delivered envelope, routing by its type byte.
    #[instrument(skip(self, msg))]
    pub async fn decrypt_incoming(&self, msg: &ServerMessage) -> Result<MessagePayload, CoreError> {
        let envelope = Envelope::from_base64(&msg.encrypted_body)?;

        let plaintext = match envelope {
            Envelope::LegacyCleartext(bytes) => {
                if !self.config.accept_legacy_cleartext {
                    return Err(CoreError::LegacyCleartextRejected);
                }
                bytes
            }
            Envelope::Group { distribution_id, chain_index, nonce, ciphertext } => {
                self.decrypt_group(&msg.channel_id, distribution_id, chain_index, &nonce, &ciphertext)
                    .await?
            }
            Envelope::DmFollowUp { message } => self.decrypt_dm_follow_up(&msg.channel_id, &message).await?,
            Envelope::DmInitial {
                sender_identity_ed_pub,
                sender_ephemeral_x_pub,
                used_otp,
                otp_pub,
                message,
            } => {
                self.decrypt_dm_initial(
                    &msg.channel_id,
                    sender_identity_ed_pub,
                    sender_ephemeral_x_pub,
                    used_otp,
                    otp_pub,
                    &message,
                )
                .await?
            }
        };

        Ok(MessagePayload::from_json(&plaintext)?)
    }

    async fn decrypt_group(
        &self,
        channel_id: &str,
        distribution_id: [u8; 16],
        chain_index: u32,
        nonce: &[u8; 24],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        let key = (channel_id.to_string(), distribution_id);

        let mut chain_arc = { self.state.received_sender_keys.lock().await.get(&key).cloned() };
        if chain_arc.is_none() {
            debug!(channel_id, "sender key cache miss, refreshing from pending SKDMs");
            self.refresh_received_sender_keys(channel_id).await?;
            chain_arc = { self.state.received_sender_keys.lock().await.get(&key).cloned() };
        }
        let chain_arc = match chain_arc {
            Some(c) => c,
            None => {
                warn!(channel_id, "no sender key for distribution, even after refresh");
                return Err(CoreError::NoSenderKey);
            }
        };

        let mut chain = chain_arc.lock().await;
        Ok(chain.decrypt(chain_index, nonce, ciphertext)?)
    }

    async fn decrypt_dm_follow_up(&self, channel_id: &str, message: &DrMessage) -> Result<Vec<u8>, CoreError> {
        let peer_id = self
            .resolve_channel_peer(channel_id)
            .await?
            .ok_or_else(|| CoreError::UnknownChannel(channel_id.to_string()))?;

        let session_arc = self.hydrate_dm_session(&peer_id).await?.ok_or(CoreError::NoSession)?;

        let mut session = session_arc.lock().await;
        let plaintext = session.decrypt_step(&message.header, &message.ciphertext)?;
        self.store
            .save_dr_session(&peer_id, &session.serialize_session())
            .await?;
        Ok(plaintext)
    }

    #[allow(clippy::too_many_arguments)]
    async fn decrypt_dm_initial(
        &self,
        channel_id: &str,
        sender_identity_ed_pub: [u8; 32],
        sender_ephemeral_x_pub: [u8; 32],
        used_otp: bool,
        otp_pub: Option<[u8; 32]>,
        message: &DrMessage,
    ) -> Result<Vec<u8>, CoreError> {
        let existing_peer = self.resolve_channel_peer(channel_id).await?;
        if let Some(peer_id) = existing_peer {
            let session_arc = self.hydrate_dm_session(&peer_id).await?;
            if let Some(session_arc) = session_arc {
                let mut session = session_arc.lock().await;
                let plaintext = session.decrypt_step(&message.header, &message.ciphertext)?;
                self.store
                    .save_dr_session(&peer_id, &session.serialize_session())
                    .await?;
                return Ok(plaintext);
            }
        }

        let otp_secret = if used_otp {
            let otp_pub_bytes = otp_pub
                .ok_or_else(|| CryptoError::Truncated("DM-initial claims used_otp without an otp_pub".into()))?;
            let secret = self.store.consume_one_time_prekey(&otp_pub_bytes).await?;
            Some(StaticSecret::from(secret.ok_or(CoreError::NoSession)?))
        } else {
            None
        };

        let (shared_key, ad) = x3dh::respond(
            &self.identity,
            &self.spk_secret,
            otp_secret.as_ref(),
            &sender_identity_ed_pub,
            &X25519Public::from(sender_ephemeral_x_pub),
        )?;

        let mut session = RatchetSession::init_bob(shared_key, ad, &self.spk_secret, &self.spk_public);
        let plaintext = session.decrypt_step(&message.header, &message.ciphertext)?;

        let payload = MessagePayload::from_json(&plaintext)?;
        let peer_id = payload.sender_id;

        self.store
            .save_dr_session(&peer_id, &session.serialize_session())
            .await?;
        self.state
            .dm_sessions
            .lock()
            .await
            .insert(peer_id.clone(), Arc::new(Mutex::new(session)));
        self.state.dm_ad.lock().await.insert(peer_id.clone(), ad);
        self.remember_channel_peer(channel_id, &peer_id).await?;

        debug!(channel_id, peer_id, "established inbound DM session via X3DH responder");
        Ok(plaintext)
    }
}
