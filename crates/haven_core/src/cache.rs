//! In-process dispatcher caches (spec §4.H). Every entry that can be
//! concurrently encrypted/decrypted lives behind its own `tokio::sync::Mutex`
//! so two calls against the same peer or channel never interleave, while
//! the outer maps use a coarser lock only to guard insertion/removal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use x25519_dalek::PublicKey as X25519Public;

use haven_crypto::ratchet::RatchetSession;
use haven_crypto::sender_keys::{ReceivedSenderKey, SenderKeyState};

/// Handshake material needed for the *first* outbound envelope on a
/// freshly established DM session, held until that envelope is sent.
pub(crate) struct PendingInitial {
    pub identity_ed_pub: [u8; 32],
    pub ephemeral_pub: X25519Public,
    pub used_otp: bool,
    pub otp_pub: Option<X25519Public>,
}

pub(crate) struct DispatcherState {
    pub dm_sessions: Mutex<HashMap<String, Arc<Mutex<RatchetSession>>>>,
    pub dm_ad: Mutex<HashMap<String, [u8; 64]>>,
    pub channel_to_peer: Mutex<HashMap<String, String>>,
    pub pending_initial: Mutex<HashMap<String, PendingInitial>>,
    pub my_sender_keys: Mutex<HashMap<String, Arc<Mutex<SenderKeyState>>>>,
    pub distributed_channels: Mutex<HashSet<String>>,
    pub received_sender_keys: Mutex<HashMap<(String, [u8; 16]), Arc<Mutex<ReceivedSenderKey>>>>,
}

impl DispatcherState {
    pub fn new() -> Self {
        Self {
            dm_sessions: Mutex::new(HashMap::new()),
            dm_ad: Mutex::new(HashMap::new()),
            channel_to_peer: Mutex::new(HashMap::new()),
            pending_initial: Mutex::new(HashMap::new()),
            my_sender_keys: Mutex::new(HashMap::new()),
            distributed_channels: Mutex::new(HashSet::new()),
            received_sender_keys: Mutex::new(HashMap::new()),
        }
    }
}
