//! Ambient configuration for an embedding application. The core has no
//! CLI, environment, or flag surface of its own — callers build a
//! `HavenConfig` however they like (file, env, hardcoded) and hand it to
//! [`crate::dispatcher::Dispatcher::new`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HavenConfig {
    /// Whether `0x00` legacy-cleartext envelopes are parsed instead of
    /// rejected outright. Defaults to `false`: a fresh deployment should
    /// never need this path.
    pub accept_legacy_cleartext: bool,
    /// Deadline for a single API call made by the dispatcher, in
    /// milliseconds. On expiry the call fails with `CoreError::Network`
    /// and no state advances.
    pub request_timeout_ms: u64,
    /// Override for `haven_crypto::ratchet::MAX_SKIP`. The ratchet module
    /// itself uses a fixed constant; this is surfaced so an embedder can
    /// apply a stricter bound at the dispatcher boundary before it ever
    /// reaches the crypto layer.
    pub max_skip: u64,
    /// How many one-time prekeys to keep in reserve before prompting a
    /// replenishment upload.
    pub prekey_low_water_mark: u32,
}

impl Default for HavenConfig {
    fn default() -> Self {
        Self {
            accept_legacy_cleartext: false,
            request_timeout_ms: 10_000,
            max_skip: 1000,
            prekey_low_water_mark: 10,
        }
    }
}

impl HavenConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
