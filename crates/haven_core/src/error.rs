use thiserror::Error;

use haven_crypto::CryptoError;
use haven_proto::envelope::EnvelopeError;

use crate::api::ApiError;
use crate::store::StoreError;

/// Dispatcher-level error taxonomy. Wraps the pure-crypto [`CryptoError`]
/// and the wire-codec [`EnvelopeError`] unchanged, and adds the
/// I/O-and-routing failure kinds that only make sense at this boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("payload serialisation error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("no Double Ratchet session established for this channel")]
    NoSession,

    #[error("no sender key for this distribution, even after a refresh")]
    NoSenderKey,

    #[error("channel {0} has no registered DM peer")]
    UnknownChannel(String),

    #[error("legacy cleartext envelopes are not accepted by this configuration")]
    LegacyCleartextRejected,

    #[error("upstream I/O failed: {0}")]
    Network(#[from] ApiError),

    #[error("persistent store I/O failed: {0}")]
    Store(#[from] StoreError),
}
