//! REST/realtime boundary the dispatcher consumes. Request/response
//! shapes live in `haven_proto::api`; this trait is just the transport
//! contract over them, keeping the wire types separate from whatever
//! client actually moves them.

use async_trait::async_trait;
use thiserror::Error;

use haven_proto::api::{
    ChannelMemberKeysResponse, DistributeSkdmsRequest, KeyBundleResponse, PendingSkdmsResponse,
    PrekeyCountResponse, SendMessageRequest, SendMessageResponse, UploadPrekeysRequest,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned an error: {0}")]
    Server(String),
}

/// Everything the dispatcher needs from the network. Implementations are
/// free to be a real HTTP client, a mock for tests, or a queueing layer —
/// the dispatcher never constructs a request by hand.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn fetch_key_bundle(&self, user_id: &str) -> Result<KeyBundleResponse, ApiError>;
    async fn upload_prekeys(&self, req: UploadPrekeysRequest) -> Result<(), ApiError>;
    async fn prekey_count(&self) -> Result<PrekeyCountResponse, ApiError>;
    async fn fetch_channel_member_keys(&self, channel_id: &str) -> Result<ChannelMemberKeysResponse, ApiError>;
    async fn distribute_skdms(&self, req: DistributeSkdmsRequest) -> Result<(), ApiError>;
    async fn fetch_pending_skdms(&self, channel_id: &str) -> Result<PendingSkdmsResponse, ApiError>;
    async fn send_message(&self, req: SendMessageRequest) -> Result<SendMessageResponse, ApiError>;
}
