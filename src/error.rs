use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, CableError>;

#[derive(Debug, thiserror::Error)]
pub enum CableError {
    #[error("channel {0} closed")]
    ChannelClosed(String),
    #[error("filter evaluation failed: {0}")]
    Filter(String),
    #[error("subscription to {0} rejected")]
    SubscriptionRejected(String),
    #[error("subscription to {0}: timeout exceeded")]
    SubscribeTimeout(String),
    #[error("subscription to {0} is already pending")]
    SubscriptionPending(String),
    #[error("onMessage callback failed on {channel}: {reason}")]
    Callback { channel: String, reason: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("websocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid connect options: {0}")]
    InvalidOptions(String),
}

impl CableError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed(_) | Self::ConnectionClosed)
    }
}
