use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ChannelPost, OutboundMessage};

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The platform asked us to back off for this long.
    #[error("throttled; retry after {0:?}")]
    RetryAfter(Duration),
    /// The chat can no longer be contacted (blocked, deleted, not found).
    #[error("recipient unreachable: {0}")]
    Unreachable(String),
    #[error("transport failure: {0}")]
    Other(String),
}

/// Delivery seam used by broadcasts, winner notifications and channel posts.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, chat_id: i64, message: &OutboundMessage) -> Result<(), TransportError>;

    async fn send_photo(&self, post: &ChannelPost) -> Result<(), TransportError>;
}
