use std::{
    collections::hash_map::DefaultHasher,
    future::Future,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use tokio::time::{sleep, timeout};

use crate::{
    domain::{ChannelPost, OutboundMessage},
    tasks::{
        rate_limiter::RateLimiter,
        transport::{MessageTransport, TransportError},
    },
};

/// Result of one rate-limited delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The recipient is gone; callers should stop contacting it.
    PermanentFailure(String),
    /// Still throttled after the single retry.
    TransientThrottle(Duration),
    TransientTimeout,
    UnknownFailure(String),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SendOutcome::PermanentFailure(_))
    }
}

pub struct Sender {
    transport: Arc<dyn MessageTransport>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
}

impl Sender {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            limiter,
            timeout,
        }
    }

    /// Sends `message` to `chat_id`, honouring one throttle response with a
    /// sleep and a single retry. The timeout covers the retry as well.
    pub async fn send(&self, chat_id: i64, message: &OutboundMessage) -> SendOutcome {
        self.deliver(chat_id, Some(chat_id), || self.transport.send(chat_id, message))
            .await
    }

    /// Channel posts count against the global and per-destination windows
    /// only; there is no single recipient behind a channel.
    pub async fn publish(&self, post: &ChannelPost) -> SendOutcome {
        let destination = channel_key(&post.channel);
        self.deliver(destination, None, || self.transport.send_photo(post))
            .await
    }

    async fn deliver<F, Fut>(&self, destination: i64, recipient: Option<i64>, op: F) -> SendOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        match timeout(self.timeout, self.attempt(destination, recipient, op)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    target: "broadcast",
                    destination,
                    timeout_secs = self.timeout.as_secs(),
                    "send timed out"
                );
                SendOutcome::TransientTimeout
            }
        }
    }

    async fn attempt<F, Fut>(&self, destination: i64, recipient: Option<i64>, op: F) -> SendOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        self.limiter.acquire(destination, recipient).await;
        let retry_after = match op().await {
            Ok(()) => return SendOutcome::Sent,
            Err(TransportError::RetryAfter(wait)) => wait,
            Err(err) => return classify(err),
        };

        tracing::warn!(
            target: "broadcast",
            destination,
            retry_after_secs = retry_after.as_secs(),
            "throttled by platform; retrying once"
        );
        sleep(retry_after).await;
        self.limiter.acquire(destination, recipient).await;
        match op().await {
            Ok(()) => SendOutcome::Sent,
            Err(err) => classify(err),
        }
    }
}

/// Limiter key for a channel addressed by `@username`.
pub fn channel_key(channel: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    channel
        .trim_start_matches('@')
        .to_ascii_lowercase()
        .hash(&mut hasher);
    hasher.finish() as i64
}

fn classify(err: TransportError) -> SendOutcome {
    match err {
        TransportError::RetryAfter(wait) => SendOutcome::TransientThrottle(wait),
        TransportError::Unreachable(reason) => SendOutcome::PermanentFailure(reason),
        TransportError::Other(reason) => SendOutcome::UnknownFailure(reason),
    }
}
