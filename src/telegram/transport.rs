use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{FileId, InputFile, ParseMode, Recipient},
    ApiError, RequestError,
};
use url::Url;

use crate::{
    domain::{ChannelPost, OutboundMessage},
    tasks::transport::{MessageTransport, TransportError},
    telegram::keyboards::{contact_markup, link_markup},
};

/// `MessageTransport` over the Bot API.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MessageTransport for TelegramTransport {
    async fn send(&self, chat_id: i64, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut request = self
            .bot
            .send_message(ChatId(chat_id), message.text.clone())
            .parse_mode(ParseMode::Html);
        if let Some(markup) = message.contact.as_deref().and_then(contact_markup) {
            request = request.reply_markup(markup);
        }
        request.await.map(|_| ()).map_err(classify_request_error)
    }

    async fn send_photo(&self, post: &ChannelPost) -> Result<(), TransportError> {
        let photo = match Url::parse(&post.photo) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => InputFile::url(url),
            _ => InputFile::file_id(FileId(post.photo.clone())),
        };
        let mut request = self
            .bot
            .send_photo(Recipient::ChannelUsername(post.channel.clone()), photo)
            .caption(post.caption.clone())
            .parse_mode(ParseMode::Html);
        if let Some(markup) = link_markup(&post.button_text, &post.button_url) {
            request = request.reply_markup(markup);
        }
        request.await.map(|_| ()).map_err(classify_request_error)
    }
}

pub fn classify_request_error(err: RequestError) -> TransportError {
    match err {
        RequestError::RetryAfter(wait) => TransportError::RetryAfter(wait.duration()),
        RequestError::Api(api) if is_unreachable(&api) => TransportError::Unreachable(api.to_string()),
        other => TransportError::Other(other.to_string()),
    }
}

/// API errors that mean the chat itself is gone for us. Anything tied to
/// the message content stays transient so one bad body cannot clear flags.
fn is_unreachable(err: &ApiError) -> bool {
    matches!(
        err,
        ApiError::BotBlocked
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::UserDeactivated
            | ApiError::CantInitiateConversation
            | ApiError::CantTalkWithBots
            | ApiError::ChatNotFound
            | ApiError::UserNotFound
    )
}
