use std::sync::Arc;

use chrono_tz::Tz;
use once_cell::sync::OnceCell;
use teloxide::{
    prelude::*,
    types::{ChatMemberStatus, Recipient},
    utils::command::BotCommands,
};

use crate::{
    config::AppConfig,
    db::{
        broadcast_jobs::BroadcastJobRepository, giveaways::GiveawayRepository,
        users::UserRepository,
    },
    domain::{ChannelPost, NewGiveaway, WinnersMode},
    tasks::{finalizer::GiveawayFinalizer, scheduler::GiveawayScheduler, sender::Sender},
    telegram::utils::{normalize_channel, optional_text, parse_local_datetime},
};

pub type BotResult<T> = Result<T, teloxide::RequestError>;

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub timezone: Tz,
    pub users: UserRepository,
    pub giveaways: GiveawayRepository,
    pub jobs: BroadcastJobRepository,
    pub finalizer: Arc<GiveawayFinalizer>,
    pub scheduler: Arc<GiveawayScheduler>,
    pub sender: Arc<Sender>,
    pub bot_username: OnceCell<String>,
}

impl AppState {
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.config.admins.contains(&user_id)
    }

    pub fn deep_link(&self, giveaway_id: i64) -> Option<String> {
        self.bot_username
            .get()
            .or(self.config.bot_username.as_ref())
            .map(|name| format!("https://t.me/{name}?start=gw_{giveaway_id}"))
    }
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Доступные команды:")]
pub enum UserCommand {
    #[command(description = "начать")]
    Start(String),
}

#[derive(BotCommands, Clone)]
#[command(rename_rule = "snake_case", description = "Команды администратора:")]
pub enum AdminCommand {
    #[command(description = "статистика")]
    Admin,
    #[command(description = "справка")]
    Help,
    #[command(description = "название | @канал | N или ALL | ГГГГ-ММ-ДД ЧЧ:ММ или - | текст победителю или -")]
    New(String),
    #[command(description = "список розыгрышей")]
    Giveaways,
    #[command(description = "<id> сводка")]
    Giveaway(String),
    #[command(description = "<id> участники")]
    Participants(String),
    #[command(description = "<id> завершить и уведомить победителей")]
    Finish(String),
    #[command(description = "<id> <ГГГГ-ММ-ДД ЧЧ:ММ|->")]
    SetEnd(String),
    #[command(description = "<id> <N>")]
    SetWinners(String),
    #[command(description = "<id> <текст|->")]
    SetDesc(String),
    #[command(description = "<id> удалить")]
    Delete(String),
    #[command(description = "<id> ссылка")]
    Link(String),
    #[command(description = "<id> <file_id или URL фото> | текст кнопки | текст поста")]
    Publish(String),
    #[command(description = "<id> организатор | текст")]
    Broadcast(String),
    #[command(description = "организатор | текст")]
    BroadcastAll(String),
    #[command(description = "очередь рассылок")]
    Jobs,
}

pub fn parse_id(input: &str) -> Result<i64, String> {
    input
        .trim()
        .parse()
        .map_err(|_| "Укажите числовой ID розыгрыша.".to_string())
}

/// `<id> rest...` -> `(id, rest)`.
pub fn parse_id_and_rest(input: &str) -> Result<(i64, &str), String> {
    let input = input.trim();
    let (id, rest) = input.split_once(char::is_whitespace).unwrap_or((input, ""));
    Ok((parse_id(id)?, rest.trim()))
}

/// `organizer | text`. Both parts must be non-empty.
pub fn parse_broadcast(input: &str) -> Result<(String, String), String> {
    let (organizer, text) = input
        .split_once('|')
        .ok_or_else(|| "Формат: организатор | текст".to_string())?;
    let (organizer, text) = (organizer.trim(), text.trim());
    if organizer.is_empty() || text.is_empty() {
        return Err("Формат: организатор | текст".to_string());
    }
    Ok((organizer.to_string(), text.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishArgs {
    pub photo: String,
    pub button_text: String,
    pub caption: String,
}

impl PublishArgs {
    pub fn into_post(self, channel: &str, button_url: String) -> ChannelPost {
        ChannelPost {
            channel: channel.to_string(),
            photo: self.photo,
            caption: self.caption,
            button_text: self.button_text,
            button_url,
        }
    }
}

/// `photo | button text | post text`; the post text may contain `|`.
pub fn parse_publish(input: &str) -> Result<PublishArgs, String> {
    const USAGE: &str = "Формат: /publish <id> <file_id или URL фото> | текст кнопки | текст поста";
    let parts: Vec<&str> = input.splitn(3, '|').map(str::trim).collect();
    let [photo, button_text, caption] = parts.as_slice() else {
        return Err(USAGE.to_string());
    };
    if photo.is_empty()
        || photo.contains(char::is_whitespace)
        || button_text.is_empty()
        || caption.is_empty()
    {
        return Err(USAGE.to_string());
    }
    Ok(PublishArgs {
        photo: photo.to_string(),
        button_text: button_text.to_string(),
        caption: caption.to_string(),
    })
}

pub fn parse_new_giveaway(input: &str, tz: Tz, created_by: i64) -> Result<NewGiveaway, String> {
    let parts: Vec<&str> = input.splitn(5, '|').map(str::trim).collect();
    let [title, channel, winners, ends_at, winner_message] = parts.as_slice() else {
        return Err(
            "Формат: /new название | @канал | N или ALL | ГГГГ-ММ-ДД ЧЧ:ММ или - | текст победителю или -"
                .to_string(),
        );
    };
    if title.is_empty() {
        return Err("Название не может быть пустым.".to_string());
    }
    let channel_username =
        normalize_channel(channel).ok_or_else(|| "Укажите канал в формате @channel.".to_string())?;
    let winners_mode = WinnersMode::parse_input(winners)
        .ok_or_else(|| "Количество победителей: число от 1 до 1000 или ALL.".to_string())?;
    let ends_at = parse_local_datetime(ends_at, tz)
        .map_err(|_| "Дата окончания: ГГГГ-ММ-ДД ЧЧ:ММ или -.".to_string())?;

    Ok(NewGiveaway {
        title: title.to_string(),
        description: None,
        channel_username,
        winner_message: optional_text(winner_message),
        winners_mode,
        ends_at,
        created_by,
    })
}

/// Owner, administrator or plain member of the channel. API failures count
/// as not subscribed.
pub async fn is_channel_subscriber(bot: &Bot, channel_username: &str, user_id: UserId) -> bool {
    let channel = Recipient::ChannelUsername(channel_username.to_string());
    match bot.get_chat_member(channel, user_id).await {
        Ok(member) => matches!(
            member.status(),
            ChatMemberStatus::Owner | ChatMemberStatus::Administrator | ChatMemberStatus::Member
        ),
        Err(err) => {
            tracing::warn!(
                target: "telegram",
                error = %err,
                channel = channel_username,
                user_id = user_id.0,
                "subscription check failed"
            );
            false
        }
    }
}
