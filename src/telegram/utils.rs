use std::convert::TryFrom;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use teloxide::types::User;

use crate::domain::{Giveaway, OutboundMessage, WinnersMode};

static CONTACT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z0-9_]{5,32})").expect("valid contact regex"));

pub const INPUT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";
const DISPLAY_DATETIME_FORMAT: &str = "%d.%m.%Y %H:%M";
const DEFAULT_WINNER_TEXT: &str = "Поздравляем! Вы победитель розыгрыша.";

pub fn extract_contact(text: &str) -> Option<String> {
    CONTACT_REGEX
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn with_contact(text: String) -> OutboundMessage {
    let contact = extract_contact(&text);
    OutboundMessage { text, contact }
}

/// Broadcast body framed with the organizer header. The body is sent as
/// admin-authored HTML; the organizer label is escaped.
pub fn render_broadcast(body: &str, organizer: Option<&str>) -> OutboundMessage {
    let text = format!(
        "📣 <b>Сообщение от организатора:</b>\n<b>{}</b>\n\n{}",
        escape_html(organizer.unwrap_or("")),
        body
    );
    with_contact(text)
}

pub fn render_winner_message(giveaway: &Giveaway, ticket: Option<i64>) -> OutboundMessage {
    let ticket = ticket
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());
    let text = format!(
        "🏆 <b>Поздравляем! Вы выиграли!</b>\n🎫 <b>Номер вашего билета:</b> #{}\n\n{}",
        ticket,
        giveaway
            .winner_message
            .as_deref()
            .unwrap_or(DEFAULT_WINNER_TEXT)
    );
    with_contact(text)
}

pub fn render_join_confirmation(giveaway: &Giveaway, ticket: i64, tz: Tz) -> String {
    let organizer = giveaway.channel_username.trim_start_matches('@');
    format!(
        "🎁 <b>Вы успешно зарегистрированы на розыгрыш от организатора:</b>\n\
         <a href=\"https://t.me/{organizer}\">{name}</a>\n\n\
         🎫 <b>Номер вашего билета:</b> #{ticket}\n\
         🏆 <b>Количество призовых мест:</b> {places}\n\n\
         ⏳ <b>Дата подведения итогов:</b> {ends}\n\n\
         ⚠️ <b>Важно:</b> не удаляйте и не блокируйте бота, иначе мы не сможем уведомить вас о результате.",
        name = escape_html(organizer),
        places = winners_label(giveaway.winners_mode),
        ends = format_ends_at(giveaway.ends_at, tz),
    )
}

pub fn render_giveaway_intro(giveaway: &Giveaway) -> String {
    let mut text = format!(
        "🎁 <b>{}</b>\n\nОрганизатор: {}\n",
        escape_html(&giveaway.title),
        escape_html(&giveaway.channel_username)
    );
    if let Some(description) = &giveaway.description {
        text.push('\n');
        text.push_str(&escape_html(description));
        text.push('\n');
    }
    text
}

pub fn render_rules(giveaway: &Giveaway) -> String {
    format!(
        "Правила розыгрыша:\n1) Подпишитесь на канал {}\n2) Нажмите 'Участвовать'\n3) Дождитесь завершения.",
        giveaway.channel_username
    )
}

pub fn render_giveaway_summary(
    giveaway: &Giveaway,
    participants: i64,
    winners: i64,
    broadcasts: i64,
    tz: Tz,
) -> String {
    format!(
        "<b>#{id} {title}</b>\n\
         Канал: {channel}\n\
         Статус: {status}\n\
         Победителей: {places}\n\
         Окончание: {ends}\n\
         Участников: {participants}\n\
         Выбрано победителей: {winners}\n\
         Рассылок: {broadcasts}",
        id = giveaway.id,
        title = escape_html(&giveaway.title),
        channel = escape_html(&giveaway.channel_username),
        status = giveaway.status.as_str(),
        places = winners_label(giveaway.winners_mode),
        ends = format_ends_at(giveaway.ends_at, tz),
    )
}

pub fn winners_label(mode: WinnersMode) -> String {
    match mode {
        WinnersMode::Count(n) => n.to_string(),
        WinnersMode::All => "все участники".to_string(),
    }
}

pub fn format_ends_at(ends_at: Option<DateTime<Utc>>, tz: Tz) -> String {
    match ends_at {
        Some(at) => at.with_timezone(&tz).format(DISPLAY_DATETIME_FORMAT).to_string(),
        None => "Не задана".to_string(),
    }
}

pub fn parse_timezone(name: &str) -> Tz {
    name.parse().unwrap_or(chrono_tz::Europe::Moscow)
}

/// Parses `YYYY-MM-DD HH:MM` as local time in `tz`. `-` means "no end date"
/// and yields `Ok(None)`.
pub fn parse_local_datetime(input: &str, tz: Tz) -> Result<Option<DateTime<Utc>>, String> {
    let input = input.trim();
    if input == "-" {
        return Ok(None);
    }
    let naive = NaiveDateTime::parse_from_str(input, INPUT_DATETIME_FORMAT)
        .map_err(|err| format!("{input}: {err}"))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| Some(local.with_timezone(&Utc)))
        .ok_or_else(|| format!("{input}: nonexistent local time"))
}

pub fn optional_text(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() || input == "-" {
        None
    } else {
        Some(input.to_string())
    }
}

pub fn normalize_channel(input: &str) -> Option<String> {
    let name = input
        .trim()
        .trim_start_matches("https://t.me/")
        .trim_start_matches('@');
    if name.is_empty() || name.contains(char::is_whitespace) {
        None
    } else {
        Some(format!("@{name}"))
    }
}

pub fn format_user_display(user: &User) -> String {
    if let Some(username) = &user.username {
        format!("@{}", username)
    } else {
        let mut parts = vec![user.first_name.as_str()];
        if let Some(last) = &user.last_name {
            parts.push(last.as_str());
        }
        let name = parts.join(" ").trim().to_string();
        if name.is_empty() {
            "Unknown".to_string()
        } else {
            name
        }
    }
}

pub fn user_to_i64(user: &User) -> i64 {
    i64::try_from(user.id.0).unwrap_or(i64::MAX)
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_frames_body_and_finds_contact() {
        let message = render_broadcast("Пишите @prize_desk за призом", Some("Shop <1>"));
        assert_eq!(
            message.text,
            "📣 <b>Сообщение от организатора:</b>\n<b>Shop &lt;1&gt;</b>\n\nПишите @prize_desk за призом"
        );
        assert_eq!(message.contact.as_deref(), Some("prize_desk"));
    }

    #[test]
    fn organizer_handle_becomes_the_contact() {
        let message = render_broadcast("no handle here", Some("@organizer"));
        assert_eq!(message.contact.as_deref(), Some("organizer"));
        assert_eq!(render_broadcast("short @abc", None).contact, None);
    }

    #[test]
    fn local_datetime_is_converted_to_utc() {
        let tz = parse_timezone("Europe/Moscow");
        let parsed = parse_local_datetime("2026-03-01 15:00", tz).unwrap().unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-03-01T12:00:00+00:00");
        assert_eq!(parse_local_datetime("-", tz).unwrap(), None);
        assert!(parse_local_datetime("tomorrow", tz).is_err());
    }

    #[test]
    fn unknown_timezone_falls_back_to_moscow() {
        assert_eq!(parse_timezone("Mars/Olympus"), chrono_tz::Europe::Moscow);
    }

    #[test]
    fn channel_names_are_normalized() {
        assert_eq!(normalize_channel("mychannel").as_deref(), Some("@mychannel"));
        assert_eq!(normalize_channel(" @mychannel ").as_deref(), Some("@mychannel"));
        assert_eq!(
            normalize_channel("https://t.me/mychannel").as_deref(),
            Some("@mychannel")
        );
        assert_eq!(normalize_channel("@"), None);
    }

    #[test]
    fn dash_means_unset() {
        assert_eq!(optional_text(" - "), None);
        assert_eq!(optional_text(""), None);
        assert_eq!(optional_text(" text ").as_deref(), Some("text"));
    }
}
