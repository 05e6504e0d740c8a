use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use url::Url;

pub fn giveaway_user_kb(giveaway_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([
        [InlineKeyboardButton::callback(
            "✅ Участвовать",
            format!("join:{giveaway_id}"),
        )],
        [InlineKeyboardButton::callback(
            "🔄 Проверить подписку",
            format!("check:{giveaway_id}"),
        )],
        [InlineKeyboardButton::callback(
            "📜 Правила",
            format!("rules:{giveaway_id}"),
        )],
    ])
}

pub fn not_subscribed_kb(channel_username: &str, giveaway_id: i64) -> InlineKeyboardMarkup {
    let mut rows = vec![vec![InlineKeyboardButton::callback(
        "🔄 Проверить подписку",
        format!("check:{giveaway_id}"),
    )]];
    if let Some(url) = t_me_url(channel_username) {
        rows.push(vec![InlineKeyboardButton::url("Открыть канал", url)]);
    }
    InlineKeyboardMarkup::new(rows)
}

/// Single "contact" button for a Telegram handle.
pub fn contact_markup(handle: &str) -> Option<InlineKeyboardMarkup> {
    let url = t_me_url(handle)?;
    Some(InlineKeyboardMarkup::new([[InlineKeyboardButton::url(
        "Связаться",
        url,
    )]]))
}

pub fn link_markup(text: &str, url: &str) -> Option<InlineKeyboardMarkup> {
    let url = Url::parse(url).ok()?;
    Some(InlineKeyboardMarkup::new([[InlineKeyboardButton::url(
        text.to_string(),
        url,
    )]]))
}

fn t_me_url(handle: &str) -> Option<Url> {
    Url::parse(&format!("https://t.me/{}", handle.trim_start_matches('@'))).ok()
}

/// `join:12` -> `("join", 12)`.
pub fn parse_callback(data: &str) -> Option<(&str, i64)> {
    let (action, id) = data.split_once(':')?;
    Some((action, id.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_data_splits_into_action_and_id() {
        assert_eq!(parse_callback("join:12"), Some(("join", 12)));
        assert_eq!(parse_callback("rules:x"), None);
        assert_eq!(parse_callback("join"), None);
    }

    #[test]
    fn contact_button_links_to_the_handle() {
        let markup = contact_markup("prize_desk").unwrap();
        assert_eq!(markup.inline_keyboard.len(), 1);
        assert_eq!(markup.inline_keyboard[0][0].text, "Связаться");
    }

    #[test]
    fn post_button_needs_a_valid_url() {
        let markup = link_markup("Участвовать", "https://t.me/bot?start=gw_3").unwrap();
        assert_eq!(markup.inline_keyboard[0][0].text, "Участвовать");
        assert!(link_markup("Участвовать", "not a url").is_none());
    }
}
