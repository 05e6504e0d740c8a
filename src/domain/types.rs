use serde::Serialize;

/// A rendered message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    /// Telegram handle (without `@`) for an inline "contact" button.
    pub contact: Option<String>,
}

/// Photo post for a channel with a single link button under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPost {
    pub channel: String,
    // Telegram file_id or an http(s) URL.
    pub photo: String,
    pub caption: String,
    pub button_text: String,
    pub button_url: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GiveawayStats {
    pub giveaways_total: i64,
    pub giveaways_active: i64,
    pub giveaways_finished: i64,
    pub participants_total: i64,
    pub participants_can_dm: i64,
    pub winners_total: i64,
    pub broadcasts_total: i64,
}
