use std::sync::Arc;

use crate::{domain::OutboundMessage, tasks::sender::Sender};

/// Posts lifecycle and job reports to the configured admin group.
#[derive(Clone)]
pub struct AdminNotifier {
    sender: Arc<Sender>,
    admin_group_id: Option<i64>,
}

impl AdminNotifier {
    pub fn new(sender: Arc<Sender>, admin_group_id: Option<i64>) -> Self {
        Self {
            sender,
            admin_group_id: admin_group_id.filter(|id| *id != 0),
        }
    }

    /// Sends `text` as HTML, logging a warning on failure.
    pub async fn notify(&self, text: &str) {
        let Some(admin_group_id) = self.admin_group_id else {
            return;
        };
        let message = OutboundMessage {
            text: text.to_string(),
            contact: None,
        };
        let outcome = self.sender.send(admin_group_id, &message).await;
        if !outcome.is_sent() {
            tracing::warn!(
                target: "telegram",
                ?outcome,
                admin_group_id,
                "failed to send admin notification"
            );
        }
    }
}
