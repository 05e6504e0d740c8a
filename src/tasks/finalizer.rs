use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use tokio::time::sleep;

use crate::{
    db::{giveaways::GiveawayRepository, recipients::RecipientRepository},
    domain::BroadcastScope,
    tasks::sender::{SendOutcome, Sender},
    telegram::utils::render_winner_message,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    pub winners: Vec<i64>,
    // Zero when the giveaway had already ended before this call.
    pub notified: u32,
    pub failed: u32,
}

/// Closes giveaways and messages their winners through the shared sender.
pub struct GiveawayFinalizer {
    giveaways: GiveawayRepository,
    recipients: RecipientRepository,
    sender: Arc<Sender>,
    pacing: Duration,
}

impl GiveawayFinalizer {
    pub fn new(
        giveaways: GiveawayRepository,
        recipients: RecipientRepository,
        sender: Arc<Sender>,
        pacing: Duration,
    ) -> Self {
        Self {
            giveaways,
            recipients,
            sender,
            pacing,
        }
    }

    pub async fn finalize_and_notify(&self, giveaway_id: i64) -> Result<FinalizeReport> {
        let finalized = self.giveaways.finalize(giveaway_id).await?;
        let mut report = FinalizeReport {
            winners: finalized.winners,
            ..FinalizeReport::default()
        };
        if !finalized.newly_finished || report.winners.is_empty() {
            return Ok(report);
        }
        let Some(giveaway) = self.giveaways.get(giveaway_id).await? else {
            return Ok(report);
        };

        // Already FINISHED: per-winner store errors are logged, never returned.
        for (idx, &user_id) in report.winners.iter().enumerate() {
            if idx > 0 {
                sleep(self.pacing).await;
            }
            let ticket = match self.giveaways.get_participant(giveaway_id, user_id).await {
                Ok(participant) => participant.map(|p| p.ticket_number),
                Err(err) => {
                    tracing::error!(
                        target: "giveaway",
                        giveaway_id,
                        user_id,
                        error = %err,
                        "failed to load winner ticket"
                    );
                    None
                }
            };
            let message = render_winner_message(&giveaway, ticket);
            match self.sender.send(user_id, &message).await {
                SendOutcome::Sent => report.notified += 1,
                outcome => {
                    report.failed += 1;
                    tracing::warn!(
                        target: "giveaway",
                        giveaway_id,
                        user_id,
                        ?outcome,
                        "failed to notify winner"
                    );
                    if outcome.is_permanent() {
                        if let Err(err) = self
                            .recipients
                            .mark_unreachable(user_id, BroadcastScope::Giveaway(giveaway_id))
                            .await
                        {
                            tracing::error!(
                                target: "giveaway",
                                giveaway_id,
                                user_id,
                                error = %err,
                                "failed to mark winner unreachable"
                            );
                        }
                    }
                }
            }
        }

        tracing::info!(
            target: "giveaway",
            giveaway_id,
            winners = report.winners.len(),
            notified = report.notified,
            failed = report.failed,
            "winners notified"
        );
        Ok(report)
    }

    /// Finalizes every ACTIVE giveaway whose end time has passed.
    pub async fn finalize_expired(&self) -> Result<usize> {
        let expired = self.giveaways.list_expired(Utc::now()).await?;
        let total = expired.len();
        for giveaway in expired {
            if let Err(err) = self.finalize_and_notify(giveaway.id).await {
                tracing::error!(
                    target: "giveaway",
                    giveaway_id = giveaway.id,
                    error = %err,
                    "failed to finalize expired giveaway"
                );
            }
        }
        Ok(total)
    }
}
