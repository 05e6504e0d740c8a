use anyhow::Result;
use sqlx::{query, query_as, SqlitePool};

use crate::domain::{BroadcastScope, Recipient};

#[derive(Clone)]
pub struct RecipientRepository {
    pool: SqlitePool,
}

impl RecipientRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Next page of reachable recipients with key strictly greater than `after`,
    /// ascending by key. Global scope is keyed by user id, giveaway scope by
    /// participant row id.
    pub async fn page(
        &self,
        scope: BroadcastScope,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Recipient>> {
        let after = after.unwrap_or(i64::MIN);
        let rows: Vec<(i64, i64)> = match scope {
            BroadcastScope::Global => {
                query_as(
                    r#"SELECT user_id, user_id FROM users
                        WHERE can_dm = 1 AND user_id > ?1
                        ORDER BY user_id ASC
                        LIMIT ?2"#,
                )
                .bind(after)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            BroadcastScope::Giveaway(giveaway_id) => {
                query_as(
                    r#"SELECT p.id, p.user_id FROM participants p
                        JOIN users u ON u.user_id = p.user_id
                        WHERE p.giveaway_id = ?1
                          AND p.can_dm = 1
                          AND u.can_dm = 1
                          AND p.id > ?2
                        ORDER BY p.id ASC
                        LIMIT ?3"#,
                )
                .bind(giveaway_id)
                .bind(after)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|(key, user_id)| Recipient { key, user_id })
            .collect())
    }

    /// Clears `can_dm` for a user that can no longer be contacted. For a
    /// giveaway scope the participant row is cleared as well.
    pub async fn mark_unreachable(&self, user_id: i64, scope: BroadcastScope) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        query(r#"UPDATE users SET can_dm = 0 WHERE user_id = ?1"#)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        if let BroadcastScope::Giveaway(giveaway_id) = scope {
            query(r#"UPDATE participants SET can_dm = 0 WHERE giveaway_id = ?1 AND user_id = ?2"#)
                .bind(giveaway_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::info!(target: "broadcast", user_id, ?scope, "recipient marked unreachable");
        Ok(())
    }
}
