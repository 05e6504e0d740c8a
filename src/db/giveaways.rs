use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::{
    query, query_as,
    sqlite::{SqlitePool, SqliteRow},
    FromRow, Row,
};

use crate::domain::{
    pick_winners, Finalized, Giveaway, GiveawayStats, GiveawayStatus, NewGiveaway, Participant,
    WinnersMode,
};

const GIVEAWAY_COLUMNS: &str = "id, title, description, channel_username, winner_message, \
                                winners_mode, winners_count, ends_at, status, created_by, created_at";
const PARTICIPANT_COLUMNS: &str =
    "id, giveaway_id, user_id, username, ticket_number, joined_at, can_dm";

#[derive(Clone)]
pub struct GiveawayRepository {
    pool: SqlitePool,
}

impl GiveawayRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewGiveaway) -> Result<Giveaway> {
        let id = query(
            r#"INSERT INTO giveaways
                (title, description, channel_username, winner_message, winners_mode,
                 winners_count, ends_at, status, created_by, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'ACTIVE', ?8, ?9)"#,
        )
        .bind(&new.title)
        .bind(&new.description)
        .bind(&new.channel_username)
        .bind(&new.winner_message)
        .bind(new.winners_mode.mode_str())
        .bind(new.winners_mode.count().map(i64::from))
        .bind(new.ends_at)
        .bind(new.created_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("giveaway {id} vanished after insert"))
    }

    pub async fn get(&self, id: i64) -> Result<Option<Giveaway>> {
        let giveaway = query_as::<_, Giveaway>(&format!(
            "SELECT {GIVEAWAY_COLUMNS} FROM giveaways WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(giveaway)
    }

    pub async fn list_all(&self) -> Result<Vec<Giveaway>> {
        let rows = query_as::<_, Giveaway>(&format!(
            "SELECT {GIVEAWAY_COLUMNS} FROM giveaways ORDER BY id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_active(&self) -> Result<Vec<Giveaway>> {
        let rows = query_as::<_, Giveaway>(&format!(
            "SELECT {GIVEAWAY_COLUMNS} FROM giveaways WHERE status = 'ACTIVE' ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Giveaway>> {
        let rows = query_as::<_, Giveaway>(&format!(
            "SELECT {GIVEAWAY_COLUMNS} FROM giveaways \
             WHERE status = 'ACTIVE' AND ends_at IS NOT NULL AND ends_at <= ?1 ORDER BY id ASC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_ends_at(&self, id: i64, ends_at: Option<DateTime<Utc>>) -> Result<bool> {
        let affected = query(r#"UPDATE giveaways SET ends_at = ?1 WHERE id = ?2"#)
            .bind(ends_at)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Sets a fixed number of winners, switching an ALL giveaway to COUNT.
    pub async fn set_winners_count(&self, id: i64, count: u32) -> Result<bool> {
        let affected = query(
            r#"UPDATE giveaways SET winners_mode = 'COUNT', winners_count = ?1 WHERE id = ?2"#,
        )
        .bind(i64::from(count))
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn set_description(&self, id: i64, description: Option<&str>) -> Result<bool> {
        let affected = query(r#"UPDATE giveaways SET description = ?1 WHERE id = ?2"#)
            .bind(description)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let affected = query(r#"DELETE FROM giveaways WHERE id = ?1"#)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Adds a participant with a random ticket number. `None` if the user
    /// already joined this giveaway.
    pub async fn add_participant(
        &self,
        giveaway_id: i64,
        user_id: i64,
        username: Option<&str>,
    ) -> Result<Option<Participant>> {
        let ticket_number: i64 = rand::thread_rng().gen_range(1000..=9999);
        let inserted = query(
            r#"INSERT INTO participants (giveaway_id, user_id, username, ticket_number, joined_at, can_dm)
                VALUES (?1, ?2, ?3, ?4, ?5, 1)"#,
        )
        .bind(giveaway_id)
        .bind(user_id)
        .bind(username)
        .bind(ticket_number)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => self.get_participant(giveaway_id, user_id).await,
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_participant(
        &self,
        giveaway_id: i64,
        user_id: i64,
    ) -> Result<Option<Participant>> {
        let participant = query_as::<_, Participant>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE giveaway_id = ?1 AND user_id = ?2"
        ))
        .bind(giveaway_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(participant)
    }

    pub async fn list_participants(&self, giveaway_id: i64, limit: i64) -> Result<Vec<Participant>> {
        let rows = query_as::<_, Participant>(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE giveaway_id = ?1 ORDER BY id ASC LIMIT ?2"
        ))
        .bind(giveaway_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn participants_count(&self, giveaway_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            query_as(r#"SELECT COUNT(*) FROM participants WHERE giveaway_id = ?1"#)
                .bind(giveaway_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn winners(&self, giveaway_id: i64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            query_as(r#"SELECT user_id FROM winners WHERE giveaway_id = ?1 ORDER BY id ASC"#)
                .bind(giveaway_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
    }

    /// Draws winners and marks the giveaway FINISHED in one transaction.
    /// The status flip comes first so concurrent callers serialize on the
    /// write lock; only the caller that flipped it draws. Others get the
    /// stored winners with `newly_finished == false`.
    pub async fn finalize(&self, giveaway_id: i64) -> Result<Finalized> {
        let mut tx = self.pool.begin().await?;

        let flipped = query(
            r#"UPDATE giveaways SET status = 'FINISHED' WHERE id = ?1 AND status = 'ACTIVE'"#,
        )
        .bind(giveaway_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if flipped == 0 {
            let rows: Vec<(i64,)> =
                query_as(r#"SELECT user_id FROM winners WHERE giveaway_id = ?1 ORDER BY id ASC"#)
                    .bind(giveaway_id)
                    .fetch_all(&mut *tx)
                    .await?;
            tx.commit().await?;
            return Ok(Finalized {
                winners: rows.into_iter().map(|(user_id,)| user_id).collect(),
                newly_finished: false,
            });
        }

        let (mode, count): (String, Option<i64>) =
            query_as(r#"SELECT winners_mode, winners_count FROM giveaways WHERE id = ?1"#)
                .bind(giveaway_id)
                .fetch_one(&mut *tx)
                .await?;
        let mode = WinnersMode::from_columns(&mode, count)?;

        let entrants: Vec<(i64,)> =
            query_as(r#"SELECT user_id FROM participants WHERE giveaway_id = ?1 ORDER BY id ASC"#)
                .bind(giveaway_id)
                .fetch_all(&mut *tx)
                .await?;
        let entrants: Vec<i64> = entrants.into_iter().map(|(user_id,)| user_id).collect();
        let winners = pick_winners(&entrants, mode, &mut rand::thread_rng());

        let now = Utc::now();
        for user_id in &winners {
            query(r#"INSERT INTO winners (giveaway_id, user_id, picked_at) VALUES (?1, ?2, ?3)"#)
                .bind(giveaway_id)
                .bind(user_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::info!(
            target: "giveaway",
            giveaway_id,
            entrants = entrants.len(),
            winners = winners.len(),
            "giveaway finalized"
        );
        Ok(Finalized {
            winners,
            newly_finished: true,
        })
    }

    pub async fn stats(&self) -> Result<GiveawayStats> {
        let (giveaways_total, giveaways_active, giveaways_finished): (i64, i64, i64) = query_as(
            r#"SELECT COUNT(*),
                      COALESCE(SUM(status = 'ACTIVE'), 0),
                      COALESCE(SUM(status = 'FINISHED'), 0)
                 FROM giveaways"#,
        )
        .fetch_one(&self.pool)
        .await?;
        let (participants_total, participants_can_dm): (i64, i64) = query_as(
            r#"SELECT COUNT(DISTINCT user_id),
                      COUNT(DISTINCT CASE WHEN can_dm = 1 THEN user_id END)
                 FROM participants"#,
        )
        .fetch_one(&self.pool)
        .await?;
        let (winners_total,): (i64,) = query_as(r#"SELECT COUNT(*) FROM winners"#)
            .fetch_one(&self.pool)
            .await?;
        let (broadcasts_total,): (i64,) = query_as(r#"SELECT COUNT(*) FROM broadcast_jobs"#)
            .fetch_one(&self.pool)
            .await?;

        Ok(GiveawayStats {
            giveaways_total,
            giveaways_active,
            giveaways_finished,
            participants_total,
            participants_can_dm,
            winners_total,
            broadcasts_total,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Giveaway {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let mode: String = row.try_get("winners_mode")?;
        let count: Option<i64> = row.try_get("winners_count")?;
        let winners_mode = WinnersMode::from_columns(&mode, count)
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<GiveawayStatus>()
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;

        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            channel_username: row.try_get("channel_username")?,
            winner_message: row.try_get("winner_message")?,
            winners_mode,
            ends_at: row.try_get("ends_at")?,
            status,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Participant {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            giveaway_id: row.try_get("giveaway_id")?,
            user_id: row.try_get("user_id")?,
            username: row.try_get("username")?,
            ticket_number: row.try_get("ticket_number")?,
            joined_at: row.try_get("joined_at")?,
            can_dm: row.try_get("can_dm")?,
        })
    }
}
