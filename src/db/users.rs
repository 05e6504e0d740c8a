use anyhow::Result;
use chrono::Utc;
use sqlx::{query, query_as, SqlitePool};

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers a user on /start, refreshing the username of a known one.
    /// Reachability is restored too: the user just talked to the bot.
    pub async fn upsert(&self, user_id: i64, username: Option<&str>) -> Result<()> {
        query(
            r#"INSERT INTO users (user_id, username, started_at, can_dm)
                VALUES (?1, ?2, ?3, 1)
                ON CONFLICT(user_id) DO UPDATE SET username = excluded.username, can_dm = 1"#,
        )
        .bind(user_id)
        .bind(username)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn can_dm(&self, user_id: i64) -> Result<Option<bool>> {
        let row: Option<(bool,)> = query_as(r#"SELECT can_dm FROM users WHERE user_id = ?1"#)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(flag,)| flag))
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = query_as(r#"SELECT COUNT(*) FROM users"#)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
