use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use sqlx::{
    query,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
};

pub mod broadcast_jobs;
pub mod giveaways;
pub mod recipients;
pub mod users;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL UNIQUE,
        username TEXT,
        started_at TEXT NOT NULL,
        can_dm INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS giveaways (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        description TEXT,
        channel_username TEXT NOT NULL,
        winner_message TEXT,
        winners_mode TEXT NOT NULL,
        winners_count INTEGER,
        ends_at TEXT,
        status TEXT NOT NULL DEFAULT 'ACTIVE',
        created_by INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS participants (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        giveaway_id INTEGER NOT NULL REFERENCES giveaways(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL,
        username TEXT,
        ticket_number INTEGER NOT NULL,
        joined_at TEXT NOT NULL,
        can_dm INTEGER NOT NULL DEFAULT 1,
        UNIQUE (giveaway_id, user_id)
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS ix_participants_giveaway_id ON participants (giveaway_id, id)"#,
    r#"
    CREATE TABLE IF NOT EXISTS winners (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        giveaway_id INTEGER NOT NULL REFERENCES giveaways(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL,
        picked_at TEXT NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS ix_winners_giveaway_id ON winners (giveaway_id)"#,
    // No foreign key on giveaway_id: jobs stay behind as audit rows when a giveaway is deleted.
    r#"
    CREATE TABLE IF NOT EXISTS broadcast_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        giveaway_id INTEGER,
        text TEXT NOT NULL,
        organizer TEXT,
        is_global INTEGER NOT NULL DEFAULT 0,
        last_participant_id INTEGER,
        last_user_id INTEGER,
        sent_ok INTEGER NOT NULL DEFAULT 0,
        sent_fail INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'PENDING',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK ((is_global = 1 AND giveaway_id IS NULL) OR (is_global = 0 AND giveaway_id IS NOT NULL))
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS ix_broadcast_jobs_status ON broadcast_jobs (status, id)"#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_broadcast_jobs_live
        ON broadcast_jobs (text, COALESCE(giveaway_id, 0), is_global)
        WHERE status IN ('PENDING', 'RUNNING')
    "#,
];

pub async fn init_pool(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    for statement in SCHEMA {
        query(statement).execute(&pool).await?;
    }

    tracing::info!(target: "db", path = %db_path.display(), "database ready");
    Ok(pool)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twice.db");
        let first = init_pool(&path).await.unwrap();
        first.close().await;
        let second = init_pool(&path).await.unwrap();

        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('users', 'giveaways', 'participants', 'winners', 'broadcast_jobs')",
        )
        .fetch_one(&second)
        .await
        .unwrap();
        assert_eq!(tables, 5);
    }
}
