use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    query, query_as,
    sqlite::{SqlitePool, SqliteRow},
    FromRow, Row,
};

use crate::domain::{
    BroadcastJob, BroadcastScope, JobCursor, JobStatus, JobUpdate, NewBroadcastJob,
};

const JOB_COLUMNS: &str = "id, giveaway_id, text, organizer, is_global, last_participant_id, \
                           last_user_id, sent_ok, sent_fail, status, created_at, updated_at";

/// Durable queue of broadcast requests. Rows are never deleted.
#[derive(Clone)]
pub struct BroadcastJobRepository {
    pool: SqlitePool,
}

impl BroadcastJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Queues a broadcast. Returns `None` when an identical job
    /// (same text and target) is still PENDING or RUNNING.
    pub async fn create(&self, job: NewBroadcastJob) -> Result<Option<BroadcastJob>> {
        let giveaway_id = job.scope.giveaway_id();
        let is_global = job.scope.is_global();
        let mut tx = self.pool.begin().await?;

        let live: Option<(i64,)> = query_as(
            r#"SELECT id FROM broadcast_jobs
                WHERE status IN ('PENDING', 'RUNNING')
                  AND text = ?1 AND is_global = ?2 AND giveaway_id IS ?3
                LIMIT 1"#,
        )
        .bind(&job.text)
        .bind(is_global)
        .bind(giveaway_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((existing,)) = live {
            tracing::info!(target: "broadcast", existing, "identical broadcast already queued");
            return Ok(None);
        }

        let now = Utc::now();
        let inserted = query(
            r#"INSERT INTO broadcast_jobs
                (giveaway_id, text, organizer, is_global, sent_ok, sent_fail, status, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?6, ?6)"#,
        )
        .bind(giveaway_id)
        .bind(&job.text)
        .bind(&job.organizer)
        .bind(is_global)
        .bind(JobStatus::Pending.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await;

        let id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                tracing::info!(target: "broadcast", "identical broadcast queued concurrently");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        tx.commit().await?;

        let created = self
            .get(id)
            .await?
            .with_context(|| format!("broadcast job {id} vanished after insert"))?;
        tracing::info!(
            target: "broadcast",
            job_id = created.id,
            scope = ?created.scope,
            "broadcast job queued"
        );
        Ok(Some(created))
    }

    pub async fn get(&self, id: i64) -> Result<Option<BroadcastJob>> {
        let job = query_as::<_, BroadcastJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM broadcast_jobs WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn fetch_next_pending(&self) -> Result<Option<BroadcastJob>> {
        let job = query_as::<_, BroadcastJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM broadcast_jobs WHERE status = 'PENDING' ORDER BY id ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// PENDING -> RUNNING, gated on the current status. `false` means another
    /// worker got there first.
    pub async fn claim(&self, id: i64) -> Result<bool> {
        let affected = query(
            r#"UPDATE broadcast_jobs SET status = 'RUNNING', updated_at = ?1
                WHERE id = ?2 AND status = 'PENDING'"#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    /// Applies a partial update in one statement, so counters and cursor
    /// always land together.
    pub async fn update(&self, id: i64, update: JobUpdate) -> Result<()> {
        query(
            r#"UPDATE broadcast_jobs SET
                status = COALESCE(?1, status),
                sent_ok = COALESCE(?2, sent_ok),
                sent_fail = COALESCE(?3, sent_fail),
                last_participant_id = COALESCE(?4, last_participant_id),
                last_user_id = COALESCE(?5, last_user_id),
                updated_at = ?6
                WHERE id = ?7"#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.sent_ok)
        .bind(update.sent_fail)
        .bind(update.last_participant_id)
        .bind(update.last_user_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn release(&self, id: i64) -> Result<bool> {
        let affected = query(
            r#"UPDATE broadcast_jobs SET status = 'PENDING', updated_at = ?1
                WHERE id = ?2 AND status = 'RUNNING'"#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn recover_stale(&self, stale_after: Duration) -> Result<u64> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .context("stale threshold out of range")?;
        self.recover_stale_before(Utc::now() - stale_after).await
    }

    pub async fn recover_stale_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let affected = query(
            r#"UPDATE broadcast_jobs SET status = 'PENDING', updated_at = ?1
                WHERE status = 'RUNNING' AND updated_at < ?2"#,
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<BroadcastJob>> {
        let jobs = query_as::<_, BroadcastJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM broadcast_jobs ORDER BY id DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn count_for_giveaway(&self, giveaway_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            query_as(r#"SELECT COUNT(*) FROM broadcast_jobs WHERE giveaway_id = ?1"#)
                .bind(giveaway_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

impl<'r> FromRow<'r, SqliteRow> for BroadcastJob {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let id: i64 = row.try_get("id")?;
        let is_global: bool = row.try_get("is_global")?;
        let giveaway_id: Option<i64> = row.try_get("giveaway_id")?;
        let scope = BroadcastScope::from_columns(id, is_global, giveaway_id)
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<JobStatus>()
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;

        Ok(Self {
            id,
            text: row.try_get("text")?,
            organizer: row.try_get("organizer")?,
            scope,
            sent_ok: row.try_get("sent_ok")?,
            sent_fail: row.try_get("sent_fail")?,
            cursor: JobCursor {
                last_participant_id: row.try_get("last_participant_id")?,
                last_user_id: row.try_get("last_user_id")?,
            },
            status,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
