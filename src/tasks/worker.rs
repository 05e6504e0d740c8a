use std::sync::Arc;

use anyhow::Result;
use tokio::{task::JoinHandle, time::sleep};

use crate::{
    config::BroadcastConfig,
    db::{broadcast_jobs::BroadcastJobRepository, recipients::RecipientRepository},
    domain::{BroadcastJob, JobProgress, JobStatus, JobUpdate, OutboundMessage, Recipient},
    infrastructure::{notifier::AdminNotifier, shutdown::ShutdownListener},
    tasks::{
        cursor::RecipientCursor,
        sender::{SendOutcome, Sender},
    },
    telegram::utils::{escape_html, render_broadcast},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    // A job ran to completion, or another worker claimed it first.
    Progressed,
    Released,
}

/// Drains the broadcast queue one job at a time, one recipient at a time.
pub struct BroadcastWorker {
    jobs: BroadcastJobRepository,
    recipients: RecipientRepository,
    sender: Arc<Sender>,
    notifier: AdminNotifier,
    config: BroadcastConfig,
}

impl BroadcastWorker {
    pub fn new(
        jobs: BroadcastJobRepository,
        recipients: RecipientRepository,
        sender: Arc<Sender>,
        notifier: AdminNotifier,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            jobs,
            recipients,
            sender,
            notifier,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(&mut shutdown).await;
        })
    }

    async fn run_loop(&self, shutdown: &mut ShutdownListener) {
        tracing::info!(target: "broadcast", "broadcast worker started");
        loop {
            if shutdown.is_triggered() {
                break;
            }

            let pause = match self.tick(shutdown).await {
                Ok(Tick::Idle) => Some(self.config.idle_wait),
                Ok(Tick::Progressed) => None,
                Ok(Tick::Released) => break,
                Err(err) => {
                    // The job stays RUNNING until stale recovery picks it up again.
                    tracing::error!(target: "broadcast", error = %err, "broadcast worker iteration failed");
                    Some(self.config.error_backoff)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = sleep(pause) => {}
                    _ = shutdown.notified() => break,
                }
            }
        }
        tracing::info!(target: "broadcast", "broadcast worker stopped");
    }

    /// Stale recovery, then at most one job driven to completion.
    pub async fn tick(&self, shutdown: &mut ShutdownListener) -> Result<Tick> {
        let recovered = self.jobs.recover_stale(self.config.stale_after).await?;
        if recovered > 0 {
            tracing::warn!(target: "broadcast", recovered, "recovered stale RUNNING broadcast jobs");
        }

        let Some(job) = self.jobs.fetch_next_pending().await? else {
            return Ok(Tick::Idle);
        };
        if !self.jobs.claim(job.id).await? {
            tracing::debug!(target: "broadcast", job_id = job.id, "job claimed elsewhere; skipping");
            return Ok(Tick::Progressed);
        }

        self.process_job(job, shutdown).await
    }

    async fn process_job(&self, job: BroadcastJob, shutdown: &mut ShutdownListener) -> Result<Tick> {
        tracing::info!(
            target: "broadcast",
            job_id = job.id,
            scope = ?job.scope,
            resume_after = ?job.cursor.position(job.scope),
            sent_ok = job.sent_ok,
            sent_fail = job.sent_fail,
            "broadcast job started"
        );

        let message = render_broadcast(&job.text, job.organizer.as_deref());
        let mut progress = job.progress();
        let mut cursor = RecipientCursor::resume(&job, self.config.page_size);

        while let Some(recipient) = cursor.next(&self.recipients).await? {
            if shutdown.is_triggered() {
                self.jobs.release(job.id).await?;
                tracing::info!(
                    target: "broadcast",
                    job_id = job.id,
                    sent_ok = progress.sent_ok,
                    sent_fail = progress.sent_fail,
                    "shutdown requested; job released back to the queue"
                );
                return Ok(Tick::Released);
            }

            self.deliver(&job, recipient, &message, &mut progress).await?;

            tokio::select! {
                _ = sleep(self.config.pacing) => {}
                _ = shutdown.notified() => {}
            }
        }

        self.jobs
            .update(job.id, JobUpdate::status(JobStatus::Done))
            .await?;
        tracing::info!(
            target: "broadcast",
            job_id = job.id,
            sent_ok = progress.sent_ok,
            sent_fail = progress.sent_fail,
            "broadcast job finished"
        );
        self.notifier
            .notify(&completion_report(&job, &progress))
            .await;
        Ok(Tick::Progressed)
    }

    async fn deliver(
        &self,
        job: &BroadcastJob,
        recipient: Recipient,
        message: &OutboundMessage,
        progress: &mut JobProgress,
    ) -> Result<()> {
        let outcome = self.sender.send(recipient.user_id, message).await;
        match &outcome {
            SendOutcome::Sent => progress.sent_ok += 1,
            SendOutcome::PermanentFailure(reason) => {
                progress.sent_fail += 1;
                tracing::info!(
                    target: "broadcast",
                    job_id = job.id,
                    user_id = recipient.user_id,
                    reason = %reason,
                    "recipient unreachable"
                );
                self.recipients
                    .mark_unreachable(recipient.user_id, job.scope)
                    .await?;
            }
            other => {
                progress.sent_fail += 1;
                tracing::warn!(
                    target: "broadcast",
                    job_id = job.id,
                    user_id = recipient.user_id,
                    outcome = ?other,
                    "broadcast delivery failed"
                );
            }
        }

        progress.cursor.advance(job.scope, recipient.key);
        self.jobs.update(job.id, JobUpdate::from(*progress)).await
    }
}

fn completion_report(job: &BroadcastJob, progress: &JobProgress) -> String {
    let target = match job.scope.giveaway_id() {
        Some(id) => format!("участникам розыгрыша #{id}"),
        None => "всем пользователям".to_string(),
    };
    format!(
        "📣 Рассылка #{} {} завершена\nОрганизатор: {}\nДоставлено: {}\nОшибок: {}",
        job.id,
        target,
        escape_html(job.organizer.as_deref().unwrap_or("-")),
        progress.sent_ok,
        progress.sent_fail
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use sqlx::{query, SqlitePool};

    use super::*;
    use crate::{
        config::RateLimits,
        db::testing::temp_pool,
        domain::{BroadcastScope, NewBroadcastJob},
        infrastructure::shutdown::Shutdown,
        tasks::{
            rate_limiter::RateLimiter,
            testing::{ScriptedTransport, Step},
            transport::TransportError,
        },
    };

    const ADMIN_GROUP: i64 = -1000;

    struct Harness {
        pool: SqlitePool,
        jobs: BroadcastJobRepository,
        transport: Arc<ScriptedTransport>,
        worker: BroadcastWorker,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let (pool, dir) = temp_pool().await;
        let transport = Arc::new(ScriptedTransport::new());
        let limiter = Arc::new(RateLimiter::new(RateLimits::default()));
        let sender = Arc::new(Sender::new(
            transport.clone(),
            limiter,
            Duration::from_secs(30),
        ));
        let jobs = BroadcastJobRepository::new(pool.clone());
        let config = BroadcastConfig {
            pacing: Duration::from_millis(1),
            idle_wait: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            ..BroadcastConfig::default()
        };
        let worker = BroadcastWorker::new(
            jobs.clone(),
            RecipientRepository::new(pool.clone()),
            sender.clone(),
            AdminNotifier::new(sender, Some(ADMIN_GROUP)),
            config,
        );
        Harness {
            pool,
            jobs,
            transport,
            worker,
            _dir: dir,
        }
    }

    async fn seed_users(pool: &SqlitePool, ids: &[i64]) {
        for user_id in ids {
            query("INSERT INTO users (user_id, started_at) VALUES (?1, ?2)")
                .bind(user_id)
                .bind(Utc::now())
                .execute(pool)
                .await
                .unwrap();
        }
    }

    fn hello_all() -> NewBroadcastJob {
        NewBroadcastJob {
            text: "Hello".to_string(),
            organizer: Some("@organizer".to_string()),
            scope: BroadcastScope::Global,
        }
    }

    fn recipients_of(transport: &ScriptedTransport) -> Vec<i64> {
        transport
            .delivered()
            .into_iter()
            .filter(|id| *id != ADMIN_GROUP)
            .collect()
    }

    #[tokio::test]
    async fn idle_when_queue_is_empty() {
        let h = harness().await;
        let (_shutdown, mut listener) = Shutdown::new();
        assert_eq!(h.worker.tick(&mut listener).await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn job_runs_to_done_and_reports_to_admins() {
        let h = harness().await;
        seed_users(&h.pool, &[9, 5, 7]).await;
        let job = h.jobs.create(hello_all()).await.unwrap().unwrap();
        let (_shutdown, mut listener) = Shutdown::new();

        assert_eq!(h.worker.tick(&mut listener).await.unwrap(), Tick::Progressed);

        assert_eq!(recipients_of(&h.transport), vec![5, 7, 9]);
        let done = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!((done.sent_ok, done.sent_fail), (3, 0));
        assert_eq!(done.cursor.last_user_id, Some(9));

        let report = h.transport.messages_to(ADMIN_GROUP);
        assert_eq!(report.len(), 1);
        assert!(report[0].text.contains("Доставлено: 3"));

        let sent = h.transport.messages_to(5);
        assert_eq!(sent[0].contact.as_deref(), Some("organizer"));
        assert!(sent[0].text.ends_with("Hello"));
    }

    #[tokio::test]
    async fn crashed_job_resumes_after_the_persisted_cursor() {
        let h = harness().await;
        seed_users(&h.pool, &[5, 7, 9]).await;
        let job = h.jobs.create(hello_all()).await.unwrap().unwrap();

        // State left behind by a process that died right after user 7.
        assert!(h.jobs.claim(job.id).await.unwrap());
        h.jobs
            .update(
                job.id,
                JobUpdate {
                    sent_ok: Some(2),
                    last_user_id: Some(7),
                    ..JobUpdate::default()
                },
            )
            .await
            .unwrap();
        query("UPDATE broadcast_jobs SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now() - chrono::Duration::hours(1))
            .bind(job.id)
            .execute(&h.pool)
            .await
            .unwrap();

        let (_shutdown, mut listener) = Shutdown::new();
        assert_eq!(h.worker.tick(&mut listener).await.unwrap(), Tick::Progressed);

        assert_eq!(recipients_of(&h.transport), vec![9]);
        let done = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.sent_ok, 3);
    }

    #[tokio::test]
    async fn fresh_running_job_is_not_reclaimed() {
        let h = harness().await;
        seed_users(&h.pool, &[5]).await;
        let job = h.jobs.create(hello_all()).await.unwrap().unwrap();
        assert!(h.jobs.claim(job.id).await.unwrap());

        let (_shutdown, mut listener) = Shutdown::new();
        assert_eq!(h.worker.tick(&mut listener).await.unwrap(), Tick::Idle);
        assert!(h.transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_job_and_restart_finishes_it() {
        let h = harness().await;
        seed_users(&h.pool, &[5, 7, 9]).await;
        let job = h.jobs.create(hello_all()).await.unwrap().unwrap();

        let (shutdown, mut listener) = Shutdown::new();
        let trigger = shutdown.clone();
        h.transport.after_delivery(move |chat_id| {
            if chat_id == 7 {
                trigger.trigger();
            }
        });
        assert_eq!(h.worker.tick(&mut listener).await.unwrap(), Tick::Released);

        let released = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(released.status, JobStatus::Pending);
        assert_eq!(released.sent_ok, 2);
        assert_eq!(released.cursor.last_user_id, Some(7));

        let (_fresh, mut fresh_listener) = Shutdown::new();
        assert_eq!(
            h.worker.tick(&mut fresh_listener).await.unwrap(),
            Tick::Progressed
        );
        assert_eq!(recipients_of(&h.transport), vec![5, 7, 9]);
        let done = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.sent_ok, 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_counted_and_excluded_from_later_jobs() {
        let h = harness().await;
        seed_users(&h.pool, &[5, 7, 9]).await;
        h.transport
            .script(7, [Step::Fail(TransportError::Unreachable("blocked".into()))]);
        let first = h.jobs.create(hello_all()).await.unwrap().unwrap();

        let (_shutdown, mut listener) = Shutdown::new();
        h.worker.tick(&mut listener).await.unwrap();

        let done = h.jobs.get(first.id).await.unwrap().unwrap();
        assert_eq!((done.sent_ok, done.sent_fail), (2, 1));
        assert_eq!(done.cursor.last_user_id, Some(9));

        let second = h
            .jobs
            .create(NewBroadcastJob {
                text: "Second".to_string(),
                ..hello_all()
            })
            .await
            .unwrap()
            .unwrap();
        h.worker.tick(&mut listener).await.unwrap();

        let attempts: Vec<i64> = h
            .transport
            .attempts()
            .into_iter()
            .filter(|id| *id != ADMIN_GROUP)
            .collect();
        assert_eq!(attempts, vec![5, 7, 9, 5, 9]);
        let done = h.jobs.get(second.id).await.unwrap().unwrap();
        assert_eq!((done.sent_ok, done.sent_fail), (2, 0));
    }

    #[tokio::test]
    async fn unknown_failure_keeps_recipient_reachable() {
        let h = harness().await;
        seed_users(&h.pool, &[5]).await;
        h.transport
            .script(5, [Step::Fail(TransportError::Other("parse error".into()))]);
        let job = h.jobs.create(hello_all()).await.unwrap().unwrap();

        let (_shutdown, mut listener) = Shutdown::new();
        h.worker.tick(&mut listener).await.unwrap();

        let done = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!((done.sent_ok, done.sent_fail), (0, 1));
        let (can_dm,): (bool,) = sqlx::query_as("SELECT can_dm FROM users WHERE user_id = 5")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert!(can_dm);
    }

    #[tokio::test]
    async fn throttled_send_counts_once_after_retry() {
        let h = harness().await;
        seed_users(&h.pool, &[5]).await;
        h.transport.script(
            5,
            [Step::Fail(TransportError::RetryAfter(Duration::from_millis(50)))],
        );
        let job = h.jobs.create(hello_all()).await.unwrap().unwrap();

        let (_shutdown, mut listener) = Shutdown::new();
        h.worker.tick(&mut listener).await.unwrap();

        let done = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!((done.sent_ok, done.sent_fail), (1, 0));
        assert_eq!(done.cursor.last_user_id, Some(5));
        assert_eq!(recipients_of(&h.transport), vec![5]);
    }

    #[tokio::test]
    async fn giveaway_job_walks_participants_by_row_id() {
        let h = harness().await;
        seed_users(&h.pool, &[100, 50]).await;
        query(
            "INSERT INTO giveaways (id, title, channel_username, winners_mode, status, created_by, created_at) \
             VALUES (1, 't', '@c', 'ALL', 'ACTIVE', 1, ?1)",
        )
        .bind(Utc::now())
        .execute(&h.pool)
        .await
        .unwrap();
        for user_id in [100_i64, 50] {
            query(
                "INSERT INTO participants (giveaway_id, user_id, ticket_number, joined_at) \
                 VALUES (1, ?1, 1234, ?2)",
            )
            .bind(user_id)
            .bind(Utc::now())
            .execute(&h.pool)
            .await
            .unwrap();
        }
        let job = h
            .jobs
            .create(NewBroadcastJob {
                scope: BroadcastScope::Giveaway(1),
                ..hello_all()
            })
            .await
            .unwrap()
            .unwrap();

        let (_shutdown, mut listener) = Shutdown::new();
        h.worker.tick(&mut listener).await.unwrap();

        assert_eq!(recipients_of(&h.transport), vec![100, 50]);
        let done = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.cursor.last_participant_id, Some(2));
        assert_eq!(done.cursor.last_user_id, None);
    }

    #[tokio::test]
    async fn persisted_cursor_strictly_increases() {
        let h = harness().await;
        seed_users(&h.pool, &[3, 1, 2]).await;
        let job = h.jobs.create(hello_all()).await.unwrap().unwrap();

        // Stop after every delivery so each pass persists exactly one step.
        let current: Arc<parking_lot::Mutex<Option<Shutdown>>> = Arc::default();
        let hook_target = current.clone();
        h.transport.after_delivery(move |_| {
            if let Some(shutdown) = hook_target.lock().as_ref() {
                shutdown.trigger();
            }
        });

        let mut cursors = Vec::new();
        for _ in 0..3 {
            let (shutdown, mut listener) = Shutdown::new();
            *current.lock() = Some(shutdown);
            h.worker.tick(&mut listener).await.unwrap();
            let job = h.jobs.get(job.id).await.unwrap().unwrap();
            cursors.push(job.cursor.last_user_id);
        }

        assert_eq!(cursors, vec![Some(1), Some(2), Some(3)]);
        let done = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.sent_ok, 3);
    }

    async fn wait_for_status(
        jobs: &BroadcastJobRepository,
        id: i64,
        status: JobStatus,
    ) -> BroadcastJob {
        for _ in 0..300 {
            let job = jobs.get(id).await.unwrap().unwrap();
            if job.status == status {
                return job;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status}");
    }

    #[tokio::test]
    async fn store_error_leaves_job_running_until_stale_recovery() {
        let Harness {
            pool,
            jobs,
            transport,
            worker,
            _dir: _dir_guard,
        } = harness().await;
        seed_users(&pool, &[5, 7, 9]).await;
        let stuck = jobs.create(hello_all()).await.unwrap().unwrap();
        let next = jobs
            .create(NewBroadcastJob {
                text: "Second".to_string(),
                ..hello_all()
            })
            .await
            .unwrap()
            .unwrap();
        // Progress writes for the first job start failing after user 5.
        query(&format!(
            "CREATE TRIGGER progress_store_down BEFORE UPDATE ON broadcast_jobs \
             WHEN OLD.id = {} AND NEW.sent_ok >= 2 \
             BEGIN SELECT RAISE(ABORT, 'store down'); END",
            stuck.id
        ))
        .execute(&pool)
        .await
        .unwrap();

        let (shutdown, listener) = Shutdown::new();
        let handle = Arc::new(worker).spawn(listener);

        wait_for_status(&jobs, next.id, JobStatus::Done).await;
        // A few more idle passes must not pick the failed job up again.
        sleep(Duration::from_millis(50)).await;
        let failed = jobs.get(stuck.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Running);
        assert_eq!(failed.sent_ok, 1);
        assert_eq!(failed.cursor.last_user_id, Some(5));
        assert!(!handle.is_finished());

        query("DROP TRIGGER progress_store_down")
            .execute(&pool)
            .await
            .unwrap();
        query("UPDATE broadcast_jobs SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now() - chrono::Duration::hours(1))
            .bind(stuck.id)
            .execute(&pool)
            .await
            .unwrap();

        let resumed = wait_for_status(&jobs, stuck.id, JobStatus::Done).await;
        assert_eq!(resumed.sent_ok, 3);
        assert_eq!(resumed.cursor.last_user_id, Some(9));

        // User 7 was delivered before the failed write, so it is sent again.
        assert_eq!(recipients_of(&transport), vec![5, 7, 5, 7, 9, 7, 9]);

        shutdown.trigger();
        handle.await.unwrap();
    }
}
