use std::{sync::Arc, time::Duration};

use anyhow::Result;
use once_cell::sync::OnceCell;
use sqlx::SqlitePool;
use teloxide::prelude::*;
use tokio::{task::JoinHandle, time::timeout};

use crate::{
    config::AppConfig,
    db::{
        self, broadcast_jobs::BroadcastJobRepository, giveaways::GiveawayRepository,
        recipients::RecipientRepository, users::UserRepository,
    },
    infrastructure::{directories::ResolvedPaths, notifier::AdminNotifier, shutdown::Shutdown},
    tasks::{
        finalizer::GiveawayFinalizer, rate_limiter::RateLimiter, scheduler::GiveawayScheduler,
        sender::Sender, worker::BroadcastWorker,
    },
    telegram::{
        transport::TelegramTransport, types::AppState, utils::parse_timezone, TelegramService,
    },
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GiveawayBotApp {
    _paths: ResolvedPaths,
    pool: SqlitePool,
    scheduler: Arc<GiveawayScheduler>,
    worker_handle: JoinHandle<()>,
    telegram: TelegramService,
    notifier: AdminNotifier,
    shutdown: Shutdown,
}

impl GiveawayBotApp {
    pub async fn initialize(
        config: AppConfig,
        paths: ResolvedPaths,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let timezone = parse_timezone(&config.timezone);
        if timezone.name() != config.timezone {
            tracing::warn!(
                target: "lifecycle",
                configured = config.timezone.as_str(),
                using = timezone.name(),
                "unknown BOT_TIMEZONE, falling back"
            );
        }

        let pool = db::init_pool(&paths.db_path).await?;
        let users = UserRepository::new(pool.clone());
        let giveaways = GiveawayRepository::new(pool.clone());
        let jobs = BroadcastJobRepository::new(pool.clone());
        let recipients = RecipientRepository::new(pool.clone());

        let bot = Bot::new(&config.bot_token);
        let limiter = Arc::new(RateLimiter::new(config.rate_limits));
        let sender = Arc::new(Sender::new(
            Arc::new(TelegramTransport::new(bot.clone())),
            limiter,
            config.broadcast.send_timeout,
        ));
        let notifier = AdminNotifier::new(sender.clone(), config.admin_group_id);

        let worker = Arc::new(BroadcastWorker::new(
            jobs.clone(),
            recipients.clone(),
            sender.clone(),
            notifier.clone(),
            config.broadcast.clone(),
        ));
        let worker_handle = worker.spawn(shutdown.subscribe());

        let finalizer = Arc::new(GiveawayFinalizer::new(
            giveaways.clone(),
            recipients,
            sender.clone(),
            config.broadcast.pacing,
        ));
        let scheduler =
            GiveawayScheduler::start(finalizer.clone(), &giveaways, config.scheduler.sweep_interval)
                .await?;

        let state = Arc::new(AppState {
            config: config.clone(),
            timezone,
            users,
            giveaways,
            jobs,
            finalizer,
            scheduler: scheduler.clone(),
            sender,
            bot_username: OnceCell::new(),
        });
        let telegram = TelegramService::new(bot, state);

        Ok(Self {
            _paths: paths,
            pool,
            scheduler,
            worker_handle,
            telegram,
            notifier,
            shutdown,
        })
    }

    pub async fn run(self) -> Result<()> {
        let GiveawayBotApp {
            _paths: _,
            pool,
            scheduler,
            mut worker_handle,
            telegram,
            notifier,
            shutdown,
        } = self;

        tracing::info!(target: "lifecycle", version = env!("CARGO_PKG_VERSION"), "giveaway bot started");
        notifier.notify("✅ Бот розыгрышей запущен.").await;

        let mut shutdown_listener = shutdown.subscribe();
        let mut telegram_future = Box::pin(telegram.run(shutdown.subscribe()));
        let mut telegram_completed = false;

        tokio::select! {
            _ = shutdown_listener.notified() => {
                tracing::info!(target: "lifecycle", "shutdown signal received");
            }
            res = &mut telegram_future => {
                telegram_completed = true;
                if let Err(err) = res {
                    tracing::error!(target: "telegram", error = ?err, "dispatcher exited with error");
                } else {
                    tracing::info!(target: "telegram", "dispatcher exited");
                }
            }
        }

        shutdown.trigger();

        if !telegram_completed {
            let wait = tokio::time::sleep(SHUTDOWN_TIMEOUT);
            tokio::pin!(wait);
            tokio::select! {
                res = &mut telegram_future => {
                    if let Err(err) = res {
                        tracing::error!(target: "telegram", error = ?err, "dispatcher exited with error");
                    }
                }
                _ = &mut wait => {
                    tracing::warn!(
                        target: "telegram",
                        "dispatcher did not stop within {:?}; forcing exit",
                        SHUTDOWN_TIMEOUT
                    );
                }
            }
        }

        match timeout(SHUTDOWN_TIMEOUT, scheduler.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(target: "scheduler", error = ?err, "scheduler shutdown failed");
            }
            Err(_) => {
                tracing::warn!(
                    target: "scheduler",
                    "scheduler did not stop within {:?}",
                    SHUTDOWN_TIMEOUT
                );
            }
        }

        // The worker releases its running job before exiting, so it must
        // finish before the pool closes.
        let worker_sleep = tokio::time::sleep(SHUTDOWN_TIMEOUT);
        tokio::pin!(worker_sleep);
        tokio::select! {
            res = &mut worker_handle => {
                if let Err(err) = res {
                    if err.is_panic() {
                        tracing::error!(target: "broadcast", "broadcast worker panicked");
                    }
                }
            }
            _ = &mut worker_sleep => {
                tracing::warn!(
                    target: "broadcast",
                    "broadcast worker did not stop within {:?}; aborting",
                    SHUTDOWN_TIMEOUT
                );
                worker_handle.abort();
            }
        }

        notifier.notify("🛑 Бот розыгрышей остановлен.").await;

        if timeout(SHUTDOWN_TIMEOUT, pool.close()).await.is_err() {
            tracing::warn!(
                target: "db",
                "database pool did not close within {:?}",
                SHUTDOWN_TIMEOUT
            );
        }

        tracing::info!(target: "lifecycle", "giveaway bot stopped");
        Ok(())
    }
}
