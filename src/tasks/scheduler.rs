use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::{db::giveaways::GiveawayRepository, tasks::finalizer::GiveawayFinalizer};

type EndJobs = Arc<Mutex<HashMap<i64, Uuid>>>;

/// Timer context for giveaway ends: one one-shot job per giveaway plus a
/// periodic sweep that catches anything a timer missed.
pub struct GiveawayScheduler {
    scheduler: JobScheduler,
    finalizer: Arc<GiveawayFinalizer>,
    end_jobs: EndJobs,
}

impl GiveawayScheduler {
    pub async fn start(
        finalizer: Arc<GiveawayFinalizer>,
        giveaways: &GiveawayRepository,
        sweep_interval: Duration,
    ) -> Result<Arc<Self>> {
        let scheduler = JobScheduler::new().await?;

        let sweeper = finalizer.clone();
        let sweep = Job::new_repeated_async(sweep_interval, move |_id, _l| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                match sweeper.finalize_expired().await {
                    Ok(0) => {}
                    Ok(count) => {
                        tracing::info!(target: "scheduler", count, "sweep finalized expired giveaways")
                    }
                    Err(err) => {
                        tracing::error!(target: "scheduler", error = %err, "giveaway sweep failed")
                    }
                }
            })
        })?;
        scheduler.add(sweep).await?;
        tracing::info!(
            target: "scheduler",
            interval_secs = sweep_interval.as_secs(),
            "giveaway sweep registered"
        );

        let this = Arc::new(Self {
            scheduler,
            finalizer,
            end_jobs: EndJobs::default(),
        });

        let now = Utc::now();
        for giveaway in giveaways.list_active().await? {
            if let Some(ends_at) = giveaway.ends_at.filter(|at| *at > now) {
                this.schedule_end(giveaway.id, ends_at).await?;
            }
        }

        this.scheduler.start().await?;
        Ok(this)
    }

    /// Registers (or replaces) the end timer of a giveaway.
    pub async fn schedule_end(&self, giveaway_id: i64, ends_at: DateTime<Utc>) -> Result<()> {
        self.cancel(giveaway_id).await?;

        let delay = (ends_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let finalizer = self.finalizer.clone();
        let end_jobs = self.end_jobs.clone();
        let job = Job::new_one_shot_async(delay, move |job_id, _l| {
            let finalizer = finalizer.clone();
            let end_jobs = end_jobs.clone();
            Box::pin(async move {
                {
                    // A replacement timer may already own the slot.
                    let mut end_jobs = end_jobs.lock();
                    if end_jobs.get(&giveaway_id) == Some(&job_id) {
                        end_jobs.remove(&giveaway_id);
                    }
                }
                tracing::info!(target: "scheduler", giveaway_id, "giveaway end timer fired");
                if let Err(err) = finalizer.finalize_and_notify(giveaway_id).await {
                    tracing::error!(
                        target: "scheduler",
                        giveaway_id,
                        error = %err,
                        "failed to finalize giveaway"
                    );
                }
            })
        })?;
        let job_id = job.guid();
        self.end_jobs.lock().insert(giveaway_id, job_id);
        if let Err(err) = self.scheduler.add(job).await {
            self.end_jobs.lock().remove(&giveaway_id);
            return Err(err.into());
        }
        tracing::info!(
            target: "scheduler",
            giveaway_id,
            ends_at = %ends_at,
            delay_secs = delay.as_secs(),
            "giveaway end scheduled"
        );
        Ok(())
    }

    pub async fn cancel(&self, giveaway_id: i64) -> Result<()> {
        let previous = self.end_jobs.lock().remove(&giveaway_id);
        if let Some(job_id) = previous {
            self.scheduler.remove(&job_id).await?;
            tracing::debug!(target: "scheduler", giveaway_id, "giveaway end timer removed");
        }
        Ok(())
    }

    pub fn scheduled(&self) -> usize {
        self.end_jobs.lock().len()
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        tracing::info!(target: "scheduler", "giveaway scheduler stopped");
        Ok(())
    }
}
