use std::{collections::HashSet, time::Duration};

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bot_token: String,
    pub bot_username: Option<String>,
    pub admins: HashSet<i64>,
    pub admin_group_id: Option<i64>,
    pub directories: DirectoryConfig,
    pub logging: LoggingConfig,
    pub timezone: String,
    pub broadcast: BroadcastConfig,
    pub rate_limits: RateLimits,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub logs_dir: String,
    pub data_dir: String,
    pub db_filename: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

/// Tuning for the broadcast worker loop.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Fixed delay between two recipients of the same job.
    pub pacing: Duration,
    pub idle_wait: Duration,
    pub error_backoff: Duration,
    /// A RUNNING job untouched for this long is demoted back to PENDING.
    pub stale_after: Duration,
    /// Hard ceiling on one send attempt, including its single throttle retry.
    pub send_timeout: Duration,
    pub page_size: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(120),
            idle_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(2),
            stale_after: Duration::from_secs(15 * 60),
            send_timeout: Duration::from_secs(30),
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub global_per_sec: usize,
    pub per_recipient_per_sec: usize,
    pub per_destination_per_min: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            global_per_sec: 30,
            per_recipient_per_sec: 1,
            per_destination_per_min: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sweep_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
}
