use std::{collections::HashSet, env, str::FromStr, time::Duration};

use super::env::{
    AppConfig, BroadcastConfig, ConfigError, DirectoryConfig, LoggingConfig, RateLimits,
    SchedulerConfig,
};

pub fn load_config() -> Result<AppConfig, ConfigError> {
    AppConfig::from_lookup(|key| env::var(key).ok())
}

impl AppConfig {
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bot_token = var("BOT_TOKEN").ok_or(ConfigError::Missing("BOT_TOKEN"))?;
        let bot_username = var("BOT_USERNAME").map(|v| v.trim_start_matches('@').to_string());
        let admins = var("ADMINS")
            .map(|value| parse_id_list(&value))
            .unwrap_or_default();
        let admin_group_id = var("ADMIN_GROUP_ID")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id != 0);

        let directories = DirectoryConfig {
            logs_dir: var("LOGS_DIR").unwrap_or_else(|| "logs".to_string()),
            data_dir: var("DATA_DIR").unwrap_or_else(|| "data".to_string()),
            db_filename: var("DB_FILENAME").unwrap_or_else(|| "giveaway.db".to_string()),
        };

        let logging = LoggingConfig {
            level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };

        let timezone = var("BOT_TIMEZONE").unwrap_or_else(|| "Europe/Moscow".to_string());

        let defaults = BroadcastConfig::default();
        let broadcast = BroadcastConfig {
            pacing: parse_or(&var, "BROADCAST_PACING_MS", Duration::from_millis)
                .unwrap_or(defaults.pacing),
            idle_wait: parse_or(&var, "BROADCAST_IDLE_MS", Duration::from_millis)
                .unwrap_or(defaults.idle_wait),
            error_backoff: parse_or(&var, "BROADCAST_ERROR_BACKOFF_MS", Duration::from_millis)
                .unwrap_or(defaults.error_backoff),
            stale_after: parse_or(&var, "BROADCAST_STALE_AFTER_SECS", Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            send_timeout: parse_or(&var, "BROADCAST_SEND_TIMEOUT_SECS", Duration::from_secs)
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.send_timeout),
            page_size: parse_num::<u32>(&var, "BROADCAST_PAGE_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.page_size),
        };

        let limit_defaults = RateLimits::default();
        let rate_limits = RateLimits {
            global_per_sec: parse_num::<usize>(&var, "RATE_GLOBAL_PER_SEC")
                .filter(|n| *n > 0)
                .unwrap_or(limit_defaults.global_per_sec),
            per_recipient_per_sec: parse_num::<usize>(&var, "RATE_PER_RECIPIENT_PER_SEC")
                .filter(|n| *n > 0)
                .unwrap_or(limit_defaults.per_recipient_per_sec),
            per_destination_per_min: parse_num::<usize>(&var, "RATE_PER_DESTINATION_PER_MIN")
                .filter(|n| *n > 0)
                .unwrap_or(limit_defaults.per_destination_per_min),
        };

        let scheduler = SchedulerConfig {
            sweep_interval: parse_or(&var, "GIVEAWAY_SWEEP_SECS", Duration::from_secs)
                .filter(|d| !d.is_zero())
                .unwrap_or(Duration::from_secs(60)),
        };

        Ok(Self {
            bot_token,
            bot_username,
            admins,
            admin_group_id,
            directories,
            logging,
            timezone,
            broadcast,
            rate_limits,
            scheduler,
        })
    }
}

fn parse_id_list(value: &str) -> HashSet<i64> {
    value
        .split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect()
}

fn parse_num<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|value| value.trim().parse::<T>().ok())
}

fn parse_or(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    to_duration: fn(u64) -> Duration,
) -> Option<Duration> {
    parse_num::<u64>(var, key).map(to_duration)
}
