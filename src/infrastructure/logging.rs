use std::io;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::{config::AppConfig, infrastructure::directories::ResolvedPaths};

const LOG_FILE_PREFIX: &str = "giveaway-bot.log";
const NOISY_TARGETS: &[&str] = &["sqlx=warn", "tokio_cron_scheduler=warn", "reqwest=warn"];

static INIT: OnceCell<()> = OnceCell::new();
static GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

pub fn init_tracing(config: &AppConfig, paths: &ResolvedPaths) -> Result<()> {
    INIT.get_or_try_init::<_, anyhow::Error>(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_directives(&config.logging.level)))
            .unwrap_or_else(|_| EnvFilter::new(default_directives("info")));

        let file_appender = tracing_appender::rolling::daily(&paths.logs_dir, LOG_FILE_PREFIX);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
        let _ = GUARD.set(guard);

        let console_layer = fmt::layer()
            .with_writer(io::stdout)
            .with_target(true)
            .with_ansi(true);

        let file_layer = fmt::layer()
            .with_writer(file_writer)
            .with_target(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        tracing::info!(
            target: "lifecycle",
            logs = %paths.logs_dir.display(),
            level = config.logging.level.as_str(),
            "tracing initialized"
        );
        Ok(())
    })?;
    Ok(())
}

/// `LOG_LEVEL` plus caps on chatty dependencies. An explicit directive for
/// one of those crates in `LOG_LEVEL` wins because it comes last.
fn default_directives(level: &str) -> String {
    let level = level.trim();
    let mut directives: Vec<&str> = Vec::with_capacity(NOISY_TARGETS.len() + 1);
    let (base, overrides) = match level.split_once(',') {
        Some((base, rest)) => (base, Some(rest)),
        None => (level, None),
    };
    directives.push(if base.is_empty() { "info" } else { base });
    directives.extend_from_slice(NOISY_TARGETS);
    if let Some(rest) = overrides {
        directives.push(rest);
    }
    directives.join(",")
}
