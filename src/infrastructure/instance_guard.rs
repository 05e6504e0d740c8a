use std::{
    fs::{File, OpenOptions},
    io::{ErrorKind, Write},
    path::PathBuf,
    process,
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use fs2::FileExt;

use crate::infrastructure::directories::ResolvedPaths;

/// Exclusive lock on a file in the data directory, held for the process
/// lifetime. Two bots on one database would both drain the broadcast queue.
#[derive(Debug)]
pub struct InstanceGuard {
    file: File,
    path: PathBuf,
}

impl InstanceGuard {
    pub fn acquire(paths: &ResolvedPaths) -> Result<Self> {
        let path = paths.lock_path.clone();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Err(anyhow!(
                    "another giveaway bot instance holds {}",
                    path.display()
                ));
            }
            Err(err) => return Err(err.into()),
        }

        file.set_len(0)?;
        writeln!(file, "pid={} started_at={}", process::id(), Utc::now().to_rfc3339())?;
        file.sync_all()?;

        tracing::info!(
            target: "lifecycle",
            pid = process::id(),
            path = %path.display(),
            "acquired instance lock"
        );
        Ok(Self { file, path })
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(
                target: "lifecycle",
                path = %self.path.display(),
                error = %err,
                "failed to release instance lock"
            );
        }
    }
}
