use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown job status: {0}")]
    UnknownStatus(String),
    #[error("unknown giveaway status: {0}")]
    UnknownGiveawayStatus(String),
    #[error("unknown winners mode: {0}")]
    UnknownWinnersMode(String),
    #[error("broadcast job {0} is neither global nor bound to a giveaway")]
    MissingScope(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "DONE" => Ok(JobStatus::Done),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Who a broadcast is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BroadcastScope {
    /// Every known user, ordered by Telegram user id.
    Global,
    /// Participants of one giveaway, ordered by participant row id.
    Giveaway(i64),
}

impl BroadcastScope {
    pub fn giveaway_id(&self) -> Option<i64> {
        match self {
            BroadcastScope::Global => None,
            BroadcastScope::Giveaway(id) => Some(*id),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, BroadcastScope::Global)
    }

    pub(crate) fn from_columns(
        job_id: i64,
        is_global: bool,
        giveaway_id: Option<i64>,
    ) -> Result<Self, ModelError> {
        match (is_global, giveaway_id) {
            (true, _) => Ok(BroadcastScope::Global),
            (false, Some(id)) => Ok(BroadcastScope::Giveaway(id)),
            (false, None) => Err(ModelError::MissingScope(job_id)),
        }
    }
}

/// Last processed ordering key. Only the field matching the job scope is used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCursor {
    pub last_participant_id: Option<i64>,
    pub last_user_id: Option<i64>,
}

impl JobCursor {
    pub fn position(&self, scope: BroadcastScope) -> Option<i64> {
        match scope {
            BroadcastScope::Global => self.last_user_id,
            BroadcastScope::Giveaway(_) => self.last_participant_id,
        }
    }

    pub fn advance(&mut self, scope: BroadcastScope, key: i64) {
        match scope {
            BroadcastScope::Global => self.last_user_id = Some(key),
            BroadcastScope::Giveaway(_) => self.last_participant_id = Some(key),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastJob {
    pub id: i64,
    pub text: String,
    pub organizer: Option<String>,
    pub scope: BroadcastScope,
    pub sent_ok: i64,
    pub sent_fail: i64,
    pub cursor: JobCursor,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BroadcastJob {
    pub fn progress(&self) -> JobProgress {
        JobProgress {
            sent_ok: self.sent_ok,
            sent_fail: self.sent_fail,
            cursor: self.cursor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewBroadcastJob {
    pub text: String,
    pub organizer: Option<String>,
    pub scope: BroadcastScope,
}

/// Counters and cursor of a running job, persisted together after every recipient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub sent_ok: i64,
    pub sent_fail: i64,
    pub cursor: JobCursor,
}

/// Partial update of a job row. `None` leaves the column untouched;
/// `updated_at` is always refreshed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub sent_ok: Option<i64>,
    pub sent_fail: Option<i64>,
    pub last_participant_id: Option<i64>,
    pub last_user_id: Option<i64>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl From<JobProgress> for JobUpdate {
    fn from(progress: JobProgress) -> Self {
        Self {
            status: None,
            sent_ok: Some(progress.sent_ok),
            sent_fail: Some(progress.sent_fail),
            last_participant_id: progress.cursor.last_participant_id,
            last_user_id: progress.cursor.last_user_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    /// Ordering key persisted as the cursor.
    pub key: i64,
    pub user_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_text() {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Done] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("FAILED".parse::<JobStatus>().is_err());
    }

    #[test]
    fn scope_requires_giveaway_when_not_global() {
        assert_eq!(
            BroadcastScope::from_columns(1, true, None).unwrap(),
            BroadcastScope::Global
        );
        assert_eq!(
            BroadcastScope::from_columns(1, false, Some(4)).unwrap(),
            BroadcastScope::Giveaway(4)
        );
        assert!(matches!(
            BroadcastScope::from_columns(9, false, None),
            Err(ModelError::MissingScope(9))
        ));
    }

    #[test]
    fn cursor_tracks_the_key_of_its_scope() {
        let mut cursor = JobCursor::default();
        cursor.advance(BroadcastScope::Global, 42);
        cursor.advance(BroadcastScope::Giveaway(1), 7);
        assert_eq!(cursor.position(BroadcastScope::Global), Some(42));
        assert_eq!(cursor.position(BroadcastScope::Giveaway(1)), Some(7));
    }

    #[test]
    fn progress_update_carries_counters_and_cursor_together() {
        let progress = JobProgress {
            sent_ok: 2,
            sent_fail: 1,
            cursor: JobCursor {
                last_participant_id: None,
                last_user_id: Some(7),
            },
        };
        let update = JobUpdate::from(progress);
        assert_eq!(update.status, None);
        assert_eq!(update.sent_ok, Some(2));
        assert_eq!(update.sent_fail, Some(1));
        assert_eq!(update.last_user_id, Some(7));
    }
}
