use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current epoch time in milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Lifecycle state of a job as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job record as stored by the registry.
///
/// Records are created and advanced by the workflow system; this crate only reads
/// them and issues archive-start mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    /// Stable identifier, also the registry key.
    pub job_id: String,
    pub state: JobState,
    /// Whether post-completion archival has been triggered.
    pub archived: bool,
    pub archive_started_at_ms: Option<i64>,
    pub archive_done_at_ms: Option<i64>,
    pub last_mutated_at_ms: i64,
    /// Submitting tenant.
    pub owner: String,
    /// Daemon instance currently responsible for archival. `None` means unclaimed.
    pub lease_owner: Option<String>,
}

impl JobRecord {
    /// A freshly finished job that has not entered archival yet.
    pub fn done(job_id: impl Into<String>, owner: impl Into<String>, now_ms: i64) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Done,
            archived: false,
            archive_started_at_ms: None,
            archive_done_at_ms: None,
            last_mutated_at_ms: now_ms,
            owner: owner.into(),
            lease_owner: None,
        }
    }

    pub fn archive_completed(&self) -> bool {
        self.archive_done_at_ms.is_some()
    }

    pub fn is_leased_by(&self, identity: &str) -> bool {
        self.lease_owner.as_deref() == Some(identity)
    }
}
