//! Job registry collaborator.
//!
//! The registry owns job records. This crate needs exactly two things from it:
//! - filtered, streamed listings of job records
//! - the archive-start mutation, which doubles as the lease claim
//!
//! Implementations:
//! - `grpc`: client for a remote registry service
//! - `memory`: in-process registry used by tests and local runs

pub mod grpc;
pub mod memory;

pub use grpc::{GrpcRegistry, GrpcRegistryConfig};
pub use memory::{ArchiveCall, MemoryRegistry};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::job::{JobRecord, JobState};

/// Error types for registry operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("malformed job record: {0}")]
    Malformed(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Streamed listing result. Ends when the listing is exhausted; an `Err` item
/// means the listing failed and nothing further will be yielded.
pub type JobStream = BoxStream<'static, Result<JobRecord, RegistryError>>;

/// Options for the archive-start mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStart {
    /// When set, the registry records this identity as the job's lease owner.
    pub lease_owner: Option<String>,
}

impl ArchiveStart {
    /// Restart archival and tag the job as owned by `identity`.
    pub fn claimed_by(identity: impl Into<String>) -> Self {
        Self {
            lease_owner: Some(identity.into()),
        }
    }

    /// Restart archival without touching the lease owner.
    pub fn unclaimed() -> Self {
        Self { lease_owner: None }
    }
}

/// Trait for registry clients (remote or in-process)
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// List jobs matching `filter`. The listing is opened lazily: a failure to
    /// open surfaces as the first item of the stream.
    fn list_jobs(&self, filter: JobFilter) -> JobStream;

    /// Tag the job with `request.lease_owner` (when set) and (re)start its archival.
    /// Must be safe to call on a job whose archival already completed.
    async fn start_archive(&self, job_id: &str, request: ArchiveStart)
    -> Result<(), RegistryError>;
}

/// Predicate over job records understood by every registry.
///
/// Unset fields do not constrain. Time bounds are exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub owner: Option<String>,
    pub archived: Option<bool>,
    /// Excludes jobs whose lease owner equals this value. Unleased jobs pass.
    pub exclude_lease_owner: Option<String>,
    /// Matches jobs that started archiving strictly before this instant.
    /// Jobs that never started archiving do not match.
    pub archive_started_before_ms: Option<i64>,
    /// Matches jobs last mutated strictly before this instant.
    pub mutated_before_ms: Option<i64>,
    /// Maximum number of records the listing yields.
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn exclude_lease_owner(mut self, identity: impl Into<String>) -> Self {
        self.exclude_lease_owner = Some(identity.into());
        self
    }

    pub fn archive_started_before(mut self, cutoff_ms: i64) -> Self {
        self.archive_started_before_ms = Some(cutoff_ms);
        self
    }

    pub fn mutated_before(mut self, cutoff_ms: i64) -> Self {
        self.mutated_before_ms = Some(cutoff_ms);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `job` satisfies every constraint of this filter. `limit` is not
    /// a per-record constraint and is ignored here.
    pub fn matches(&self, job: &JobRecord) -> bool {
        if let Some(state) = self.state
            && job.state != state
        {
            return false;
        }
        if let Some(owner) = &self.owner
            && &job.owner != owner
        {
            return false;
        }
        if let Some(archived) = self.archived
            && job.archived != archived
        {
            return false;
        }
        if let Some(identity) = &self.exclude_lease_owner
            && job.is_leased_by(identity)
        {
            return false;
        }
        if let Some(cutoff) = self.archive_started_before_ms {
            match job.archive_started_at_ms {
                Some(started) if started < cutoff => {}
                _ => return false,
            }
        }
        if let Some(cutoff) = self.mutated_before_ms
            && job.last_mutated_at_ms >= cutoff
        {
            return false;
        }
        true
    }
}
