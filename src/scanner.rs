//! Staleness scanner.
//!
//! One scan opens two independent listings against the registry:
//! - archive-abandoned: done jobs whose archival started more than twice the
//!   linger time ago, meaning the daemon driving it has gone away
//! - never-archived: done jobs untouched for longer than the takeover time
//!   that never entered archival
//!
//! Each listing runs in its own producer task feeding one bounded work queue
//! whose worker is the [`Reclaimer`]. The queue is closed only after both
//! producers have ended, and the scan resolves once it has drained.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::job::{JobRecord, JobState, duration_ms};
use crate::metrics::Metrics;
use crate::registry::{JobFilter, JobRegistry, JobStream, RegistryError};
use crate::takeover::Reclaimer;
use crate::work_queue::{QueueError, QueueSender, WorkQueue};

pub const DEFAULT_LINGER: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_TAKEOVER_AFTER: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;
pub const DEFAULT_ARCHIVED_SCAN_LIMIT: usize = 10_000;
pub const DEFAULT_UNARCHIVED_SCAN_LIMIT: usize = 1_000;

/// Everything one reclaim pass needs to know about this daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimOptions {
    /// This daemon's identity, written as the lease owner of claimed jobs.
    pub identity: String,
    /// Only jobs submitted by this owner are considered. `None` considers all.
    pub owner: Option<String>,
    /// How long a finished job is expected to stay before archival is overdue.
    pub linger: Duration,
    /// How long a finished, unarchived job may sit untouched before takeover.
    pub takeover_after: Duration,
    /// Maximum number of reclaims in flight at once.
    pub concurrency_limit: usize,
    pub archived_scan_limit: usize,
    pub unarchived_scan_limit: usize,
    /// Re-issue archive start (without claiming) for jobs whose archival already
    /// completed. When false such jobs are skipped.
    pub reissue_completed_archives: bool,
}

impl ReclaimOptions {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            owner: None,
            linger: DEFAULT_LINGER,
            takeover_after: DEFAULT_TAKEOVER_AFTER,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            archived_scan_limit: DEFAULT_ARCHIVED_SCAN_LIMIT,
            unarchived_scan_limit: DEFAULT_UNARCHIVED_SCAN_LIMIT,
            reissue_completed_archives: true,
        }
    }

    fn scoped(&self, filter: JobFilter) -> JobFilter {
        let filter = filter
            .state(JobState::Done)
            .exclude_lease_owner(self.identity.clone());
        match &self.owner {
            Some(owner) => filter.owner(owner.clone()),
            None => filter,
        }
    }

    /// Done jobs whose archival started strictly more than `2 * linger` before `now_ms`.
    pub fn archive_abandoned_filter(&self, now_ms: i64) -> JobFilter {
        let cutoff = now_ms.saturating_sub(duration_ms(self.linger).saturating_mul(2));
        self.scoped(
            JobFilter::new()
                .archived(true)
                .archive_started_before(cutoff)
                .limit(self.archived_scan_limit),
        )
    }

    /// Done, unarchived jobs last mutated strictly more than `takeover_after` before `now_ms`.
    pub fn never_archived_filter(&self, now_ms: i64) -> JobFilter {
        let cutoff = now_ms.saturating_sub(duration_ms(self.takeover_after));
        self.scoped(
            JobFilter::new()
                .archived(false)
                .mutated_before(cutoff)
                .limit(self.unarchived_scan_limit),
        )
    }
}

/// Which listing surfaced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaleSource {
    /// Archival started but was abandoned.
    ArchiveAbandoned,
    /// Archival never started.
    NeverArchived,
}

impl StaleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaleSource::ArchiveAbandoned => "archive_abandoned",
            StaleSource::NeverArchived => "never_archived",
        }
    }
}

impl fmt::Display for StaleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stale job on its way to the reclaimer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleCandidate {
    pub source: StaleSource,
    pub job: JobRecord,
}

impl StaleCandidate {
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }
}

/// Counts for one completed scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub archive_abandoned: usize,
    pub never_archived: usize,
    /// Candidates an archive-start mutation was issued for.
    pub reclaimed: usize,
    /// Candidates left alone because their archival had already completed.
    pub skipped: usize,
    pub failed: usize,
}

impl ScanReport {
    pub fn candidates(&self) -> usize {
        self.archive_abandoned + self.never_archived
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("{stream} listing failed: {error}")]
    Listing {
        stream: StaleSource,
        #[source]
        error: RegistryError,
        report: ScanReport,
    },
    #[error("{} of {} reclaims failed, first error: {first}", .report.failed, .report.candidates())]
    Reclaim { report: ScanReport, first: String },
    #[error("scan task failed: {0}")]
    Task(#[from] JoinError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ScanError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::Listing { .. } => "listing_error",
            ScanError::Reclaim { .. } => "reclaim_error",
            ScanError::Task(_) | ScanError::Queue(_) => "task_error",
        }
    }
}

/// Finds stale jobs and reclaims them through a bounded queue.
pub struct StalenessScanner {
    registry: Arc<dyn JobRegistry>,
    options: ReclaimOptions,
    metrics: Option<Metrics>,
}

impl StalenessScanner {
    pub fn new(registry: Arc<dyn JobRegistry>, options: ReclaimOptions) -> Self {
        Self {
            registry,
            options,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn options(&self) -> &ReclaimOptions {
        &self.options
    }

    /// Run one scan as of `now_ms`. Resolves only after both listings ended and
    /// every dispatched reclaim settled, even when a listing fails.
    ///
    /// A listing error is logged as soon as it occurs, but it is returned only
    /// once the other listing and the queue have drained. Callers never see a
    /// scan fail while its reclaims are still running, so the next cycle cannot
    /// overlap this one.
    pub async fn scan(&self, now_ms: i64) -> Result<ScanReport, ScanError> {
        let reclaimer = Arc::new(
            Reclaimer::new(Arc::clone(&self.registry), &self.options)
                .with_metrics(self.metrics.clone()),
        );

        let first_failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let hook_failure = Arc::clone(&first_failure);
        let hook_metrics = self.metrics.clone();
        let queue = WorkQueue::start(
            self.options.concurrency_limit,
            Arc::clone(&reclaimer),
            move |candidate: &StaleCandidate, err: &RegistryError| {
                warn!(
                    job_id = %candidate.job_id(),
                    source = %candidate.source,
                    error = %err,
                    "takeover: reclaim failed"
                );
                if let Some(m) = &hook_metrics {
                    m.record_reclaim("failed");
                }
                let mut first = hook_failure.lock().unwrap_or_else(|p| p.into_inner());
                if first.is_none() {
                    *first = Some(format!("{}: {err}", candidate.job_id()));
                }
            },
        );

        let abandoned_filter = self.options.archive_abandoned_filter(now_ms);
        let unarchived_filter = self.options.never_archived_filter(now_ms);
        debug!(
            ?abandoned_filter,
            ?unarchived_filter,
            "takeover: opening listings"
        );

        let abandoned = tokio::spawn(feed(
            self.registry.list_jobs(abandoned_filter.clone()),
            abandoned_filter,
            StaleSource::ArchiveAbandoned,
            queue.sender(),
            self.metrics.clone(),
        ));
        let unarchived = tokio::spawn(feed(
            self.registry.list_jobs(unarchived_filter.clone()),
            unarchived_filter,
            StaleSource::NeverArchived,
            queue.sender(),
            self.metrics.clone(),
        ));

        // Both listings must end before the queue may close.
        let (abandoned, unarchived) = tokio::join!(abandoned, unarchived);
        let summary = queue.close().await?;
        let abandoned = abandoned?;
        let unarchived = unarchived?;

        let skipped = reclaimer.skipped();
        let report = ScanReport {
            archive_abandoned: abandoned.pushed,
            never_archived: unarchived.pushed,
            reclaimed: summary.succeeded.saturating_sub(skipped),
            skipped,
            failed: summary.failed,
        };
        info!(
            archive_abandoned = report.archive_abandoned,
            never_archived = report.never_archived,
            reclaimed = report.reclaimed,
            skipped = report.skipped,
            failed = report.failed,
            "takeover: scan drained"
        );

        for (stream, fed) in [
            (StaleSource::ArchiveAbandoned, abandoned),
            (StaleSource::NeverArchived, unarchived),
        ] {
            if let Some(error) = fed.error {
                return Err(ScanError::Listing {
                    stream,
                    error,
                    report,
                });
            }
        }
        if report.failed > 0 {
            let first = first_failure
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
                .unwrap_or_else(|| "worker panicked".to_string());
            return Err(ScanError::Reclaim { report, first });
        }
        Ok(report)
    }
}

/// What one producer did before its listing ended.
struct Fed {
    pushed: usize,
    error: Option<RegistryError>,
}

async fn feed(
    mut stream: JobStream,
    filter: JobFilter,
    source: StaleSource,
    queue: QueueSender<StaleCandidate>,
    metrics: Option<Metrics>,
) -> Fed {
    let mut pushed = 0;
    while let Some(item) = stream.next().await {
        let job = match item {
            Ok(job) => job,
            Err(error) => {
                warn!(source = %source, pushed, error = %error, "takeover: listing failed");
                return Fed {
                    pushed,
                    error: Some(error),
                };
            }
        };
        if !filter.matches(&job) {
            debug!(
                job_id = %job.job_id,
                source = %source,
                "takeover: registry returned a job outside the scan filter, skipping"
            );
            continue;
        }
        if queue.push(StaleCandidate { source, job }).await.is_err() {
            break;
        }
        pushed += 1;
        if let Some(m) = &metrics {
            m.record_stale_job(source.as_str());
        }
    }
    debug!(source = %source, pushed, "takeover: listing ended");
    Fed {
        pushed,
        error: None,
    }
}
