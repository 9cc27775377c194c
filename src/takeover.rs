//! Takeover action: claim a stale job and restart its archival.
//!
//! The archive-start mutation is both the recovery step and the ownership claim.
//! It carries no compare-and-swap; the registry serializes concurrent writes to
//! a job and the last claim wins. Restarting an already started archival is a
//! no-op from the job's point of view, so racing daemons converge.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::metrics::Metrics;
use crate::registry::{ArchiveStart, JobRegistry, RegistryError};
use crate::scanner::{ReclaimOptions, StaleCandidate};
use crate::work_queue::Worker;

/// What a reclaim did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Archival restarted with this daemon recorded as lease owner.
    Claimed,
    /// Archival had already completed; the start was re-issued without a claim
    /// so the registry's bookkeeping can settle.
    Reissued,
    /// Archival had already completed and re-issuing is disabled.
    Skipped,
}

impl ReclaimOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimOutcome::Claimed => "claimed",
            ReclaimOutcome::Reissued => "reissued",
            ReclaimOutcome::Skipped => "skipped",
        }
    }
}

pub struct Reclaimer {
    registry: Arc<dyn JobRegistry>,
    identity: String,
    reissue_completed_archives: bool,
    metrics: Option<Metrics>,
    skipped: AtomicUsize,
}

impl Reclaimer {
    pub fn new(registry: Arc<dyn JobRegistry>, options: &ReclaimOptions) -> Self {
        Self {
            registry,
            identity: options.identity.clone(),
            reissue_completed_archives: options.reissue_completed_archives,
            metrics: None,
            skipped: AtomicUsize::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Candidates left untouched because their archival had already completed.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Apply the takeover to one candidate. Errors are returned as-is; the next
    /// reconciliation cycle retries since the job stays stale until this succeeds.
    pub async fn reclaim(
        &self,
        candidate: &StaleCandidate,
    ) -> Result<ReclaimOutcome, RegistryError> {
        let job = &candidate.job;
        let (request, outcome) = if job.archive_completed() {
            if !self.reissue_completed_archives {
                debug!(job_id = %job.job_id, "takeover: archive already completed, skipping");
                self.skipped.fetch_add(1, Ordering::SeqCst);
                return Ok(ReclaimOutcome::Skipped);
            }
            (ArchiveStart::unclaimed(), ReclaimOutcome::Reissued)
        } else {
            (
                ArchiveStart::claimed_by(self.identity.clone()),
                ReclaimOutcome::Claimed,
            )
        };

        self.registry.start_archive(&job.job_id, request).await?;
        debug!(
            job_id = %job.job_id,
            source = %candidate.source,
            previous_lease_owner = ?job.lease_owner,
            outcome = outcome.as_str(),
            "takeover: job reset"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl Worker<StaleCandidate> for Reclaimer {
    type Error = RegistryError;

    async fn work(&self, item: &StaleCandidate) -> Result<(), RegistryError> {
        let Some(m) = &self.metrics else {
            return self.reclaim(item).await.map(|_| ());
        };
        let in_flight = m.reclaim_in_flight();
        let result = self.reclaim(item).await;
        drop(in_flight);
        // Failures are counted by the queue's error hook.
        if let Ok(outcome) = &result {
            m.record_reclaim(outcome.as_str());
        }
        result.map(|_| ())
    }
}
