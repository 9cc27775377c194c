//! Periodic reconciliation loop.
//!
//! Each cycle runs one full scan and waits for it to drain before sleeping for
//! the poll interval, so cycles never overlap. A failed cycle is logged and the
//! loop carries on; the next cycle re-derives everything from registry state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::job::now_epoch_ms;
use crate::metrics::Metrics;
use crate::registry::JobRegistry;
use crate::scanner::{ReclaimOptions, ScanError, ScanReport, StalenessScanner};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Run a single reconciliation cycle as of `now_ms` without metrics.
pub async fn run_cycle(
    registry: Arc<dyn JobRegistry>,
    options: &ReclaimOptions,
    now_ms: i64,
) -> Result<ScanReport, ScanError> {
    StalenessScanner::new(registry, options.clone())
        .scan(now_ms)
        .await
}

pub struct Reconciler {
    scanner: StalenessScanner,
    interval: Duration,
    metrics: Option<Metrics>,
}

impl Reconciler {
    pub fn new(registry: Arc<dyn JobRegistry>, options: ReclaimOptions, interval: Duration) -> Self {
        Self {
            scanner: StalenessScanner::new(registry, options),
            interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Metrics>) -> Self {
        self.scanner = self.scanner.with_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    /// Run one cycle against the wall clock and record its outcome.
    pub async fn run_once(&self) -> Result<ScanReport, ScanError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("reconcile", %cycle_id);
        async {
            if let Some(m) = &self.metrics {
                m.set_scanning(true);
            }
            let started = Instant::now();
            let result = self.scanner.scan(now_epoch_ms()).await;
            let elapsed = started.elapsed();

            if let Some(m) = &self.metrics {
                m.set_scanning(false);
                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(e) => e.kind(),
                };
                m.record_scan(outcome, elapsed.as_secs_f64());
            }

            match &result {
                Ok(report) => info!(
                    candidates = report.candidates(),
                    reclaimed = report.reclaimed,
                    skipped = report.skipped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "reconcile: cycle complete"
                ),
                Err(ScanError::Task(e)) => error!(error = %e, "reconcile: cycle aborted"),
                Err(ScanError::Queue(e)) => error!(error = %e, "reconcile: cycle aborted"),
                Err(e) => warn!(
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "reconcile: cycle failed, retrying next interval"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Run cycles until `shutdown` fires. Shutdown is only observed between
    /// cycles; a running cycle always drains first.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            identity = %self.scanner.options().identity,
            owner = ?self.scanner.options().owner,
            "reconcile: loop started"
        );
        loop {
            let _ = self.run_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.recv() => {
                    info!("reconcile: shutdown signal received");
                    break;
                }
            }
        }
    }

    /// Spawn [`Reconciler::run`] on the runtime.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
