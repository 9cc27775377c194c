//! Prometheus metrics for reclaimd.
//!
//! Initialize once at startup and hand clones to the components that record:
//! ```ignore
//! let metrics = reclaimd::metrics::init()?;
//! let reconciler = Reconciler::new(registry, options, interval).with_metrics(Some(metrics.clone()));
//! ```
//!
//! The HTTP side lives in `server`.

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
    core::Collector,
};

/// Buckets for whole-scan durations (in seconds). Scans are dominated by
/// registry round trips and can run for minutes on large backlogs.
const SCAN_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

/// Metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    scans: CounterVec,
    scan_duration: Histogram,
    scan_in_progress: Gauge,
    stale_jobs: CounterVec,
    reclaims: CounterVec,
    reclaims_in_flight: Gauge,
}

impl Metrics {
    /// Record a finished scan. `outcome` is "ok" or a `ScanError::kind()`.
    pub fn record_scan(&self, outcome: &str, duration_secs: f64) {
        self.scans.with_label_values(&[outcome]).inc();
        self.scan_duration.observe(duration_secs);
    }

    /// Flip the idle/scanning gauge.
    pub fn set_scanning(&self, scanning: bool) {
        self.scan_in_progress.set(if scanning { 1.0 } else { 0.0 });
    }

    /// Record a stale job handed to the reclaim queue.
    pub fn record_stale_job(&self, source: &str) {
        self.stale_jobs.with_label_values(&[source]).inc();
    }

    /// Record a finished reclaim: "claimed", "reissued", "skipped" or "failed".
    pub fn record_reclaim(&self, outcome: &str) {
        self.reclaims.with_label_values(&[outcome]).inc();
    }

    /// Count a reclaim as running until the returned guard is dropped.
    pub fn reclaim_in_flight(&self) -> InFlightGuard {
        self.reclaims_in_flight.inc();
        InFlightGuard(self.reclaims_in_flight.clone())
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Decrements the in-flight gauge when dropped, including during unwinding.
pub struct InFlightGuard(Gauge);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // Log but don't fail - metric may already be registered
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a fresh Prometheus registry.
///
/// Returns a `Metrics` handle that can be cloned and passed to components.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let scans = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "reclaimd_scans_total",
                "Total number of reconciliation scans by outcome",
            ),
            &["outcome"],
        )?,
    );

    let scan_duration = register(
        &registry,
        Histogram::with_opts(
            HistogramOpts::new(
                "reclaimd_scan_duration_seconds",
                "Wall time of a reconciliation scan including queue drain",
            )
            .buckets(SCAN_DURATION_BUCKETS.to_vec()),
        )?,
    );

    let scan_in_progress = register(
        &registry,
        Gauge::with_opts(Opts::new(
            "reclaimd_scan_in_progress",
            "1 while a reconciliation scan is running, 0 while idle",
        ))?,
    );

    let stale_jobs = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "reclaimd_stale_jobs_total",
                "Stale jobs found by the scanner, by listing",
            ),
            &["source"],
        )?,
    );

    let reclaims = register(
        &registry,
        CounterVec::new(
            Opts::new("reclaimd_reclaims_total", "Takeover actions by outcome"),
            &["outcome"],
        )?,
    );

    let reclaims_in_flight = register(
        &registry,
        Gauge::with_opts(Opts::new(
            "reclaimd_reclaims_in_flight",
            "Takeover actions currently running",
        ))?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        scans,
        scan_duration,
        scan_in_progress,
        stale_jobs,
        reclaims,
        reclaims_in_flight,
    })
}
