
use std::sync::Arc;
use std::time::Duration;

use reclaimd::job::now_epoch_ms;
use reclaimd::metrics;
use reclaimd::reconciler::{Reconciler, run_cycle};
use reclaimd::registry::MemoryRegistry;
use reclaimd::scanner::ScanError;
use test_helpers::*;
use tokio::sync::broadcast;

async fn wait_for_listings(registry: &MemoryRegistry, at_least: usize) {
    while registry.listings_opened() < at_least {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[reclaimd::test]
async fn run_cycle_reclaims_and_second_cycle_finds_nothing() {
    let registry = MemoryRegistry::new();
    registry.set_now(NOW_MS);
    registry.insert(stale_archived("a", NOW_MS, Some("reclaimd-b")));
    registry.insert(stale_unarchived("u", NOW_MS));
    registry.insert(fresh_unarchived("f", NOW_MS));
    let opts = options("reclaimd-a");

    let first = run_cycle(Arc::new(registry.clone()), &opts, NOW_MS)
        .await
        .unwrap();
    assert_eq!(first.reclaimed, 2);

    let second = run_cycle(Arc::new(registry.clone()), &opts, NOW_MS + 10_000)
        .await
        .unwrap();
    assert_eq!(second.candidates(), 0);
    assert_eq!(registry.archive_calls().len(), 2);
}

#[reclaimd::test]
async fn run_once_reports_failures_and_records_metrics() {
    let registry = MemoryRegistry::new();
    registry.insert(stale_unarchived("u", now_epoch_ms()));
    registry.fail_listings(Some(true), 0, "down");
    let metrics = metrics::init().unwrap();

    let reconciler = Reconciler::new(
        Arc::new(registry.clone()),
        options("reclaimd-a"),
        Duration::from_secs(10),
    )
    .with_metrics(Some(metrics.clone()));
    let err = reconciler.run_once().await.unwrap_err();
    assert!(matches!(err, ScanError::Listing { .. }));

    let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
    assert!(text.contains("reclaimd_scans_total{outcome=\"listing_error\"} 1"));
    assert!(text.contains("reclaimd_reclaims_total{outcome=\"claimed\"} 1"));
    assert!(text.contains("reclaimd_stale_jobs_total{source=\"never_archived\"} 1"));
    assert!(text.contains("reclaimd_scan_in_progress 0"));
    assert!(text.contains("reclaimd_reclaims_in_flight 0"));
}

#[reclaimd::test]
async fn loop_keeps_running_after_failed_cycles() {
    with_timeout!(5000, {
        let registry = MemoryRegistry::new();
        registry.fail_listings(None, 0, "registry unreachable");
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        let handle = Reconciler::new(
            Arc::new(registry.clone()),
            options("reclaimd-a"),
            Duration::from_millis(5),
        )
        .spawn(shutdown_rx);

        // Two listings per cycle; wait for at least three cycles.
        wait_for_listings(&registry, 6).await;
        assert!(!handle.is_finished());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    });
}

#[reclaimd::test]
async fn loop_reclaims_jobs_that_become_stale_later() {
    with_timeout!(5000, {
        let registry = MemoryRegistry::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let handle = Reconciler::new(
            Arc::new(registry.clone()),
            options("reclaimd-a"),
            Duration::from_millis(5),
        )
        .spawn(shutdown_rx);

        wait_for_listings(&registry, 2).await;
        registry.insert(stale_unarchived("late", now_epoch_ms()));
        while registry.archive_calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(
            registry.get("late").unwrap().lease_owner.as_deref(),
            Some("reclaimd-a")
        );
    });
}

#[reclaimd::test]
async fn shutdown_stops_the_loop_between_cycles() {
    with_timeout!(5000, {
        let registry = MemoryRegistry::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let handle = Reconciler::new(
            Arc::new(registry.clone()),
            options("reclaimd-a"),
            Duration::from_secs(3600),
        )
        .spawn(shutdown_rx);

        wait_for_listings(&registry, 2).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // The first cycle ran; the hour-long sleep was cut short.
        assert_eq!(registry.listings_opened(), 2);
    });
}
