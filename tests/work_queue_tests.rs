
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reclaimd::work_queue::{QueueSummary, WorkQueue, Worker};

/// Sleeps per item and records the peak number of concurrent calls.
#[derive(Default)]
struct SlowWorker {
    running: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl Worker<u32> for SlowWorker {
    type Error = String;

    async fn work(&self, item: &u32) -> Result<(), String> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        if item % 3 == 0 {
            return Err(format!("item {item} rejected"));
        }
        Ok(())
    }
}

#[reclaimd::test]
async fn never_exceeds_limit() {
    with_timeout!(5000, {
        let worker = Arc::new(SlowWorker::default());
        let queue = WorkQueue::start(4, Arc::clone(&worker), |_: &u32, _: &String| {});
        assert_eq!(queue.limit(), 4);
        for i in 1..=50u32 {
            queue.push(i).await.unwrap();
        }
        let summary = queue.close().await.unwrap();

        assert_eq!(summary.total(), 50);
        assert_eq!(worker.done.load(Ordering::SeqCst), 50);
        let peak = worker.peak.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak concurrency {peak} exceeded limit");
        assert!(peak >= 2, "queue never ran items concurrently");
    });
}

#[reclaimd::test]
async fn close_without_items_completes() {
    let worker = Arc::new(SlowWorker::default());
    let queue = WorkQueue::start(10, worker, |_: &u32, _: &String| {});
    let summary = with_timeout!(1000, { queue.close().await.unwrap() });
    assert_eq!(summary, QueueSummary::default());
}

#[reclaimd::test]
async fn failures_are_reported_and_do_not_stop_the_queue() {
    with_timeout!(5000, {
        let worker = Arc::new(SlowWorker::default());
        let failed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let hook = Arc::clone(&failed);
        let queue = WorkQueue::start(3, Arc::clone(&worker), move |item: &u32, err: &String| {
            assert!(err.contains("rejected"));
            hook.lock().unwrap().push(*item);
        });
        for i in 1..=9u32 {
            queue.push(i).await.unwrap();
        }
        let summary = queue.close().await.unwrap();

        assert_eq!(summary.succeeded, 6);
        assert_eq!(summary.failed, 3);
        let mut failed = failed.lock().unwrap().clone();
        failed.sort();
        assert_eq!(failed, vec![3, 6, 9]);
    });
}

#[reclaimd::test]
async fn close_waits_for_every_sender() {
    with_timeout!(5000, {
        let worker = Arc::new(SlowWorker::default());
        let queue = WorkQueue::start(2, Arc::clone(&worker), |_: &u32, _: &String| {});

        let mut producers = Vec::new();
        for base in [100u32, 200, 300] {
            let sender = queue.sender();
            producers.push(tokio::spawn(async move {
                for i in 1..=5 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    sender.push(base + i).await.unwrap();
                }
            }));
        }

        // Senders are still alive while close runs; it must wait for them.
        let summary = queue.close().await.unwrap();
        for p in producers {
            p.await.unwrap();
        }
        assert_eq!(summary.total(), 15);
        assert_eq!(worker.done.load(Ordering::SeqCst), 15);
    });
}

struct PanickingWorker;

#[async_trait]
impl Worker<u32> for PanickingWorker {
    type Error = String;

    async fn work(&self, item: &u32) -> Result<(), String> {
        if *item == 2 {
            panic!("worker blew up");
        }
        Ok(())
    }
}

#[reclaimd::test]
async fn panicking_item_counts_as_failure() {
    with_timeout!(5000, {
        let queue = WorkQueue::start(2, Arc::new(PanickingWorker), |_: &u32, _: &String| {});
        for i in 1..=3u32 {
            queue.push(i).await.unwrap();
        }
        let summary = queue.close().await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
    });
}

/// Flags that it started, then panics.
#[derive(Default)]
struct PanicsAfterStart {
    started: AtomicBool,
}

#[async_trait]
impl Worker<u32> for PanicsAfterStart {
    type Error = String;

    async fn work(&self, _item: &u32) -> Result<(), String> {
        self.started.store(true, Ordering::SeqCst);
        tokio::task::yield_now().await;
        panic!("worker blew up mid-flight");
    }
}

#[reclaimd::test]
async fn in_flight_count_recovers_after_panicking_item() {
    with_timeout!(5000, {
        let worker = Arc::new(PanicsAfterStart::default());
        let queue = WorkQueue::start(2, Arc::clone(&worker), |_: &u32, _: &String| {});
        assert_eq!(queue.in_flight(), 0);

        queue.push(1).await.unwrap();
        while !worker.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // The item unwinds; the count must fall back to zero.
        while queue.in_flight() != 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let summary = queue.close().await.unwrap();
        assert_eq!(summary.failed, 1);
    });
}
