//! Bounded worker queue.
//!
//! Items pushed into the queue are handed to a [`Worker`] with at most `limit`
//! invocations running at once. Any number of producers may push through
//! [`QueueSender`] clones. [`WorkQueue::close`] consumes the queue and resolves
//! once every sender is gone and all dispatched work has settled, so completion
//! is observed exactly once and nothing runs after it.
//!
//! A failing item is reported through the error hook and counted; it never stops
//! the queue or affects other in-flight items.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::error;

/// Per-item action run by the queue.
#[async_trait]
pub trait Worker<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    type Error: fmt::Display + Send + 'static;

    async fn work(&self, item: &T) -> Result<(), Self::Error>;
}

/// The queue no longer accepts items.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("work queue is closed")]
pub struct QueueClosed;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work queue dispatcher failed: {0}")]
    Dispatcher(#[from] JoinError),
}

/// Outcome counts for everything that went through a queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl QueueSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    fn record(&mut self, joined: Result<bool, JoinError>) {
        match joined {
            Ok(true) => self.succeeded += 1,
            Ok(false) => self.failed += 1,
            Err(e) => {
                error!(error = %e, "work queue item panicked");
                self.failed += 1;
            }
        }
    }
}

/// Producer handle. The queue can only complete once every clone is dropped.
pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue an item, waiting while the queue is saturated.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        self.tx.send(item).await.map_err(|_| QueueClosed)
    }
}

pub struct WorkQueue<T> {
    sender: QueueSender<T>,
    dispatcher: JoinHandle<QueueSummary>,
    in_flight: Arc<AtomicUsize>,
    limit: usize,
}

impl<T> WorkQueue<T>
where
    T: Send + Sync + 'static,
{
    /// Start a queue running `worker` on at most `limit` items at a time. A
    /// `limit` of zero is treated as one. `on_error` is called for every item
    /// whose work fails.
    pub fn start<W, F>(limit: usize, worker: Arc<W>, on_error: F) -> Self
    where
        W: Worker<T>,
        F: Fn(&T, &W::Error) + Send + Sync + 'static,
    {
        let limit = limit.max(1);
        let (tx, rx) = mpsc::channel(limit);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let dispatcher = tokio::spawn(dispatch(
            rx,
            worker,
            Arc::new(on_error),
            limit,
            Arc::clone(&in_flight),
        ));
        Self {
            sender: QueueSender { tx },
            dispatcher,
            in_flight,
            limit,
        }
    }

    /// A producer handle for this queue.
    pub fn sender(&self) -> QueueSender<T> {
        self.sender.clone()
    }

    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        self.sender.push(item).await
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of items whose work is currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting input and wait for all outstanding work to drain.
    ///
    /// Resolves after every [`QueueSender`] clone has been dropped and every
    /// dispatched item has finished.
    pub async fn close(self) -> Result<QueueSummary, QueueError> {
        let Self {
            sender, dispatcher, ..
        } = self;
        drop(sender);
        Ok(dispatcher.await?)
    }
}

/// Counts one running item; released on drop so a panicking worker still
/// leaves the count accurate.
struct Running<'a>(&'a AtomicUsize);

impl<'a> Running<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn dispatch<T, W, F>(
    mut rx: mpsc::Receiver<T>,
    worker: Arc<W>,
    on_error: Arc<F>,
    limit: usize,
    in_flight: Arc<AtomicUsize>,
) -> QueueSummary
where
    T: Send + Sync + 'static,
    W: Worker<T>,
    F: Fn(&T, &W::Error) + Send + Sync + 'static,
{
    let permits = Arc::new(Semaphore::new(limit));
    let mut running: JoinSet<bool> = JoinSet::new();
    let mut summary = QueueSummary::default();

    while let Some(item) = rx.recv().await {
        // Wait for a free slot before pulling more work off the channel.
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        while let Some(joined) = running.try_join_next() {
            summary.record(joined);
        }

        let worker = Arc::clone(&worker);
        let on_error = Arc::clone(&on_error);
        let in_flight = Arc::clone(&in_flight);
        running.spawn(async move {
            let running = Running::enter(&in_flight);
            let result = worker.work(&item).await;
            drop(running);
            drop(permit);
            match result {
                Ok(()) => true,
                Err(err) => {
                    on_error(&item, &err);
                    false
                }
            }
        });
    }

    while let Some(joined) = running.join_next().await {
        summary.record(joined);
    }
    summary
}
