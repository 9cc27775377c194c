//! In-process job registry.
//!
//! Serves listings page by page the way a remote registry would, so a listing
//! observes mutations made while it is being consumed. Besides the plain
//! registry behaviour it records every archive-start call and supports fault
//! injection, which is what the scanner and reconciler tests drive.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tracing::debug;

use crate::job::{JobRecord, now_epoch_ms};
use crate::registry::{ArchiveStart, JobFilter, JobRegistry, JobStream, RegistryError};

const DEFAULT_PAGE_SIZE: usize = 100;

/// An archive-start call as received by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveCall {
    pub job_id: String,
    pub lease_owner: Option<String>,
    pub at_ms: i64,
}

/// Listing failure injected for listings whose `archived` constraint matches.
#[derive(Debug, Clone)]
struct ListFault {
    archived: Option<bool>,
    after_records: usize,
    message: String,
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<String, JobRecord>,
    now_ms: Option<i64>,
    list_faults: Vec<ListFault>,
    archive_faults: HashSet<String>,
    archive_calls: Vec<ArchiveCall>,
    mutation_delay: Option<Duration>,
    listings_opened: usize,
}

struct Shared {
    state: Mutex<State>,
    page_size: usize,
    mutations_in_flight: AtomicUsize,
    max_mutations_in_flight: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory registry. Cloning shares the underlying records.
#[derive(Clone)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Create a registry that serves listings in pages of `page_size` records.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                page_size: page_size.max(1),
                mutations_in_flight: AtomicUsize::new(0),
                max_mutations_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a new registry wrapped in Arc
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace a job record.
    pub fn insert(&self, job: JobRecord) {
        self.shared.lock().jobs.insert(job.job_id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.shared.lock().jobs.get(job_id).cloned()
    }

    /// Pin the registry clock used to stamp mutations. Unpinned, the wall clock is used.
    pub fn set_now(&self, now_ms: i64) {
        self.shared.lock().now_ms = Some(now_ms);
    }

    /// Make every listing whose `archived` constraint equals `archived` fail after
    /// yielding `after_records` records.
    pub fn fail_listings(&self, archived: Option<bool>, after_records: usize, message: &str) {
        self.shared.lock().list_faults.push(ListFault {
            archived,
            after_records,
            message: message.to_string(),
        });
    }

    /// Make archive-start calls for `job_id` fail.
    pub fn fail_archive_start(&self, job_id: &str) {
        self.shared.lock().archive_faults.insert(job_id.to_string());
    }

    /// Delay every archive-start call by `delay` before it is applied.
    pub fn set_mutation_delay(&self, delay: Duration) {
        self.shared.lock().mutation_delay = Some(delay);
    }

    /// All archive-start calls received so far, in arrival order.
    pub fn archive_calls(&self) -> Vec<ArchiveCall> {
        self.shared.lock().archive_calls.clone()
    }

    /// Number of listings opened so far.
    pub fn listings_opened(&self) -> usize {
        self.shared.lock().listings_opened
    }

    /// Highest number of archive-start calls observed running at the same time.
    pub fn max_concurrent_mutations(&self) -> usize {
        self.shared.max_mutations_in_flight.load(Ordering::SeqCst)
    }

    fn apply_archive_start(&self, job_id: &str, request: ArchiveStart) -> Result<(), RegistryError> {
        let mut state = self.shared.lock();
        let now_ms = state.now_ms.unwrap_or_else(now_epoch_ms);
        state.archive_calls.push(ArchiveCall {
            job_id: job_id.to_string(),
            lease_owner: request.lease_owner.clone(),
            at_ms: now_ms,
        });

        if state.archive_faults.contains(job_id) {
            return Err(RegistryError::Unavailable(format!(
                "injected archive-start failure for {job_id}"
            )));
        }

        let Some(job) = state.jobs.get_mut(job_id) else {
            return Err(RegistryError::JobNotFound(job_id.to_string()));
        };
        job.archived = true;
        job.archive_started_at_ms = Some(now_ms);
        job.last_mutated_at_ms = now_ms;
        if let Some(owner) = request.lease_owner {
            job.lease_owner = Some(owner);
        }
        Ok(())
    }
}

/// Decrements the in-flight mutation counter when dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
    fn list_jobs(&self, filter: JobFilter) -> JobStream {
        let fault = {
            let mut state = self.shared.lock();
            state.listings_opened += 1;
            state
                .list_faults
                .iter()
                .find(|f| f.archived.is_none() || f.archived == filter.archived)
                .cloned()
        };
        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            remaining: filter.limit.unwrap_or(usize::MAX),
            filter,
            fault,
            marker: None,
            page: VecDeque::new(),
            yielded: 0,
            finished: false,
        };
        stream::unfold(cursor, |mut cursor| async move {
            let item = cursor.next().await?;
            Some((item, cursor))
        })
        .boxed()
    }

    async fn start_archive(
        &self,
        job_id: &str,
        request: ArchiveStart,
    ) -> Result<(), RegistryError> {
        let in_flight = self.shared.mutations_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.shared.mutations_in_flight);
        self.shared
            .max_mutations_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay = self.shared.lock().mutation_delay;
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        self.apply_archive_start(job_id, request)
    }
}

/// Paging state of one listing.
struct Cursor {
    shared: Arc<Shared>,
    filter: JobFilter,
    fault: Option<ListFault>,
    /// Last job id handed out; the next page starts after it.
    marker: Option<String>,
    page: VecDeque<JobRecord>,
    remaining: usize,
    yielded: usize,
    finished: bool,
}

impl Cursor {
    async fn next(&mut self) -> Option<Result<JobRecord, RegistryError>> {
        if self.finished {
            return None;
        }
        if let Some(fault) = &self.fault
            && self.yielded >= fault.after_records
        {
            self.finished = true;
            return Some(Err(RegistryError::Unavailable(fault.message.clone())));
        }
        if self.remaining == 0 {
            self.finished = true;
            return None;
        }
        if self.page.is_empty() {
            tokio::task::yield_now().await;
            self.fetch_page();
        }
        let Some(job) = self.page.pop_front() else {
            self.finished = true;
            return None;
        };
        self.marker = Some(job.job_id.clone());
        self.remaining -= 1;
        self.yielded += 1;
        Some(Ok(job))
    }

    fn fetch_page(&mut self) {
        let want = self.shared.page_size.min(self.remaining);
        let state = self.shared.lock();
        let lower = match &self.marker {
            Some(marker) => Bound::Excluded(marker.clone()),
            None => Bound::Unbounded,
        };
        self.page.extend(
            state
                .jobs
                .range::<String, _>((lower, Bound::Unbounded))
                .map(|(_, job)| job)
                .filter(|job| self.filter.matches(job))
                .take(want)
                .cloned(),
        );
        debug!(
            fetched = self.page.len(),
            marker = ?self.marker,
            "memory registry: served listing page"
        );
    }
}
