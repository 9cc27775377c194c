//! gRPC client for a remote job registry.

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryFutureExt};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::debug;

use crate::job::{JobRecord, JobState};
use crate::pb;
use crate::pb::job_registry_client::JobRegistryClient;
use crate::registry::{ArchiveStart, JobFilter, JobRegistry, JobStream, RegistryError};

impl From<tonic::transport::Error> for RegistryError {
    fn from(e: tonic::transport::Error) -> Self {
        RegistryError::Connection(e.to_string())
    }
}

impl From<Status> for RegistryError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::NotFound => RegistryError::JobNotFound(status.message().to_string()),
            Code::Unavailable => RegistryError::Unavailable(status.message().to_string()),
            _ => RegistryError::Rpc(status.to_string()),
        }
    }
}

impl From<JobState> for pb::JobState {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Queued => pb::JobState::Queued,
            JobState::Running => pb::JobState::Running,
            JobState::Done => pb::JobState::Done,
        }
    }
}

fn job_state_from_wire(raw: i32) -> Option<JobState> {
    match pb::JobState::try_from(raw).ok()? {
        pb::JobState::Queued => Some(JobState::Queued),
        pb::JobState::Running => Some(JobState::Running),
        pb::JobState::Done => Some(JobState::Done),
        pb::JobState::Unspecified => None,
    }
}

impl TryFrom<pb::Job> for JobRecord {
    type Error = RegistryError;

    fn try_from(job: pb::Job) -> Result<Self, Self::Error> {
        if job.job_id.is_empty() {
            return Err(RegistryError::Malformed("job without id".to_string()));
        }
        let Some(state) = job_state_from_wire(job.state) else {
            return Err(RegistryError::Malformed(format!(
                "job {} has unknown state {}",
                job.job_id, job.state
            )));
        };
        Ok(JobRecord {
            job_id: job.job_id,
            state,
            archived: job.archived,
            archive_started_at_ms: job.archive_started_at_ms,
            archive_done_at_ms: job.archive_done_at_ms,
            last_mutated_at_ms: job.last_mutated_at_ms,
            owner: job.owner,
            lease_owner: job.lease_owner,
        })
    }
}

impl From<JobRecord> for pb::Job {
    fn from(job: JobRecord) -> Self {
        pb::Job {
            job_id: job.job_id,
            state: pb::JobState::from(job.state) as i32,
            archived: job.archived,
            archive_started_at_ms: job.archive_started_at_ms,
            archive_done_at_ms: job.archive_done_at_ms,
            last_mutated_at_ms: job.last_mutated_at_ms,
            owner: job.owner,
            lease_owner: job.lease_owner,
        }
    }
}

impl From<&JobFilter> for pb::ListJobsRequest {
    fn from(filter: &JobFilter) -> Self {
        pb::ListJobsRequest {
            state: filter.state.map(|s| pb::JobState::from(s) as i32),
            owner: filter.owner.clone(),
            archived: filter.archived,
            exclude_lease_owner: filter.exclude_lease_owner.clone(),
            archive_started_before_ms: filter.archive_started_before_ms,
            mutated_before_ms: filter.mutated_before_ms,
            limit: filter
                .limit
                .map(|l| u32::try_from(l).unwrap_or(u32::MAX)),
        }
    }
}

impl TryFrom<pb::ListJobsRequest> for JobFilter {
    type Error = RegistryError;

    fn try_from(req: pb::ListJobsRequest) -> Result<Self, Self::Error> {
        let state = match req.state {
            Some(raw) => Some(job_state_from_wire(raw).ok_or_else(|| {
                RegistryError::Malformed(format!("unknown state filter {raw}"))
            })?),
            None => None,
        };
        Ok(JobFilter {
            state,
            owner: req.owner,
            archived: req.archived,
            exclude_lease_owner: req.exclude_lease_owner,
            archive_started_before_ms: req.archive_started_before_ms,
            mutated_before_ms: req.mutated_before_ms,
            limit: req.limit.map(|l| l as usize),
        })
    }
}

/// Configuration for the registry client
#[derive(Debug, Clone)]
pub struct GrpcRegistryConfig {
    /// Registry server address (e.g., "http://localhost:50061")
    pub address: String,
    /// Connection timeout
    pub connect_timeout_ms: u64,
    /// Per-request timeout. Applies to a whole listing stream, so it must cover
    /// the largest listing the scanner asks for.
    pub request_timeout_ms: u64,
}

impl Default for GrpcRegistryConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:50061".to_string(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
        }
    }
}

/// Registry client speaking the `reclaimd.v1.JobRegistry` service.
#[derive(Debug, Clone)]
pub struct GrpcRegistry {
    client: JobRegistryClient<Channel>,
    address: String,
}

impl GrpcRegistry {
    fn endpoint(config: &GrpcRegistryConfig) -> Result<Endpoint, RegistryError> {
        // Ensure address has http:// scheme for gRPC connection
        let address = if config.address.starts_with("http://")
            || config.address.starts_with("https://")
        {
            config.address.clone()
        } else {
            format!("http://{}", config.address)
        };
        Ok(Endpoint::from_shared(address)
            .map_err(|e| RegistryError::Connection(e.to_string()))?
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms)))
    }

    /// Connect eagerly, failing if the registry is unreachable.
    pub async fn connect(config: &GrpcRegistryConfig) -> Result<Self, RegistryError> {
        let endpoint = Self::endpoint(config)?;
        let channel = endpoint.connect().await?;
        debug!(address = %config.address, "connected to job registry");
        Ok(Self {
            client: JobRegistryClient::new(channel),
            address: config.address.clone(),
        })
    }

    /// Build a client that connects on first use. Connection failures then
    /// surface per call, which the reconciler logs and retries next cycle.
    pub fn connect_lazy(config: &GrpcRegistryConfig) -> Result<Self, RegistryError> {
        let channel = Self::endpoint(config)?.connect_lazy();
        Ok(Self {
            client: JobRegistryClient::new(channel),
            address: config.address.clone(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl JobRegistry for GrpcRegistry {
    fn list_jobs(&self, filter: JobFilter) -> JobStream {
        let mut client = self.client.clone();
        let request = pb::ListJobsRequest::from(&filter);
        async move {
            let response = client.list_jobs(request).await?;
            Ok::<_, RegistryError>(response.into_inner().map(|item| {
                item.map_err(RegistryError::from)
                    .and_then(JobRecord::try_from)
            }))
        }
        .try_flatten_stream()
        .boxed()
    }

    async fn start_archive(
        &self,
        job_id: &str,
        request: ArchiveStart,
    ) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        client
            .start_archive(pb::StartArchiveRequest {
                job_id: job_id.to_string(),
                lease_owner: request.lease_owner,
            })
            .await?;
        Ok(())
    }
}
