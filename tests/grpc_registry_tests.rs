
use std::net::SocketAddr;
use std::pin::Pin;

use futures::{Stream, StreamExt, TryStreamExt};
use reclaimd::job::JobRecord;
use reclaimd::pb;
use reclaimd::pb::job_registry_server::{JobRegistry as JobRegistryService, JobRegistryServer};
use reclaimd::registry::{
    ArchiveStart, GrpcRegistry, GrpcRegistryConfig, JobFilter, JobRegistry, MemoryRegistry,
    RegistryError,
};
use reclaimd::scanner::StalenessScanner;
use test_helpers::*;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

/// Registry service backed by a `MemoryRegistry`.
struct MemoryService {
    registry: MemoryRegistry,
}

fn to_status(e: RegistryError) -> Status {
    match e {
        RegistryError::JobNotFound(msg) => Status::not_found(msg),
        RegistryError::Unavailable(msg) => Status::unavailable(msg),
        RegistryError::Malformed(msg) => Status::invalid_argument(msg),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl JobRegistryService for MemoryService {
    type ListJobsStream = Pin<Box<dyn Stream<Item = Result<pb::Job, Status>> + Send + 'static>>;

    async fn list_jobs(
        &self,
        request: Request<pb::ListJobsRequest>,
    ) -> Result<Response<Self::ListJobsStream>, Status> {
        let filter = JobFilter::try_from(request.into_inner()).map_err(to_status)?;
        let stream = self
            .registry
            .list_jobs(filter)
            .map(|item| item.map(pb::Job::from).map_err(to_status));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn start_archive(
        &self,
        request: Request<pb::StartArchiveRequest>,
    ) -> Result<Response<pb::StartArchiveResponse>, Status> {
        let req = request.into_inner();
        self.registry
            .start_archive(
                &req.job_id,
                ArchiveStart {
                    lease_owner: req.lease_owner,
                },
            )
            .await
            .map_err(to_status)?;
        Ok(Response::new(pb::StartArchiveResponse {}))
    }
}

async fn serve(registry: MemoryRegistry) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(JobRegistryServer::new(MemoryService { registry }))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    addr
}

async fn client(addr: SocketAddr) -> GrpcRegistry {
    let config = GrpcRegistryConfig {
        address: addr.to_string(),
        connect_timeout_ms: 2_000,
        request_timeout_ms: 5_000,
    };
    GrpcRegistry::connect(&config).await.unwrap()
}

#[reclaimd::test]
async fn streams_filtered_listing() {
    let registry = MemoryRegistry::with_page_size(2);
    for i in 0..5 {
        registry.insert(stale_unarchived(&format!("u-{i}"), NOW_MS));
    }
    registry.insert(stale_archived("a-0", NOW_MS, Some("reclaimd-b")));
    let client = client(serve(registry.clone()).await).await;

    let filter = options("reclaimd-a").never_archived_filter(NOW_MS);
    let jobs: Vec<JobRecord> = client.list_jobs(filter).try_collect().await.unwrap();
    assert_eq!(jobs.len(), 5);
    assert_eq!(jobs[0], registry.get("u-0").unwrap());

    let archived: Vec<JobRecord> = client
        .list_jobs(JobFilter::new().archived(true).limit(1))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].lease_owner.as_deref(), Some("reclaimd-b"));
}

#[reclaimd::test]
async fn start_archive_round_trips_lease_owner() {
    let registry = MemoryRegistry::new();
    registry.set_now(NOW_MS);
    registry.insert(stale_unarchived("claim", NOW_MS));
    registry.insert(stale_unarchived("reissue", NOW_MS));
    let client = client(serve(registry.clone()).await).await;

    client
        .start_archive("claim", ArchiveStart::claimed_by("reclaimd-a"))
        .await
        .unwrap();
    client
        .start_archive("reissue", ArchiveStart::unclaimed())
        .await
        .unwrap();

    assert_eq!(
        registry.get("claim").unwrap().lease_owner.as_deref(),
        Some("reclaimd-a")
    );
    let reissued = registry.get("reissue").unwrap();
    assert!(reissued.archived);
    assert_eq!(reissued.lease_owner, None);
}

#[reclaimd::test]
async fn maps_not_found_status() {
    let client = client(serve(MemoryRegistry::new()).await).await;
    let err = client
        .start_archive("missing", ArchiveStart::claimed_by("reclaimd-a"))
        .await
        .unwrap_err();
    assert_eq!(err, RegistryError::JobNotFound("missing".to_string()));
}

#[reclaimd::test]
async fn mid_stream_error_ends_listing() {
    let registry = MemoryRegistry::with_page_size(1);
    for i in 0..4 {
        registry.insert(stale_unarchived(&format!("u-{i}"), NOW_MS));
    }
    registry.fail_listings(None, 2, "shard moved");
    let client = client(serve(registry).await).await;

    let items: Vec<Result<JobRecord, RegistryError>> =
        client.list_jobs(JobFilter::new()).collect().await;
    assert_eq!(items.len(), 3);
    assert!(items[0].is_ok() && items[1].is_ok());
    assert_eq!(
        items[2],
        Err(RegistryError::Unavailable("shard moved".to_string()))
    );
}

#[reclaimd::test]
async fn unreachable_registry_fails_listing_lazily() {
    // Bind then drop to get a port nothing listens on.
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let client = GrpcRegistry::connect_lazy(&GrpcRegistryConfig {
        address: format!("http://{addr}"),
        connect_timeout_ms: 500,
        request_timeout_ms: 1_000,
    })
    .unwrap();
    assert_eq!(client.address(), format!("http://{addr}"));

    let items: Vec<Result<JobRecord, RegistryError>> =
        client.list_jobs(JobFilter::new()).collect().await;
    assert_eq!(items.len(), 1);
    assert!(items[0].is_err());
}

#[reclaimd::test]
async fn scanner_reclaims_through_grpc() {
    let registry = MemoryRegistry::new();
    registry.set_now(NOW_MS);
    registry.insert(stale_archived("a", NOW_MS, Some("reclaimd-b")));
    registry.insert(stale_unarchived("u", NOW_MS));
    registry.insert(fresh_unarchived("f", NOW_MS));
    let client = client(serve(registry.clone()).await).await;

    let scanner = StalenessScanner::new(std::sync::Arc::new(client), options("reclaimd-a"));
    let report = with_timeout!(10000, { scanner.scan(NOW_MS).await.unwrap() });

    assert_eq!(report.reclaimed, 2);
    assert_eq!(
        registry.get("a").unwrap().lease_owner.as_deref(),
        Some("reclaimd-a")
    );
    assert!(!registry.get("f").unwrap().archived);
}
