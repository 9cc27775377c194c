use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use reclaimd::metrics;
use reclaimd::reconciler::Reconciler;
use reclaimd::registry::{GrpcRegistry, JobRegistry, MemoryRegistry};
use reclaimd::server::run_http_server;
use reclaimd::settings::{AppConfig, RegistryBackend};
use reclaimd::trace;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Reclaims finished jobs whose archival was abandoned by another daemon
struct Args {
    /// raise log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let cfg = AppConfig::load(args.config.as_deref())?;
    let level = trace::verbosity_level(args.verbose).unwrap_or(cfg.log_level.as_str());
    trace::init(level, cfg.log_format)?;

    let options = cfg.reclaim_options()?;
    let metrics = metrics::init()?;

    let registry: Arc<dyn JobRegistry> = match cfg.registry.backend {
        RegistryBackend::Grpc => {
            let client = GrpcRegistry::connect_lazy(&cfg.grpc_config())?;
            info!(address = %client.address(), "using remote job registry");
            Arc::new(client)
        }
        RegistryBackend::Memory => {
            warn!("using in-memory job registry; nothing will be reclaimed from a real fleet");
            MemoryRegistry::new_arc()
        }
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http = if cfg.server.enabled {
        let addr = cfg.ping_addr()?;
        let rx = shutdown_tx.subscribe();
        let metrics = Some(metrics.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = run_http_server(addr, metrics, rx).await {
                error!(error = %e, "http server failed");
            }
        }))
    } else {
        None
    };

    let reconciler = Reconciler::new(registry, options, cfg.poll_interval())
        .with_metrics(Some(metrics))
        .spawn(shutdown_tx.subscribe());

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down after the current cycle");
    let _ = shutdown_tx.send(());

    if let Err(e) = reconciler.await {
        error!(error = %e, "reconciler task failed");
    }
    if let Some(http) = http {
        http.await.ok();
    }
    Ok(())
}
