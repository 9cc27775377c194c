pub mod job;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod settings;
pub mod takeover;
pub mod trace;
pub mod work_queue;

pub mod pb {
    tonic::include_proto!("reclaimd.v1");
}

pub use reclaimd_macros::test;
