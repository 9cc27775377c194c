use std::sync::Once;

use tracing_subscriber::{EnvFilter, prelude::*};

use crate::settings::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize tracing once. `RUST_LOG` wins over `default_level` when set.
///
/// The `log_format` parameter controls whether logs are output as human-readable
/// text (default) or structured JSON. Later calls are no-ops.
pub fn init(default_level: &str, log_format: LogFormat) -> anyhow::Result<()> {
    let mut init_result: Option<anyhow::Result<()>> = None;
    INIT.call_once(|| {
        let env_filter = build_env_filter(default_level);
        let result = match log_format {
            LogFormat::Text => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .compact()
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(fmt_layer).try_init()
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .json()
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(fmt_layer).try_init()
            }
        };
        init_result = Some(result.map_err(anyhow::Error::from));
    });
    init_result.unwrap_or(Ok(()))
}

/// Level implied by the number of `-v` flags, if any.
pub fn verbosity_level(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    }
}

fn init_for_tests() {
    // Another subscriber may already be installed by the harness; that's fine.
    let _ = init("info", LogFormat::Text);
}

/// Run an async test body with tracing installed.
pub async fn with_test_tracing<F, Fut, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    init_for_tests();
    f().await
}

/// Run a sync test body with tracing installed.
/// This is the synchronous equivalent of `with_test_tracing`.
pub fn with_test_tracing_sync<F, T>(_test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    init_for_tests();
    f()
}
