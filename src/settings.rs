use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};

use crate::reconciler::DEFAULT_POLL_INTERVAL;
use crate::registry::GrpcRegistryConfig;
use crate::scanner::{
    DEFAULT_ARCHIVED_SCAN_LIMIT, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_LINGER,
    DEFAULT_TAKEOVER_AFTER, DEFAULT_UNARCHIVED_SCAN_LIMIT, ReclaimOptions,
};

/// Environment variable that overrides `takeover.owner`.
pub const OWNER_ENV: &str = "RECLAIMD_JOB_OWNER";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub takeover: TakeoverConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Default log level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            takeover: TakeoverConfig::default(),
            server: ServerConfig::default(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    #[default]
    Grpc,
    /// In-process registry; only useful for local runs.
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackend,
    #[serde(default = "default_registry_addr")]
    pub address: String, // e.g. http://127.0.0.1:50061
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::default(),
            address: default_registry_addr(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TakeoverConfig {
    /// Lease owner written on claimed jobs. Defaults to the host name.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "default_linger_secs")]
    pub linger_secs: u64,
    #[serde(default = "default_takeover_secs")]
    pub takeover_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_archived_scan_limit")]
    pub archived_scan_limit: usize,
    #[serde(default = "default_unarchived_scan_limit")]
    pub unarchived_scan_limit: usize,
    #[serde(default = "default_true")]
    pub reissue_completed_archives: bool,
}

impl Default for TakeoverConfig {
    fn default() -> Self {
        Self {
            identity: None,
            owner: None,
            linger_secs: default_linger_secs(),
            takeover_secs: default_takeover_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            concurrency_limit: default_concurrency_limit(),
            archived_scan_limit: default_archived_scan_limit(),
            unarchived_scan_limit: default_unarchived_scan_limit(),
            reissue_completed_archives: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_ping_addr")]
    pub ping_addr: String, // e.g. 0.0.0.0:8080
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ping_addr: default_ping_addr(),
            enabled: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_registry_addr() -> String {
    GrpcRegistryConfig::default().address
}

fn default_connect_timeout_ms() -> u64 {
    GrpcRegistryConfig::default().connect_timeout_ms
}

fn default_request_timeout_ms() -> u64 {
    GrpcRegistryConfig::default().request_timeout_ms
}

fn default_linger_secs() -> u64 {
    DEFAULT_LINGER.as_secs()
}

fn default_takeover_secs() -> u64 {
    DEFAULT_TAKEOVER_AFTER.as_secs()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_concurrency_limit() -> usize {
    DEFAULT_CONCURRENCY_LIMIT
}

fn default_archived_scan_limit() -> usize {
    DEFAULT_ARCHIVED_SCAN_LIMIT
}

fn default_unarchived_scan_limit() -> usize {
    DEFAULT_UNARCHIVED_SCAN_LIMIT
}

fn default_ping_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load config from `path`, or defaults when no path is given. The
    /// `RECLAIMD_JOB_OWNER` environment variable overrides `takeover.owner`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let data = fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                Self::from_toml(&data)?
            }
            None => Self::default(),
        };
        cfg.override_owner(std::env::var(OWNER_ENV).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(data)?;
        Ok(cfg)
    }

    /// Replace the owner scope when `owner` is a non-empty value.
    pub fn override_owner(&mut self, owner: Option<String>) {
        if let Some(owner) = owner.filter(|o| !o.is_empty()) {
            self.takeover.owner = Some(owner);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.takeover;
        if t.concurrency_limit == 0 {
            bail!("takeover.concurrency_limit must be at least 1");
        }
        if t.poll_interval_secs == 0 {
            bail!("takeover.poll_interval_secs must be non-zero");
        }
        if t.linger_secs == 0 {
            bail!("takeover.linger_secs must be non-zero");
        }
        if t.takeover_secs == 0 {
            bail!("takeover.takeover_secs must be non-zero");
        }
        if t.identity.as_deref().is_some_and(|i| i.trim().is_empty()) {
            bail!("takeover.identity must not be empty");
        }
        if self.server.enabled {
            self.ping_addr()?;
        }
        Ok(())
    }

    /// This daemon's identity: the configured one, else the host name.
    pub fn identity(&self) -> anyhow::Result<String> {
        if let Some(identity) = &self.takeover.identity {
            return Ok(identity.clone());
        }
        let host = hostname::get().context("resolving host name for takeover identity")?;
        let host = host.to_string_lossy().into_owned();
        if host.is_empty() {
            bail!("host name is empty; set takeover.identity");
        }
        Ok(host)
    }

    pub fn reclaim_options(&self) -> anyhow::Result<ReclaimOptions> {
        let t = &self.takeover;
        Ok(ReclaimOptions {
            identity: self.identity()?,
            owner: t.owner.clone(),
            linger: Duration::from_secs(t.linger_secs),
            takeover_after: Duration::from_secs(t.takeover_secs),
            concurrency_limit: t.concurrency_limit,
            archived_scan_limit: t.archived_scan_limit,
            unarchived_scan_limit: t.unarchived_scan_limit,
            reissue_completed_archives: t.reissue_completed_archives,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.takeover.poll_interval_secs)
    }

    pub fn ping_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .ping_addr
            .parse()
            .with_context(|| format!("invalid server.ping_addr {:?}", self.server.ping_addr))
    }

    pub fn grpc_config(&self) -> GrpcRegistryConfig {
        GrpcRegistryConfig {
            address: self.registry.address.clone(),
            connect_timeout_ms: self.registry.connect_timeout_ms,
            request_timeout_ms: self.registry.request_timeout_ms,
        }
    }
}
