//! Layered configuration for the Nixopus deployment core.
//!
//! Settings are read from `nixopus.toml`, then overridden by `NIXOPUS_*`
//! environment variables (a `.env` file is honoured), then by CLI flags.
//! Every field has a default so an empty file is a valid configuration.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8443
//!
//! [storage]
//! db_path = "/var/lib/nixopus/nixopus.db"
//! mount_root = "/var/lib/nixopus/repos"
//! staging_root = "/var/lib/nixopus/live"
//!
//! [ssh]
//! host = "10.0.0.5"
//! user = "deploy"
//! port = 22
//! identity_file = "~/.ssh/id_ed25519"
//!
//! [proxy]
//! admin_url = "http://127.0.0.1:2019"
//!
//! [queue]
//! min_workers = 1
//! max_workers = 10
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;

pub const DEFAULT_CONFIG_FILE: &str = "nixopus.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Answer cross-origin requests from any origin (dashboard development).
    pub cors_permissive: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_path: PathBuf,
    /// Root for per-deployment clone directories.
    pub mount_root: PathBuf,
    /// Root for per-application live-dev staging directories.
    pub staging_root: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".nixopus/nixopus.db"),
            mount_root: PathBuf::from(".nixopus/repos"),
            staging_root: PathBuf::from(".nixopus/live"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    /// Engine endpoint. Empty means the platform default socket.
    pub host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    /// Run host commands locally instead of over ssh.
    pub local: bool,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            local: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub admin_url: String,
    /// Host that proxy routes point at. Falls back to `ssh.host`.
    pub upstream_host: Option<String>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            admin_url: "http://127.0.0.1:2019".to_string(),
            upstream_host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub min_workers: usize,
    pub max_workers: usize,
    pub reservation_timeout_secs: u64,
    pub wait_timeout_secs: u64,
    pub buffer: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            reservation_timeout_secs: 10,
            wait_timeout_secs: 5,
            buffer: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveDevSection {
    pub health_timeout_secs: u64,
    pub health_tick_secs: u64,
}

impl Default for LiveDevSection {
    fn default() -> Self {
        Self {
            health_timeout_secs: 120,
            health_tick_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Defaults for the `nixopus dev` client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevSection {
    pub server_url: Option<String>,
    pub exclude: Vec<String>,
    pub debounce_ms: u64,
    /// Zero retries forever.
    pub max_reconnect_attempts: u32,
}

impl Default for DevSection {
    fn default() -> Self {
        Self {
            server_url: None,
            exclude: Vec::new(),
            debounce_ms: 100,
            max_reconnect_attempts: 0,
        }
    }
}

/// Top-level `nixopus.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NixopusToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub docker: DockerSection,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub live_dev: LiveDevSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub dev: DevSection,
}

impl NixopusToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse nixopus.toml")
    }

    /// Load from `path`, or from `./nixopus.toml` when no path is given.
    /// A missing default file yields the default configuration; a missing
    /// explicit file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load the file layer and then the process environment layer.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `NIXOPUS_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NIXOPUS_HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("NIXOPUS_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
        if let Some(v) = lookup("NIXOPUS_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("NIXOPUS_MOUNT_ROOT") {
            self.storage.mount_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("NIXOPUS_STAGING_ROOT") {
            self.storage.staging_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("NIXOPUS_DOCKER_HOST") {
            self.docker.host = Some(v);
        }
        if let Some(v) = lookup("NIXOPUS_SSH_HOST") {
            self.ssh.host = v;
        }
        if let Some(v) = lookup("NIXOPUS_SSH_USER") {
            self.ssh.user = v;
        }
        if let Some(v) = lookup("NIXOPUS_SSH_PORT").and_then(|v| v.parse().ok()) {
            self.ssh.port = v;
        }
        if let Some(v) = lookup("NIXOPUS_SSH_IDENTITY_FILE") {
            self.ssh.identity_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("NIXOPUS_SSH_LOCAL") {
            self.ssh.local = v != "false" && v != "0";
        }
        if let Some(v) = lookup("NIXOPUS_PROXY_ADMIN_URL") {
            self.proxy.admin_url = v;
        }
        if let Some(v) = lookup("NIXOPUS_PROXY_UPSTREAM_HOST") {
            self.proxy.upstream_host = Some(v);
        }
        if let Some(v) = lookup("NIXOPUS_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("NIXOPUS_LOG_FORMAT").and_then(|v| v.parse().ok()) {
            self.logging.format = v;
        }
        if let Some(v) = lookup("NIXOPUS_SERVER_URL") {
            self.dev.server_url = Some(v);
        }
    }

    /// Host that reverse-proxy routes point at.
    pub fn upstream_host(&self) -> &str {
        self.proxy
            .upstream_host
            .as_deref()
            .unwrap_or(self.ssh.host.as_str())
    }

    /// Returns a list of problems; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.queue.min_workers == 0 {
            problems.push("queue.min_workers must be at least 1".to_string());
        }
        if self.queue.max_workers < self.queue.min_workers {
            problems.push(format!(
                "queue.max_workers ({}) is below queue.min_workers ({})",
                self.queue.max_workers, self.queue.min_workers
            ));
        }
        if self.queue.buffer == 0 {
            problems.push("queue.buffer must be at least 1".to_string());
        }
        if self.live_dev.health_tick_secs == 0 {
            problems.push("live_dev.health_tick_secs must be at least 1".to_string());
        }
        if !self.proxy.admin_url.starts_with("http://") && !self.proxy.admin_url.starts_with("https://")
        {
            problems.push(format!(
                "proxy.admin_url '{}' is not an http(s) URL",
                self.proxy.admin_url
            ));
        }
        problems
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.reservation_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.wait_timeout_secs)
    }
}

/// Resolved settings for one `nixopus dev` session.
#[derive(Debug, Clone)]
pub struct DevClientConfig {
    pub server_url: String,
    pub token: String,
    pub organization_id: Option<String>,
    pub application_id: String,
    pub root: PathBuf,
    pub excludes: Vec<String>,
    pub debounce: Duration,
    pub max_reconnect_attempts: u32,
}

impl DevClientConfig {
    /// WebSocket endpoint for the live-dev ingest of this application.
    pub fn endpoint(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/ws/live?application_id={}", self.application_id)
    }
}
