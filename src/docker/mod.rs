//! Container engine access.
//!
//! Everything the deploy core needs from Docker goes through
//! [`DockerAdapter`]. [`engine::BollardDocker`] talks to the engine API;
//! compose projects are driven through the `docker compose` CLI
//! ([`compose`]).

pub mod compose;
pub mod engine;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::deploy::models::EnvMap;

pub use engine::BollardDocker;

pub const APPLICATION_ID_LABEL: &str = "com.application.id";
pub const APPLICATION_NAME_LABEL: &str = "com.application.name";
pub const DEPLOYMENT_ID_LABEL: &str = "com.deployment.id";
pub const COMMIT_HASH_LABEL: &str = "com.commit_hash";
pub const USER_ID_LABEL: &str = "com.user_id";
pub const PROJECT_LABEL: &str = "com.project";
pub const LAST_UPDATE_LABEL: &str = "nixopus.last_update";

/// Raw byte stream from the engine (build progress, container logs).
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildImageOptions {
    pub tag: String,
    /// Dockerfile path relative to the build context root.
    pub dockerfile: String,
    pub labels: HashMap<String, String>,
    pub build_args: HashMap<String, String>,
    pub no_cache: bool,
    pub force_remove: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub env: Vec<String>,
    /// Port the application listens on inside the container.
    pub container_port: u16,
    /// Port published on `0.0.0.0` of the host.
    pub host_port: u16,
    pub network_mode: String,
    pub labels: HashMap<String, String>,
    /// `host:container` bind mounts.
    pub binds: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub private: u16,
    pub public: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
}

impl ContainerSummary {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Host port published for `private`.
    pub fn public_port(&self, private: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.private == private)
            .map(|p| p.public)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogsOptions {
    /// Number of trailing lines; all lines when `None`.
    pub tail: Option<u32>,
    pub timestamps: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    /// Swarm object version, required for updates.
    pub version: u64,
    pub labels: HashMap<String, String>,
}

/// Single-replica swarm service backing a live-dev session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub workdir: String,
    pub env: Vec<String>,
    /// Host directory bind-mounted at `workdir`.
    pub mount_source: String,
    pub labels: HashMap<String, String>,
    pub published_port: u16,
    pub target_port: u16,
    pub dns: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceHealth {
    pub running: u64,
    pub desired: u64,
    /// `state` of each task, with the error message when the engine has one.
    pub task_states: Vec<String>,
}

impl ServiceHealth {
    pub fn is_ready(&self) -> bool {
        self.desired > 0 && self.running == self.desired
    }
}

#[async_trait]
pub trait DockerAdapter: Send + Sync {
    async fn build_image(&self, options: BuildImageOptions, context: Bytes) -> Result<ByteStream>;
    async fn create_container(&self, spec: ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;
    async fn restart_container(&self, id: &str) -> Result<()>;
    async fn get_container_by_id(&self, id: &str) -> Result<ContainerState>;
    async fn list_all_containers(&self) -> Result<Vec<ContainerSummary>>;
    async fn remove_image(&self, reference: &str, force: bool) -> Result<()>;
    async fn container_logs(&self, id: &str, options: LogsOptions) -> Result<ByteStream>;

    async fn get_cluster_services(&self) -> Result<Vec<ServiceSummary>>;
    async fn create_service(&self, spec: DevServiceSpec) -> Result<String>;
    async fn update_service(&self, current: &ServiceSummary, spec: DevServiceSpec) -> Result<()>;
    async fn get_service_health(&self, name: &str) -> Result<ServiceHealth>;
    async fn delete_service(&self, name: &str) -> Result<()>;

    async fn compose_build(&self, compose_file: &Path, env: &EnvMap, no_cache: bool) -> Result<String>;
    async fn compose_up(&self, compose_file: &Path, env: &EnvMap) -> Result<String>;
    async fn compose_down(&self, compose_file: &Path) -> Result<String>;
}

/// Containers labelled with `application_id`.
pub async fn containers_for_application(
    docker: &dyn DockerAdapter,
    application_id: &str,
) -> Result<Vec<ContainerSummary>> {
    Ok(docker
        .list_all_containers()
        .await?
        .into_iter()
        .filter(|c| c.label(APPLICATION_ID_LABEL) == Some(application_id))
        .collect())
}

/// The swarm service labelled with `application_id`, if any.
pub async fn service_for_application(
    docker: &dyn DockerAdapter,
    application_id: &str,
) -> Result<Option<ServiceSummary>> {
    Ok(docker
        .get_cluster_services()
        .await?
        .into_iter()
        .find(|s| s.labels.get(APPLICATION_ID_LABEL).map(String::as_str) == Some(application_id)))
}
