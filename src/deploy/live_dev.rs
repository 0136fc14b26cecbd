//! Long-running dev services fed by the sync protocol.
//!
//! One swarm service per application, found by its `com.application.id`
//! label. The per-app staging directory written by [`super::ingest`] is
//! bind-mounted at the framework's workdir so the dev server sees every
//! synced file without a rebuild.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use super::context::TaskContext;
use super::db::DbHandle;
use super::frameworks::{Framework, FrameworkProfile};
use super::models::{Application, ContainerUpdate, LiveDevOptions, Status, TaskPayload};
use super::pipeline::Adapters;
use super::ports::allocate_port;
use super::queue::TaskHandler;
use crate::docker::{
    APPLICATION_ID_LABEL, APPLICATION_NAME_LABEL, DevServiceSpec, LAST_UPDATE_LABEL,
    service_for_application,
};
use crate::errors::DeployError;
use crate::proxy::RouteOptions;

pub const DEV_SERVICE_PREFIX: &str = "nixopus-dev-";
/// Domain routed to the session, kept on the service so `stop` can remove it.
pub const DEV_DOMAIN_LABEL: &str = "nixopus.dev_domain";
pub const DNS_SERVERS: [&str; 3] = ["8.8.8.8", "8.8.4.4", "1.1.1.1"];
pub const MEMORY_LIMIT_BYTES: i64 = 2 * 1024 * 1024 * 1024;
pub const NANO_CPUS: i64 = 2_000_000_000;

pub fn service_name(application_id: Uuid) -> String {
    format!("{DEV_SERVICE_PREFIX}{application_id}")
}

pub fn staging_path(staging_root: &Path, application_id: Uuid) -> PathBuf {
    staging_root.join(application_id.to_string())
}

#[derive(Debug, Clone)]
pub struct LiveDevSettings {
    pub staging_root: PathBuf,
    pub health_timeout: Duration,
    pub health_tick: Duration,
}

impl Default for LiveDevSettings {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from(".nixopus/live"),
            health_timeout: Duration::from_secs(120),
            health_tick: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDevSession {
    pub service_id: String,
    pub service_name: String,
    pub framework: Framework,
    pub port: u16,
    pub staging_path: PathBuf,
}

pub struct LiveDevOrchestrator {
    adapters: Adapters,
    upstream_host: String,
    settings: LiveDevSettings,
}

impl LiveDevOrchestrator {
    pub fn new(adapters: Adapters, upstream_host: impl Into<String>, settings: LiveDevSettings) -> Self {
        Self {
            adapters,
            upstream_host: upstream_host.into(),
            settings,
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.settings.staging_root
    }

    /// Create or update the dev service for `app` and wait until it runs.
    pub async fn start(
        &self,
        ctx: &TaskContext,
        app: &Application,
        options: &LiveDevOptions,
    ) -> Result<LiveDevSession, DeployError> {
        ctx.log_and_update_status("Preparing live-dev service", Status::Deploying)
            .await?;

        let staging = staging_path(&self.settings.staging_root, app.id);
        tokio::fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("Failed to create staging dir {}", staging.display()))?;

        let framework = match options.framework.as_deref() {
            Some(name) => name.parse::<Framework>().map_err(DeployError::Validation)?,
            None => Framework::detect(&staging),
        };
        let profile = framework.profile();
        ctx.add_log(format!("Using framework {} ({})", framework, profile.image))
            .await;

        let port = self.pick_port(ctx, options, &profile).await;
        let spec = self.service_spec(app, options, &profile, &staging, port);

        let app_id = app.id.to_string();
        let docker = self.adapters.docker.as_ref();
        let existing = service_for_application(docker, &app_id)
            .await
            .map_err(DeployError::Run)?;
        let mut dropped_domain = None;
        let (service_id, name) = match existing {
            Some(current) => {
                dropped_domain = current
                    .labels
                    .get(DEV_DOMAIN_LABEL)
                    .filter(|old| options.domain.as_deref() != Some(old.as_str()))
                    .cloned();
                ctx.add_log(format!("Updating live-dev service {}", current.name))
                    .await;
                let spec = DevServiceSpec {
                    name: current.name.clone(),
                    ..spec
                };
                docker
                    .update_service(&current, spec)
                    .await
                    .map_err(DeployError::Run)?;
                (current.id, current.name)
            }
            None => {
                ctx.add_log(format!("Creating live-dev service {}", spec.name))
                    .await;
                let name = spec.name.clone();
                let id = docker.create_service(spec).await.map_err(DeployError::Run)?;
                (id, name)
            }
        };

        if let Some(old) = dropped_domain {
            match self.unroute(&old).await {
                Ok(()) => ctx.add_log(format!("Removed route for {old}")).await,
                Err(e) => {
                    warn!(app_id = %app.id, domain = %old, "live-dev route removal failed: {e:#}");
                    ctx.add_log(format!("Route removal for {old} failed: {e}")).await;
                }
            }
        }
        if let Some(domain) = &options.domain {
            if let Err(e) = self.route(domain, port).await {
                warn!(app_id = %app.id, domain, "live-dev domain setup failed: {e:#}");
                ctx.add_log(format!("Domain setup for {domain} failed: {e}"))
                    .await;
            }
        }

        self.wait_ready(ctx, &name).await?;

        ctx.update_deployment(ContainerUpdate {
            container_id: Some(service_id.clone()),
            container_name: Some(name.clone()),
            container_image: Some(profile.image.to_string()),
            container_status: Some(Status::Running.as_str().to_string()),
        })
        .await?;
        info!(app_id = %app.id, service = %name, port, "live-dev service ready");
        Ok(LiveDevSession {
            service_id,
            service_name: name,
            framework,
            port,
            staging_path: staging,
        })
    }

    async fn pick_port(&self, ctx: &TaskContext, options: &LiveDevOptions, profile: &FrameworkProfile) -> u16 {
        if let Some(port) = options.port {
            return port;
        }
        match allocate_port(self.adapters.runner.as_ref()).await {
            Ok(port) => port,
            Err(e) => {
                ctx.add_log(format!(
                    "Port allocation failed ({e}), using framework default {}",
                    profile.default_port
                ))
                .await;
                profile.default_port
            }
        }
    }

    fn service_spec(
        &self,
        app: &Application,
        options: &LiveDevOptions,
        profile: &FrameworkProfile,
        staging: &Path,
        port: u16,
    ) -> DevServiceSpec {
        let mut labels = HashMap::new();
        labels.insert(APPLICATION_ID_LABEL.to_string(), app.id.to_string());
        labels.insert(APPLICATION_NAME_LABEL.to_string(), app.name.clone());
        labels.insert(LAST_UPDATE_LABEL.to_string(), Utc::now().timestamp().to_string());
        if let Some(domain) = &options.domain {
            labels.insert(DEV_DOMAIN_LABEL.to_string(), domain.clone());
        }
        DevServiceSpec {
            name: service_name(app.id),
            image: profile.image.to_string(),
            command: profile.command(),
            workdir: profile.workdir.to_string(),
            env: profile.env.merged_with(&options.env).to_env_list(),
            mount_source: staging.display().to_string(),
            labels,
            published_port: port,
            target_port: profile.default_port,
            dns: DNS_SERVERS.iter().map(|s| s.to_string()).collect(),
            memory_bytes: MEMORY_LIMIT_BYTES,
            nano_cpus: NANO_CPUS,
        }
    }

    async fn route(&self, domain: &str, port: u16) -> anyhow::Result<()> {
        self.adapters
            .proxy
            .add_domain_with_auto_tls(domain, &self.upstream_host, port, RouteOptions::default())
            .await?;
        self.adapters.proxy.reload().await
    }

    async fn unroute(&self, domain: &str) -> anyhow::Result<()> {
        self.adapters.proxy.delete_domain(domain).await?;
        self.adapters.proxy.reload().await
    }

    async fn wait_ready(&self, ctx: &TaskContext, name: &str) -> Result<(), DeployError> {
        ctx.add_log(format!("Waiting for {name} to become ready")).await;
        let deadline = Instant::now() + self.settings.health_timeout;
        let mut last_states = Vec::new();
        loop {
            match self.adapters.docker.get_service_health(name).await {
                Ok(health) if health.is_ready() => return Ok(()),
                Ok(health) => last_states = health.task_states,
                Err(e) => warn!(service = name, "service health check failed: {e:#}"),
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.health_tick).await;
        }
        ctx.add_log(format!("Task states: [{}]", last_states.join(", ")))
            .await;
        Err(DeployError::ReadinessTimeout {
            timeout_secs: self.settings.health_timeout.as_secs(),
        })
    }

    /// Remove the dev service and its route. Returns whether one existed.
    pub async fn stop(&self, application_id: Uuid) -> anyhow::Result<bool> {
        let docker = self.adapters.docker.as_ref();
        let Some(service) = service_for_application(docker, &application_id.to_string()).await? else {
            return Ok(false);
        };
        docker.delete_service(&service.name).await?;
        if let Some(domain) = service.labels.get(DEV_DOMAIN_LABEL) {
            self.unroute(domain).await?;
        }
        info!(app_id = %application_id, service = %service.name, "live-dev service stopped");
        Ok(true)
    }
}

/// Handler for the `live-dev` queue.
pub struct LiveDevHandler {
    db: DbHandle,
    orchestrator: Arc<LiveDevOrchestrator>,
}

impl LiveDevHandler {
    pub fn new(db: DbHandle, orchestrator: Arc<LiveDevOrchestrator>) -> Self {
        Self { db, orchestrator }
    }
}

#[async_trait]
impl TaskHandler for LiveDevHandler {
    async fn handle(&self, payload: TaskPayload) -> Result<(), DeployError> {
        let ctx = TaskContext::for_live_dev(self.db.clone(), &payload);
        let options = payload.live_dev.clone().unwrap_or_default();
        let result = async {
            let session = self
                .orchestrator
                .start(&ctx, &payload.application, &options)
                .await?;
            ctx.log_and_update_status(
                format!(
                    "Live-dev {} running on port {}",
                    session.framework, session.port
                ),
                Status::Running,
            )
            .await
        }
        .await;
        if let Err(e) = &result {
            warn!(
                app_id = %payload.application.id,
                correlation_id = %payload.correlation_id,
                "live-dev failed: {e}"
            );
            ctx.fail(e).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::context::live_dev_commit_hash;
    use crate::deploy::pipeline::tests::Harness;
    use crate::docker::ServiceHealth;

    fn orchestrator(h: &Harness, timeout: Duration) -> Arc<LiveDevOrchestrator> {
        Arc::new(LiveDevOrchestrator::new(
            h.pipeline.adapters().clone(),
            "10.0.0.2",
            LiveDevSettings {
                staging_root: h.dir.path().join("live"),
                health_timeout: timeout,
                health_tick: Duration::from_millis(1),
            },
        ))
    }

    fn live_payload(h: &Harness, options: LiveDevOptions) -> TaskPayload {
        let app = crate::deploy::db::tests::sample_app("web");
        let mut payload = h.payload(&app, true, &live_dev_commit_hash(app.id));
        payload.live_dev = Some(options);
        payload
    }

    #[tokio::test]
    async fn test_creates_service_then_updates_in_place() {
        let h = Harness::new();
        let orch = orchestrator(&h, Duration::from_secs(1));
        let handler = LiveDevHandler::new(h.db.clone(), orch.clone());
        let options = LiveDevOptions {
            framework: Some("vite".into()),
            port: Some(50123),
            env: [("API_URL".to_string(), "http://api".to_string())].into_iter().collect(),
            domain: Some("dev.example".into()),
        };
        let payload = live_payload(&h, options.clone());
        handler.handle(payload.clone()).await.unwrap();

        let spec = h.docker.with(|s| s.service_specs[0].clone());
        let app_id = payload.application.id;
        assert_eq!(spec.name, service_name(app_id));
        assert_eq!(spec.image, "node:20-alpine");
        assert_eq!(spec.published_port, 50123);
        assert_eq!(spec.target_port, 5173);
        assert_eq!(spec.command[2], "npm install && npm run dev -- --host 0.0.0.0 --port 5173");
        assert!(spec.env.contains(&"API_URL=http://api".to_string()));
        assert!(spec.env.contains(&"CHOKIDAR_USEPOLLING=true".to_string()));
        assert_eq!(spec.dns, vec!["8.8.8.8", "8.8.4.4", "1.1.1.1"]);
        assert_eq!(spec.memory_bytes, MEMORY_LIMIT_BYTES);
        assert!(spec.labels.contains_key(LAST_UPDATE_LABEL));
        assert!(spec.mount_source.ends_with(&app_id.to_string()));
        assert_eq!(h.proxy.route("dev.example"), Some(("10.0.0.2".into(), 50123)));
        assert_eq!(h.status_of(&payload), Status::Running);

        // Second request reuses the label-matched service.
        let second = TaskPayload {
            live_dev: Some(options),
            ..payload.clone()
        };
        handler.handle(second).await.unwrap();
        let names: Vec<String> = h.docker.with(|s| s.services.iter().map(|s| s.name.clone()).collect());
        assert_eq!(names, vec![service_name(app_id)]);
        assert_eq!(h.docker.with(|s| s.service_updates), 1);
    }

    #[tokio::test]
    async fn test_detects_framework_from_staging_dir() {
        let h = Harness::new();
        let orch = orchestrator(&h, Duration::from_secs(1));
        let payload = live_payload(&h, LiveDevOptions::default());
        let staging = staging_path(orch.staging_root(), payload.application.id);
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("manage.py"), "").unwrap();
        let ctx = TaskContext::for_live_dev(h.db.clone(), &payload);
        let session = orch
            .start(&ctx, &payload.application, &LiveDevOptions::default())
            .await
            .unwrap();
        assert_eq!(session.framework, Framework::Django);
        assert!(crate::deploy::ports::PORT_RANGE.contains(&session.port));
        let spec = h.docker.with(|s| s.service_specs[0].clone());
        assert_eq!(spec.target_port, 8000);
    }

    #[tokio::test]
    async fn test_readiness_timeout_fails_with_task_states() {
        let h = Harness::new();
        h.docker.with(|s| {
            s.health = vec![ServiceHealth {
                running: 0,
                desired: 1,
                task_states: vec!["pending: no suitable node".into()],
            }]
        });
        let orch = orchestrator(&h, Duration::from_millis(20));
        let handler = LiveDevHandler::new(h.db.clone(), orch);
        let payload = live_payload(&h, LiveDevOptions::default());
        let err = handler.handle(payload.clone()).await.unwrap_err();
        assert!(matches!(err, DeployError::ReadinessTimeout { .. }));
        assert!(h.docker.with(|s| s.health_polls) > 1);
        let logs = h.logs_of(&payload);
        assert!(logs.iter().any(|l| l.contains("pending: no suitable node")));
        assert_eq!(h.status_of(&payload), Status::Failed);
    }

    #[tokio::test]
    async fn test_domain_failure_is_not_fatal() {
        let h = Harness::new();
        h.proxy.set_failing(true);
        let orch = orchestrator(&h, Duration::from_secs(1));
        let handler = LiveDevHandler::new(h.db.clone(), orch);
        let payload = live_payload(
            &h,
            LiveDevOptions {
                domain: Some("dev.example".into()),
                ..Default::default()
            },
        );
        handler.handle(payload.clone()).await.unwrap();
        assert_eq!(h.status_of(&payload), Status::Running);
        assert!(h.logs_of(&payload).iter().any(|l| l.starts_with("Domain setup for dev.example failed")));
    }

    #[tokio::test]
    async fn test_unknown_framework_is_validation_error() {
        let h = Harness::new();
        let orch = orchestrator(&h, Duration::from_secs(1));
        let handler = LiveDevHandler::new(h.db.clone(), orch);
        let payload = live_payload(
            &h,
            LiveDevOptions {
                framework: Some("cobol".into()),
                ..Default::default()
            },
        );
        let err = handler.handle(payload).await.unwrap_err();
        assert!(matches!(err, DeployError::Validation(_)));
        assert!(h.docker.with(|s| s.services.is_empty()));
    }

    #[tokio::test]
    async fn test_update_without_domain_removes_previous_route() {
        let h = Harness::new();
        let orch = orchestrator(&h, Duration::from_secs(1));
        let handler = LiveDevHandler::new(h.db.clone(), orch.clone());
        let payload = live_payload(
            &h,
            LiveDevOptions {
                domain: Some("dev.example".into()),
                ..Default::default()
            },
        );
        handler.handle(payload.clone()).await.unwrap();
        assert!(h.proxy.route("dev.example").is_some());

        let without_domain = TaskPayload {
            live_dev: Some(LiveDevOptions::default()),
            ..payload.clone()
        };
        handler.handle(without_domain).await.unwrap();
        assert!(h.proxy.route("dev.example").is_none());
        assert!(h.logs_of(&payload).iter().any(|l| l == "Removed route for dev.example"));

        // Same domain on update keeps the route.
        let again = TaskPayload {
            live_dev: Some(LiveDevOptions {
                domain: Some("next.example".into()),
                ..Default::default()
            }),
            ..payload.clone()
        };
        handler.handle(again.clone()).await.unwrap();
        handler.handle(again).await.unwrap();
        assert!(h.proxy.route("next.example").is_some());
        assert!(orch.stop(payload.application.id).await.unwrap());
        assert!(h.proxy.route("next.example").is_none());
    }

    #[tokio::test]
    async fn test_stop_removes_service_and_route() {
        let h = Harness::new();
        let orch = orchestrator(&h, Duration::from_secs(1));
        let handler = LiveDevHandler::new(h.db.clone(), orch.clone());
        let payload = live_payload(
            &h,
            LiveDevOptions {
                domain: Some("dev.example".into()),
                ..Default::default()
            },
        );
        handler.handle(payload.clone()).await.unwrap();
        assert!(orch.stop(payload.application.id).await.unwrap());
        assert!(h.docker.with(|s| s.services.is_empty()));
        assert!(h.proxy.route("dev.example").is_none());
        assert!(!orch.stop(payload.application.id).await.unwrap());
    }
}
