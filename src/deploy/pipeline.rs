//! Deployment stages and the queue handlers that drive them.
//!
//! ```text
//! started → cloning → building → deploying → deployed
//! any     → failed
//! ```
//!
//! Restarts skip clone and build and end in `running`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use super::build::{consume_build_output, resolve_context, tar_context};
use super::context::TaskContext;
use super::db::DbHandle;
use super::models::{Application, BuildPack, DEFAULT_DOCKERFILE, Status, TaskPayload, TriggerKind};
use super::rotation::{Rotation, RunPlan, STARTUP_SETTLE, container_labels, image_tag};
use crate::docker::compose::DEFAULT_COMPOSE_FILE;
use crate::docker::{BuildImageOptions, DockerAdapter, containers_for_application};
use crate::errors::DeployError;
use crate::git::{CloneRequest, GitSource};
use crate::proxy::{ProxyReconciler, RouteOptions};
use crate::ssh::CommandRunner;

use super::queue::TaskHandler;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Host that proxy routes dial.
    pub upstream_host: String,
    /// Wait between starting a container and checking it.
    pub settle: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            upstream_host: "127.0.0.1".to_string(),
            settle: STARTUP_SETTLE,
        }
    }
}

/// Adapters shared by every handler.
#[derive(Clone)]
pub struct Adapters {
    pub docker: Arc<dyn DockerAdapter>,
    pub git: Arc<dyn GitSource>,
    pub proxy: Arc<dyn ProxyReconciler>,
    pub runner: Arc<dyn CommandRunner>,
}

pub struct Pipeline {
    db: DbHandle,
    adapters: Adapters,
    options: PipelineOptions,
}

/// Where the build stage left the application.
enum Built {
    Image,
    Compose,
    Static { content_root: PathBuf },
}

impl Pipeline {
    pub fn new(db: DbHandle, adapters: Adapters, options: PipelineOptions) -> Self {
        Self {
            db,
            adapters,
            options,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn adapters(&self) -> &Adapters {
        &self.adapters
    }

    pub fn upstream_host(&self) -> &str {
        &self.options.upstream_host
    }

    /// Full pipeline for create, update, redeploy and rollback.
    pub async fn deploy(&self, ctx: &TaskContext, payload: &TaskPayload, kind: TriggerKind) -> Result<(), DeployError> {
        let app = &payload.application;
        info!(
            app_id = %app.id,
            deployment_id = %payload.deployment.id,
            correlation_id = %payload.correlation_id,
            kind = %kind,
            "deployment started"
        );
        ctx.add_log(format!(
            "Starting {} deployment of {} ({})",
            kind,
            app.name,
            app.build_pack.as_str()
        ))
        .await;

        self.run_hook(ctx, "pre-run", &app.pre_run_command).await?;

        ctx.log_and_update_status(
            format!("Cloning {}@{}", app.repository, app.branch),
            Status::Cloning,
        )
        .await?;
        let repo_path = self.clone_stage(ctx, payload, kind).await?;
        ctx.update_status(Status::Building).await?;

        let built = self.build_stage(ctx, payload, &repo_path).await?;
        ctx.log_and_update_status("Build finished", Status::Deploying)
            .await?;

        let port = match &built {
            Built::Image => self.run_stage(ctx, app, payload, RunPlan::image(app)).await?,
            Built::Static { content_root } => {
                let root = content_root.display().to_string();
                self.run_stage(ctx, app, payload, RunPlan::static_site(app, &root))
                    .await?
            }
            Built::Compose => app.port,
        };

        if let Err(e) = self.reconcile_proxy(ctx, app, port).await {
            if kind == TriggerKind::Create {
                return Err(e);
            }
            warn!(app_id = %app.id, "proxy reconcile failed: {e}");
            ctx.add_log(format!("Proxy update failed, continuing: {e}")).await;
        }

        self.run_hook(ctx, "post-run", &app.post_run_command).await?;

        ctx.log_and_update_status("Deployment finished", Status::Deployed)
            .await?;
        info!(app_id = %app.id, deployment_id = %payload.deployment.id, "deployment finished");
        Ok(())
    }

    /// Restart every container of the application in place.
    pub async fn restart(&self, ctx: &TaskContext, payload: &TaskPayload) -> Result<(), DeployError> {
        let app = &payload.application;
        ctx.log_and_update_status("Restarting application", Status::Deploying)
            .await?;
        let containers = containers_for_application(self.adapters.docker.as_ref(), &app.id.to_string())
            .await
            .map_err(DeployError::Run)?;
        if containers.is_empty() {
            return Err(DeployError::ContainerNotRunning);
        }
        for container in &containers {
            ctx.add_log(format!("Restarting container {}", container.id))
                .await;
            self.adapters
                .docker
                .restart_container(&container.id)
                .await
                .map_err(DeployError::Run)?;
        }
        ctx.log_and_update_status(
            format!("Restarted {} container(s)", containers.len()),
            Status::Running,
        )
        .await
    }

    async fn run_hook(&self, ctx: &TaskContext, label: &str, command: &str) -> Result<(), DeployError> {
        if command.trim().is_empty() {
            return Ok(());
        }
        ctx.add_log(format!("Running {label} command: {command}")).await;
        let out = self
            .adapters
            .runner
            .run_command(command)
            .await
            .map_err(DeployError::Other)?;
        if !out.output.trim().is_empty() {
            ctx.add_log(out.output.trim().to_string()).await;
        }
        if !out.success() {
            return Err(DeployError::Command {
                command: command.to_string(),
                exit_code: out.exit_code,
                output: out.output.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn clone_stage(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
        kind: TriggerKind,
    ) -> Result<PathBuf, DeployError> {
        let app = &payload.application;
        let cloned = self
            .adapters
            .git
            .clone_repository(CloneRequest {
                repository: app.repository.clone(),
                branch: app.branch.clone(),
                user_id: app.user_id,
                environment: app.environment,
                deployment_id: payload.deployment.id,
                application_id: app.id,
                kind,
                commit_hash: payload.deployment.commit_hash.clone(),
            })
            .await
            .map_err(DeployError::Clone)?;
        let (deployment_id, hash) = (payload.deployment.id, cloned.commit_hash.clone());
        self.db
            .call(move |db| db.update_deployment_commit(deployment_id, &hash))
            .await
            .map_err(DeployError::Storage)?;
        ctx.add_log(format!("Checked out {}", cloned.commit_hash)).await;
        Ok(cloned.path)
    }

    async fn build_stage(
        &self,
        ctx: &TaskContext,
        payload: &TaskPayload,
        repo_path: &Path,
    ) -> Result<Built, DeployError> {
        let app = &payload.application;
        let context = resolve_context(repo_path, &app.base_path).map_err(DeployError::Build)?;
        let options = payload.update_options;
        match app.build_pack {
            BuildPack::Dockerfile => {
                let dockerfile = if app.dockerfile_path.trim().is_empty() {
                    DEFAULT_DOCKERFILE.to_string()
                } else {
                    app.dockerfile_path.trim_start_matches('/').to_string()
                };
                if !context.join(&dockerfile).is_file() {
                    return Err(DeployError::Build(anyhow!(
                        "Dockerfile {} not found in build context",
                        dockerfile
                    )));
                }
                let tag = image_tag(app);
                ctx.add_log(format!("Building image {tag}")).await;
                let dir = context.clone();
                let archive = tokio::task::spawn_blocking(move || tar_context(&dir))
                    .await
                    .context("Build context task panicked")
                    .and_then(|r| r)
                    .map_err(DeployError::Build)?;
                let commit = self.deployment_commit(payload).await?;
                let build = BuildImageOptions {
                    tag,
                    dockerfile,
                    labels: container_labels(app, payload.deployment.id, &commit),
                    build_args: app.build_variables.0.clone().into_iter().collect(),
                    no_cache: options.force_without_cache,
                    force_remove: options.force,
                };
                let stream = self
                    .adapters
                    .docker
                    .build_image(build, Bytes::from(archive))
                    .await
                    .map_err(DeployError::Build)?;
                consume_build_output(ctx, stream)
                    .await
                    .map_err(DeployError::Build)?;
                Ok(Built::Image)
            }
            BuildPack::DockerCompose => {
                let file_name = if app.dockerfile_path.trim().is_empty()
                    || app.dockerfile_path == DEFAULT_DOCKERFILE
                {
                    DEFAULT_COMPOSE_FILE.to_string()
                } else {
                    app.dockerfile_path.trim_start_matches('/').to_string()
                };
                let compose_file = context.join(&file_name);
                if !compose_file.is_file() {
                    return Err(DeployError::Build(anyhow!(
                        "Compose file {} not found in build context",
                        file_name
                    )));
                }
                let env = app.build_variables.merged_with(&app.environment_variables);
                ctx.add_log(format!("Building compose project {file_name}")).await;
                let out = self
                    .adapters
                    .docker
                    .compose_build(&compose_file, &env, options.force_without_cache)
                    .await
                    .map_err(DeployError::Build)?;
                log_output(ctx, "Build", &out).await;
                ctx.add_log("Starting compose services").await;
                let out = self
                    .adapters
                    .docker
                    .compose_up(&compose_file, &env)
                    .await
                    .map_err(DeployError::Build)?;
                log_output(ctx, "Compose", &out).await;
                Ok(Built::Compose)
            }
            BuildPack::Static => {
                ctx.add_log("Static site, nothing to build").await;
                Ok(Built::Static {
                    content_root: context,
                })
            }
        }
    }

    async fn deployment_commit(&self, payload: &TaskPayload) -> Result<String, DeployError> {
        let id = payload.deployment.id;
        let deployment = self
            .db
            .call(move |db| db.get_deployment(id))
            .await
            .map_err(DeployError::Storage)?;
        Ok(deployment
            .map(|d| d.commit_hash)
            .unwrap_or_else(|| payload.deployment.commit_hash.clone()))
    }

    async fn run_stage(
        &self,
        ctx: &TaskContext,
        app: &Application,
        payload: &TaskPayload,
        plan: RunPlan,
    ) -> Result<u16, DeployError> {
        let commit = self.deployment_commit(payload).await?;
        let rotation = Rotation {
            docker: self.adapters.docker.as_ref(),
            runner: self.adapters.runner.as_ref(),
            settle: self.options.settle,
        };
        let running = rotation.run(ctx, app, &commit, plan).await?;
        Ok(running.host_port)
    }

    /// Route every domain of `app` to `port` on the upstream host, then reload.
    pub async fn reconcile_proxy(&self, ctx: &TaskContext, app: &Application, port: u16) -> Result<(), DeployError> {
        if app.domains.is_empty() {
            return Ok(());
        }
        for domain in &app.domains {
            ctx.add_log(format!(
                "Routing {} to {}:{}",
                domain, self.options.upstream_host, port
            ))
            .await;
            self.adapters
                .proxy
                .add_domain_with_auto_tls(domain, &self.options.upstream_host, port, RouteOptions::default())
                .await
                .map_err(DeployError::Proxy)?;
        }
        self.adapters.proxy.reload().await.map_err(DeployError::Proxy)
    }
}

async fn log_output(ctx: &TaskContext, prefix: &str, output: &str) {
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        ctx.add_log(format!("{prefix}: {line}")).await;
    }
}

/// Handler for one deployment queue.
pub struct DeploymentHandler {
    pipeline: Arc<Pipeline>,
    kind: TriggerKind,
}

impl DeploymentHandler {
    pub fn new(pipeline: Arc<Pipeline>, kind: TriggerKind) -> Self {
        Self { pipeline, kind }
    }
}

#[async_trait]
impl TaskHandler for DeploymentHandler {
    async fn handle(&self, payload: TaskPayload) -> Result<(), DeployError> {
        let ctx = TaskContext::from_payload(self.pipeline.db().clone(), &payload);
        let result = match self.kind {
            TriggerKind::Restart => self.pipeline.restart(&ctx, &payload).await,
            kind => self.pipeline.deploy(&ctx, &payload, kind).await,
        };
        if let Err(e) = &result {
            warn!(
                app_id = %payload.application.id,
                deployment_id = %payload.deployment.id,
                correlation_id = %payload.correlation_id,
                "deployment failed: {e}"
            );
            ctx.fail(e).await;
        }
        result
    }
}
