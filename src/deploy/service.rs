//! Trigger surface of the deployment core.
//!
//! Every trigger validates, commits its rows through one prepare
//! transaction and then enqueues a [`TaskPayload`]. Failures before the
//! enqueue are returned to the caller and leave no task behind.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::context::live_dev_commit_hash;
use super::db::DbHandle;
use super::live_dev::{LiveDevHandler, LiveDevOrchestrator};
use super::models::{
    Application, ApplicationDeployment, BuildPack, CreateDeploymentRequest, DEFAULT_DOCKERFILE,
    DeploymentStatus, Domain, Environment, LiveDevRequest, LogPage, Status, TaskPayload,
    TriggerKind, UpdateDeploymentRequest, UpdateOptions, is_valid_domain,
};
use super::pipeline::{DeploymentHandler, Pipeline};
use super::queue::{
    CREATE_DEPLOYMENT, LIVE_DEV, REDEPLOY_DEPLOYMENT, RESTART_DEPLOYMENT, ROLLBACK_DEPLOYMENT,
    TaskQueue, UPDATE_DEPLOYMENT,
};
use super::rotation::{STOP_GRACE, image_tag};
use crate::docker::compose::DEFAULT_COMPOSE_FILE;
use crate::docker::{LogsOptions, containers_for_application};
use crate::errors::DeployError;
use crate::git::workdir_path;
use crate::proxy::RouteOptions;

/// Identifiers of an accepted trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Triggered {
    pub application_id: Uuid,
    pub deployment_id: Uuid,
    pub status_id: Uuid,
    pub correlation_id: Uuid,
}

impl From<&TaskPayload> for Triggered {
    fn from(payload: &TaskPayload) -> Self {
        Self {
            application_id: payload.application.id,
            deployment_id: payload.deployment.id,
            status_id: payload.status.id,
            correlation_id: payload.correlation_id,
        }
    }
}

pub struct DeployService {
    db: DbHandle,
    queue: Arc<TaskQueue>,
    pipeline: Arc<Pipeline>,
    live_dev: Arc<LiveDevOrchestrator>,
    mount_root: PathBuf,
}

impl DeployService {
    pub fn new(
        db: DbHandle,
        queue: Arc<TaskQueue>,
        pipeline: Arc<Pipeline>,
        live_dev: Arc<LiveDevOrchestrator>,
        mount_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            queue,
            pipeline,
            live_dev,
            mount_root: mount_root.into(),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn staging_root(&self) -> PathBuf {
        self.live_dev.staging_root().to_path_buf()
    }

    /// Register one handler per queue. Call once before the first enqueue.
    pub fn register_handlers(&self) -> anyhow::Result<()> {
        let handlers = [
            (CREATE_DEPLOYMENT, TriggerKind::Create),
            (UPDATE_DEPLOYMENT, TriggerKind::Update),
            (REDEPLOY_DEPLOYMENT, TriggerKind::Redeploy),
            (ROLLBACK_DEPLOYMENT, TriggerKind::Rollback),
            (RESTART_DEPLOYMENT, TriggerKind::Restart),
        ];
        for (queue, kind) in handlers {
            self.queue
                .register(queue, Arc::new(DeploymentHandler::new(self.pipeline.clone(), kind)))?;
        }
        self.queue.register(
            LIVE_DEV,
            Arc::new(LiveDevHandler::new(self.db.clone(), self.live_dev.clone())),
        )
    }

    // ── Triggers ──────────────────────────────────────────────────────

    pub async fn create_deployment(&self, request: CreateDeploymentRequest) -> Result<Triggered, DeployError> {
        request.validate().map_err(DeployError::Validation)?;
        let app = request.into_application();
        let payload = self
            .prepare(app, true, String::new(), Status::Started, UpdateOptions::default())
            .await?;
        self.dispatch(CREATE_DEPLOYMENT, payload).await
    }

    pub async fn update_deployment(&self, request: UpdateDeploymentRequest) -> Result<Triggered, DeployError> {
        if request.port == Some(0) {
            return Err(DeployError::Validation("port must be between 1 and 65535".into()));
        }
        let mut app = self
            .load_application(request.application_id, request.organization_id)
            .await?;
        request.apply_to(&mut app);
        let payload = self
            .prepare(app, false, String::new(), Status::Started, request.options())
            .await?;
        self.dispatch(UPDATE_DEPLOYMENT, payload).await
    }

    pub async fn redeploy(
        &self,
        application_id: Uuid,
        organization_id: Uuid,
        options: UpdateOptions,
    ) -> Result<Triggered, DeployError> {
        let app = self.load_application(application_id, organization_id).await?;
        let payload = self
            .prepare(app, false, String::new(), Status::Started, options)
            .await?;
        self.dispatch(REDEPLOY_DEPLOYMENT, payload).await
    }

    /// New deployment pinned to the commit of `deployment_id`.
    pub async fn rollback(&self, deployment_id: Uuid, organization_id: Uuid) -> Result<Triggered, DeployError> {
        let target = self
            .db
            .call(move |db| db.get_deployment(deployment_id))
            .await
            .map_err(DeployError::Storage)?
            .ok_or_else(|| DeployError::not_found("deployment", deployment_id))?;
        if target.commit_hash.is_empty() {
            return Err(DeployError::Validation(format!(
                "deployment {deployment_id} has no commit to roll back to"
            )));
        }
        let mut app = self
            .load_application(target.application_id, organization_id)
            .await?;
        app.updated_at = Utc::now();
        let payload = self
            .prepare(app, false, target.commit_hash, Status::Started, UpdateOptions::default())
            .await?;
        self.dispatch(ROLLBACK_DEPLOYMENT, payload).await
    }

    pub async fn restart(&self, application_id: Uuid, organization_id: Uuid) -> Result<Triggered, DeployError> {
        let app = self.load_application(application_id, organization_id).await?;
        let payload = self
            .prepare(app, false, String::new(), Status::Started, UpdateOptions::default())
            .await?;
        self.dispatch(RESTART_DEPLOYMENT, payload).await
    }

    /// Redeploy for a push event. Bypasses the organization scope.
    pub async fn enqueue_webhook_update(&self, app: Application) -> Result<Triggered, DeployError> {
        let payload = self
            .prepare(app, false, String::new(), Status::Started, UpdateOptions::webhook())
            .await?;
        self.dispatch(UPDATE_DEPLOYMENT, payload).await
    }

    /// Start or refresh the live-dev session. Reuses the application's
    /// synthetic live-dev deployment when one exists.
    pub async fn live_dev(&self, request: LiveDevRequest) -> Result<Triggered, DeployError> {
        let app = self
            .load_application(request.application_id, request.organization_id)
            .await?;
        let hash = live_dev_commit_hash(app.id);
        let app_id = app.id;
        let lookup = hash.clone();
        let existing = self
            .db
            .call(move |db| db.find_deployment_by_commit(app_id, &lookup))
            .await
            .map_err(DeployError::Storage)?;

        let mut payload = match existing {
            Some(deployment) => {
                let status = DeploymentStatus::new(deployment.id, Status::Started);
                let row = status.clone();
                self.db
                    .call(move |db| db.add_status(&row))
                    .await
                    .map_err(DeployError::Prepare)?;
                TaskPayload {
                    correlation_id: Uuid::new_v4(),
                    application: app,
                    deployment,
                    status,
                    update_options: UpdateOptions::default(),
                    live_dev: None,
                }
            }
            None => {
                self.prepare(app, false, hash, Status::Started, UpdateOptions::default())
                    .await?
            }
        };
        payload.live_dev = Some(request.options);
        self.dispatch(LIVE_DEV, payload).await
    }

    pub async fn stop_live_dev(&self, application_id: Uuid, organization_id: Uuid) -> Result<bool, DeployError> {
        let app = self.load_application(application_id, organization_id).await?;
        self.live_dev.stop(app.id).await.map_err(DeployError::Run)
    }

    // ── Drafts ────────────────────────────────────────────────────────

    /// Store the application with a `draft` deployment; nothing runs.
    pub async fn create_draft_project(&self, request: CreateDeploymentRequest) -> Result<Triggered, DeployError> {
        request.validate().map_err(DeployError::Validation)?;
        let app = request.into_application();
        let payload = self
            .prepare(app, true, String::new(), Status::Draft, UpdateOptions::default())
            .await?;
        info!(app_id = %payload.application.id, "draft project created");
        Ok(Triggered::from(&payload))
    }

    /// Turn the draft deployment of `application_id` into a create task.
    pub async fn deploy_draft(&self, application_id: Uuid, organization_id: Uuid) -> Result<Triggered, DeployError> {
        let app = self.load_application(application_id, organization_id).await?;
        let draft = self
            .db
            .call(move |db| {
                for deployment in db.list_deployments(application_id)? {
                    if let Some(status) = db.get_latest_status(deployment.id)? {
                        if status.status == Status::Draft {
                            db.update_status(status.id, deployment.id, Status::Started)?;
                            return Ok(Some((deployment, status)));
                        }
                    }
                }
                Ok(None)
            })
            .await
            .map_err(DeployError::Storage)?;
        let Some((deployment, mut status)) = draft else {
            return Err(DeployError::Validation(format!(
                "application {application_id} is not a draft"
            )));
        };
        status.status = Status::Started;
        let payload = TaskPayload {
            correlation_id: Uuid::new_v4(),
            application: app,
            deployment,
            status,
            update_options: UpdateOptions::default(),
            live_dev: None,
        };
        self.dispatch(CREATE_DEPLOYMENT, payload).await
    }

    // ── Families ──────────────────────────────────────────────────────

    /// Copy the application into `environment`, sharing its family id.
    pub async fn add_to_family(
        &self,
        application_id: Uuid,
        organization_id: Uuid,
        environment: Environment,
    ) -> Result<Application, DeployError> {
        let source = self.load_application(application_id, organization_id).await?;
        if source.environment == environment {
            return Err(DeployError::Validation(format!(
                "application is already in {environment}"
            )));
        }
        let family_id = source.family_id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        let copy = Application {
            id: Uuid::new_v4(),
            environment,
            family_id: Some(family_id),
            domains: Vec::new(),
            created_at: now,
            updated_at: now,
            ..source.clone()
        };
        let row = copy.clone();
        let source_id = source.id;
        let has_family = source.family_id.is_some();
        let taken = self
            .db
            .call(move |db| {
                if db.is_environment_in_family(family_id, environment)? {
                    return Ok(true);
                }
                if !has_family {
                    db.update_application_family_id(source_id, family_id)?;
                }
                db.create_application(&row)?;
                Ok(false)
            })
            .await
            .map_err(DeployError::Storage)?;
        if taken {
            return Err(DeployError::Validation(format!(
                "family already has a {environment} application"
            )));
        }
        info!(app_id = %copy.id, family_id = %family_id, environment = %environment, "application added to family");
        Ok(copy)
    }

    pub async fn family(&self, application_id: Uuid, organization_id: Uuid) -> Result<Vec<Application>, DeployError> {
        let app = self.load_application(application_id, organization_id).await?;
        match app.family_id {
            Some(family_id) => self
                .db
                .call(move |db| db.get_projects_by_family_id(family_id))
                .await
                .map_err(DeployError::Storage),
            None => Ok(vec![app]),
        }
    }

    // ── Delete ────────────────────────────────────────────────────────

    /// Tear down runtime state, then delete the rows. Runtime cleanup is
    /// best-effort; each failure is logged and the cascade continues.
    pub async fn delete_application(&self, application_id: Uuid, organization_id: Uuid) -> Result<(), DeployError> {
        let app = self.load_application(application_id, organization_id).await?;
        let adapters = self.pipeline.adapters();
        let docker = adapters.docker.as_ref();
        let app_id = app.id.to_string();

        match containers_for_application(docker, &app_id).await {
            Ok(containers) => {
                for container in containers {
                    if container.is_running() {
                        if let Err(e) = docker.stop_container(&container.id, STOP_GRACE).await {
                            warn!(app_id = %app.id, container = %container.id, "stop failed: {e:#}");
                        }
                    }
                    if let Err(e) = docker.remove_container(&container.id, true).await {
                        warn!(app_id = %app.id, container = %container.id, "remove failed: {e:#}");
                    }
                }
            }
            Err(e) => warn!(app_id = %app.id, "listing containers failed: {e:#}"),
        }

        if app.build_pack == BuildPack::Dockerfile {
            if let Err(e) = docker.remove_image(&image_tag(&app), true).await {
                warn!(app_id = %app.id, "image removal failed: {e:#}");
            }
        }
        if let Err(e) = self.live_dev.stop(app.id).await {
            warn!(app_id = %app.id, "live-dev teardown failed: {e:#}");
        }

        let deployments = self
            .db
            .call(move |db| db.list_deployments(application_id))
            .await
            .map_err(DeployError::Storage)?;

        if app.build_pack == BuildPack::DockerCompose {
            if let Some(file) = deployments
                .iter()
                .rev()
                .map(|d| self.compose_file(&app, d))
                .find(|f| f.is_file())
            {
                if let Err(e) = docker.compose_down(&file).await {
                    warn!(app_id = %app.id, "compose down failed: {e:#}");
                }
            }
        }

        if !app.domains.is_empty() {
            for domain in &app.domains {
                if let Err(e) = adapters.proxy.delete_domain(domain).await {
                    warn!(app_id = %app.id, domain, "route removal failed: {e:#}");
                }
            }
            if let Err(e) = adapters.proxy.reload().await {
                warn!(app_id = %app.id, "proxy reload failed: {e:#}");
            }
        }

        let mut dirs: Vec<PathBuf> = deployments
            .iter()
            .map(|d| workdir_path(&self.mount_root, app.user_id, app.environment, d.id))
            .collect();
        dirs.push(self.staging_root().join(&app_id));
        for dir in dirs {
            if let Err(e) = adapters.git.remove_repository(&dir).await {
                warn!(app_id = %app.id, dir = %dir.display(), "workspace removal failed: {e:#}");
            }
        }

        let deleted = self
            .db
            .call(move |db| db.delete_application(application_id, organization_id))
            .await
            .map_err(DeployError::Storage)?;
        if !deleted {
            return Err(DeployError::not_found("application", application_id));
        }
        info!(app_id = %application_id, "application deleted");
        Ok(())
    }

    fn compose_file(&self, app: &Application, deployment: &ApplicationDeployment) -> PathBuf {
        let repo = workdir_path(&self.mount_root, app.user_id, app.environment, deployment.id);
        let base = app.base_path.trim_matches('/');
        let context = if base.is_empty() { repo } else { repo.join(base) };
        let name = if app.dockerfile_path.is_empty() || app.dockerfile_path == DEFAULT_DOCKERFILE {
            DEFAULT_COMPOSE_FILE
        } else {
            app.dockerfile_path.trim_start_matches('/')
        };
        context.join(name)
    }

    // ── Domains ───────────────────────────────────────────────────────

    /// Store the domain and route it to the running container.
    pub async fn add_domain(
        &self,
        application_id: Uuid,
        organization_id: Uuid,
        domain: &str,
    ) -> Result<Domain, DeployError> {
        let domain = domain.trim().to_ascii_lowercase();
        if !is_valid_domain(&domain) {
            return Err(DeployError::Validation(format!("invalid domain '{domain}'")));
        }
        let app = self.load_application(application_id, organization_id).await?;
        let name = domain.clone();
        let record = self
            .db
            .call(move |db| db.add_domain(application_id, &name))
            .await
            .map_err(DeployError::Storage)?;

        if let Some(port) = self.upstream_port(&app).await? {
            let adapters = self.pipeline.adapters();
            adapters
                .proxy
                .add_domain_with_auto_tls(&domain, self.pipeline.upstream_host(), port, RouteOptions::default())
                .await
                .map_err(DeployError::Proxy)?;
            adapters.proxy.reload().await.map_err(DeployError::Proxy)?;
        }
        Ok(record)
    }

    /// Host port currently serving `app`, if it has anything running.
    async fn upstream_port(&self, app: &Application) -> Result<Option<u16>, DeployError> {
        if app.build_pack == BuildPack::DockerCompose {
            return Ok(Some(app.port));
        }
        let private = if app.build_pack == BuildPack::Static { 80 } else { app.port };
        let containers = containers_for_application(self.pipeline.adapters().docker.as_ref(), &app.id.to_string())
            .await
            .map_err(DeployError::Run)?;
        Ok(containers
            .iter()
            .filter(|c| c.is_running())
            .find_map(|c| c.public_port(private)))
    }

    pub async fn remove_domain(&self, application_id: Uuid, organization_id: Uuid, domain: &str) -> Result<(), DeployError> {
        self.load_application(application_id, organization_id).await?;
        let domain = domain.trim().to_ascii_lowercase();
        let name = domain.clone();
        let removed = self
            .db
            .call(move |db| db.remove_domain(application_id, &name))
            .await
            .map_err(DeployError::Storage)?;
        if !removed {
            return Err(DeployError::not_found("domain", domain));
        }
        let proxy = &self.pipeline.adapters().proxy;
        proxy.delete_domain(&domain).await.map_err(DeployError::Proxy)?;
        proxy.reload().await.map_err(DeployError::Proxy)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub async fn get_application(&self, application_id: Uuid, organization_id: Uuid) -> Result<Application, DeployError> {
        self.load_application(application_id, organization_id).await
    }

    pub async fn list_applications(&self, organization_id: Uuid) -> Result<Vec<Application>, DeployError> {
        self.db
            .call(move |db| db.list_applications(organization_id))
            .await
            .map_err(DeployError::Storage)
    }

    pub async fn list_deployments(
        &self,
        application_id: Uuid,
        organization_id: Uuid,
    ) -> Result<Vec<ApplicationDeployment>, DeployError> {
        self.load_application(application_id, organization_id).await?;
        self.db
            .call(move |db| db.list_deployments(application_id))
            .await
            .map_err(DeployError::Storage)
    }

    pub async fn deployment_status(&self, deployment_id: Uuid) -> Result<DeploymentStatus, DeployError> {
        self.db
            .call(move |db| db.get_latest_status(deployment_id))
            .await
            .map_err(DeployError::Storage)?
            .ok_or_else(|| DeployError::not_found("deployment", deployment_id))
    }

    pub async fn get_logs(
        &self,
        deployment_id: Uuid,
        organization_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<LogPage, DeployError> {
        let deployment = self
            .db
            .call(move |db| db.get_deployment(deployment_id))
            .await
            .map_err(DeployError::Storage)?
            .ok_or_else(|| DeployError::not_found("deployment", deployment_id))?;
        self.load_application(deployment.application_id, organization_id)
            .await?;
        self.db
            .call(move |db| db.get_logs(deployment_id, page.max(1), page_size.clamp(1, 1000)))
            .await
            .map_err(DeployError::Storage)
    }

    /// Output of the application's running container.
    pub async fn container_logs(
        &self,
        application_id: Uuid,
        organization_id: Uuid,
        tail: Option<u32>,
    ) -> Result<String, DeployError> {
        use futures::StreamExt;

        let app = self.load_application(application_id, organization_id).await?;
        let docker = self.pipeline.adapters().docker.as_ref();
        let containers = containers_for_application(docker, &app.id.to_string())
            .await
            .map_err(DeployError::Run)?;
        let container = containers
            .iter()
            .find(|c| c.is_running())
            .ok_or(DeployError::ContainerNotRunning)?;
        let mut stream = docker
            .container_logs(
                &container.id,
                LogsOptions {
                    tail,
                    timestamps: false,
                },
            )
            .await
            .map_err(DeployError::Run)?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.context("Container log stream failed")?);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn load_application(&self, application_id: Uuid, organization_id: Uuid) -> Result<Application, DeployError> {
        self.db
            .call(move |db| db.get_application(application_id, organization_id))
            .await
            .map_err(DeployError::Storage)?
            .ok_or_else(|| DeployError::not_found("application", application_id))
    }

    async fn prepare(
        &self,
        application: Application,
        insert: bool,
        commit_hash: String,
        status: Status,
        update_options: UpdateOptions,
    ) -> Result<TaskPayload, DeployError> {
        let deployment = ApplicationDeployment::new(application.id, commit_hash);
        let status = DeploymentStatus::new(deployment.id, status);
        let payload = TaskPayload {
            correlation_id: Uuid::new_v4(),
            application,
            deployment,
            status,
            update_options,
            live_dev: None,
        };
        let (app, dep, row) = (
            payload.application.clone(),
            payload.deployment.clone(),
            payload.status.clone(),
        );
        self.db
            .call(move |db| db.prepare_deployment(&app, insert, &dep, &row))
            .await
            .map_err(DeployError::Prepare)?;
        Ok(payload)
    }

    async fn dispatch(&self, queue: &str, payload: TaskPayload) -> Result<Triggered, DeployError> {
        let triggered = Triggered::from(&payload);
        self.queue
            .enqueue(queue, payload)
            .await
            .with_context(|| format!("Failed to enqueue {queue} task"))?;
        info!(
            queue,
            app_id = %triggered.application_id,
            deployment_id = %triggered.deployment_id,
            correlation_id = %triggered.correlation_id,
            "deployment queued"
        );
        Ok(triggered)
    }
}
