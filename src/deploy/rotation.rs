//! Zero-downtime container replacement for one application.
//!
//! Order: create new, stop old, start new, verify. The new container is
//! stopped and force-removed if it is not running after the settle delay.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::anyhow;
use tracing::warn;
use uuid::Uuid;

use super::context::TaskContext;
use super::models::{Application, ContainerUpdate, EnvMap, masked_env};
use super::ports::allocate_port;
use crate::docker::{
    APPLICATION_ID_LABEL, APPLICATION_NAME_LABEL, COMMIT_HASH_LABEL, ContainerSpec,
    DEPLOYMENT_ID_LABEL, DockerAdapter, PROJECT_LABEL, USER_ID_LABEL, containers_for_application,
};
use crate::errors::DeployError;
use crate::ssh::CommandRunner;

pub const STOP_GRACE: Duration = Duration::from_secs(10);
pub const STARTUP_SETTLE: Duration = Duration::from_secs(5);
pub const CONTAINER_HOSTNAME: &str = "nixopus";
pub const STATIC_IMAGE: &str = "nginx:alpine";
pub const STATIC_CONTENT_ROOT: &str = "/usr/share/nginx/html";

/// What to run for the new container.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub image: String,
    pub container_port: u16,
    pub env: EnvMap,
    pub binds: Vec<String>,
}

impl RunPlan {
    /// `{app_name}:latest` listening on the declared port.
    pub fn image(app: &Application) -> Self {
        Self {
            image: image_tag(app),
            container_port: app.port,
            env: app.environment_variables.clone(),
            binds: Vec::new(),
        }
    }

    /// nginx serving `content_root` read-only.
    pub fn static_site(app: &Application, content_root: &str) -> Self {
        Self {
            image: STATIC_IMAGE.to_string(),
            container_port: 80,
            env: app.environment_variables.clone(),
            binds: vec![format!("{content_root}:{STATIC_CONTENT_ROOT}:ro")],
        }
    }
}

pub fn image_tag(app: &Application) -> String {
    format!("{}:latest", sanitize_name(&app.name))
}

/// Lowercase `[a-z0-9_.-]` form of an application name.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '-' || c == '.').to_string();
    if cleaned.is_empty() { "app".to_string() } else { cleaned }
}

pub fn container_labels(app: &Application, deployment_id: Uuid, commit_hash: &str) -> HashMap<String, String> {
    HashMap::from([
        (APPLICATION_ID_LABEL.to_string(), app.id.to_string()),
        (APPLICATION_NAME_LABEL.to_string(), app.name.clone()),
        (DEPLOYMENT_ID_LABEL.to_string(), deployment_id.to_string()),
        (COMMIT_HASH_LABEL.to_string(), commit_hash.to_string()),
        (USER_ID_LABEL.to_string(), app.user_id.to_string()),
        (PROJECT_LABEL.to_string(), "nixopus".to_string()),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub host_port: u16,
}

pub struct Rotation<'a> {
    pub docker: &'a dyn DockerAdapter,
    pub runner: &'a dyn CommandRunner,
    pub settle: Duration,
}

impl Rotation<'_> {
    pub async fn run(
        &self,
        ctx: &TaskContext,
        app: &Application,
        commit_hash: &str,
        plan: RunPlan,
    ) -> Result<RunningContainer, DeployError> {
        let app_id = app.id.to_string();
        let old = containers_for_application(self.docker, &app_id)
            .await
            .map_err(DeployError::Run)?;
        ctx.add_log(format!("Found {} existing container(s)", old.len()))
            .await;

        let host_port = allocate_port(self.runner).await.map_err(DeployError::Run)?;
        ctx.add_log(format!("Using host port {host_port}")).await;

        let name = format!(
            "{}-{}",
            sanitize_name(&app.name),
            &ctx.deployment_id.simple().to_string()[..8]
        );
        ctx.add_log(format!(
            "Creating container {} from {} with env [{}]",
            name,
            plan.image,
            masked_env(&plan.env).join(" ")
        ))
        .await;
        let spec = ContainerSpec {
            name: name.clone(),
            image: plan.image.clone(),
            hostname: CONTAINER_HOSTNAME.to_string(),
            env: plan.env.to_env_list(),
            container_port: plan.container_port,
            host_port,
            network_mode: "bridge".to_string(),
            labels: container_labels(app, ctx.deployment_id, commit_hash),
            binds: plan.binds,
        };
        let id = self
            .docker
            .create_container(spec)
            .await
            .map_err(DeployError::Run)?;

        for container in &old {
            ctx.add_log(format!("Stopping old container {}", short_id(&container.id)))
                .await;
            if let Err(e) = self.docker.stop_container(&container.id, STOP_GRACE).await {
                warn!(container = %container.id, "failed to stop old container: {e:#}");
                ctx.add_log(format!(
                    "Failed to stop old container {}: {e}",
                    short_id(&container.id)
                ))
                .await;
            }
        }

        ctx.add_log(format!("Starting container {}", short_id(&id))).await;
        if let Err(e) = self.docker.start_container(&id).await {
            self.discard(&id).await;
            return Err(DeployError::Run(e));
        }

        tokio::time::sleep(self.settle).await;
        let state = self
            .docker
            .get_container_by_id(&id)
            .await
            .map_err(DeployError::Run)?;
        if !state.running {
            self.discard(&id).await;
            return Err(DeployError::Run(anyhow!(
                "Container {} is not running (status: {})",
                short_id(&id),
                if state.status.is_empty() { "unknown" } else { &state.status }
            )));
        }

        ctx.update_deployment(ContainerUpdate {
            container_id: Some(id.clone()),
            container_name: Some(name.clone()),
            container_image: Some(plan.image.clone()),
            container_status: Some("running".to_string()),
        })
        .await?;
        ctx.add_log(format!("Container {} is running on port {}", short_id(&id), host_port))
            .await;
        Ok(RunningContainer {
            id,
            name,
            image: plan.image,
            host_port,
        })
    }

    async fn discard(&self, id: &str) {
        if let Err(e) = self.docker.stop_container(id, STOP_GRACE).await {
            warn!(container = %id, "failed to stop container: {e:#}");
        }
        if let Err(e) = self.docker.remove_container(id, true).await {
            warn!(container = %id, "failed to remove container: {e:#}");
        }
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
