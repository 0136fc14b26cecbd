//! Push events from the git host turned into update tasks.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::service::{DeployService, Triggered};
use crate::errors::DeployError;

pub const PUSH_EVENT: &str = "push";
pub const IGNORED: &str = "ignored";

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository: RepositoryRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRef {
    /// Numeric on GitHub, a string on some other hosts.
    pub id: Value,
    #[serde(default)]
    pub full_name: Option<String>,
}

impl RepositoryRef {
    /// Identifiers an application's `repository` field may hold.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids = Vec::new();
        match &self.id {
            Value::String(s) if !s.is_empty() => ids.push(s.clone()),
            Value::Number(n) => ids.push(n.to_string()),
            _ => {}
        }
        if let Some(name) = self.full_name.as_ref().filter(|n| !n.is_empty()) {
            ids.push(name.clone());
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookResponse {
    pub message: String,
    pub deployments: Vec<Triggered>,
}

impl WebhookResponse {
    fn ignored() -> Self {
        Self {
            message: IGNORED.to_string(),
            deployments: Vec::new(),
        }
    }
}

/// `refs/heads/<branch>` → `<branch>`.
pub fn branch_from_ref(git_ref: &str) -> Option<&str> {
    git_ref
        .strip_prefix("refs/heads/")
        .filter(|b| !b.is_empty())
}

/// Enqueue a forced update for every application tracking the pushed
/// repository and branch, in any organization.
pub async fn handle_event(service: &DeployService, event: &str, body: &[u8]) -> Result<WebhookResponse, DeployError> {
    if !event.eq_ignore_ascii_case(PUSH_EVENT) {
        return Ok(WebhookResponse::ignored());
    }
    let push: PushEvent = serde_json::from_slice(body)
        .map_err(|e| DeployError::Validation(format!("invalid push payload: {e}")))?;
    let Some(branch) = branch_from_ref(&push.git_ref) else {
        return Ok(WebhookResponse::ignored());
    };

    let mut seen = HashSet::new();
    let mut apps = Vec::new();
    for repository in push.repository.identifiers() {
        let branch = branch.to_string();
        let found = service
            .db()
            .call(move |db| db.find_applications_by_repo_branch(&repository, &branch))
            .await
            .map_err(DeployError::Storage)?;
        apps.extend(found.into_iter().filter(|a| seen.insert(a.id)));
    }

    let mut deployments = Vec::with_capacity(apps.len());
    for app in apps {
        let app_id = app.id;
        match service.enqueue_webhook_update(app).await {
            Ok(triggered) => deployments.push(triggered),
            Err(e) => warn!(app_id = %app_id, "webhook update not queued: {e}"),
        }
    }
    info!(branch, queued = deployments.len(), "push event handled");
    Ok(WebhookResponse {
        message: format!("queued {} deployment(s)", deployments.len()),
        deployments,
    })
}
