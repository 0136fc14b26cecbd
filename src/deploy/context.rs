use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use super::db::DbHandle;
use super::models::{ApplicationLog, ContainerUpdate, Status, TaskPayload};
use crate::errors::DeployError;

/// Per-task handle bound to one `(application, deployment, status row)`.
///
/// Created by a queue handler for the task it is running and dropped when
/// the handler returns.
#[derive(Clone)]
pub struct TaskContext {
    db: DbHandle,
    pub application_id: Uuid,
    pub deployment_id: Uuid,
    pub status_id: Uuid,
    pub correlation_id: Uuid,
}

impl TaskContext {
    pub fn new(
        db: DbHandle,
        application_id: Uuid,
        deployment_id: Uuid,
        status_id: Uuid,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            db,
            application_id,
            deployment_id,
            status_id,
            correlation_id,
        }
    }

    pub fn from_payload(db: DbHandle, payload: &TaskPayload) -> Self {
        Self::new(
            db,
            payload.application.id,
            payload.deployment.id,
            payload.status.id,
            payload.correlation_id,
        )
    }

    /// Context for a live-dev session: attached to the synthetic
    /// deployment whose commit hash is [`live_dev_commit_hash`].
    pub fn for_live_dev(db: DbHandle, payload: &TaskPayload) -> Self {
        Self::from_payload(db, payload)
    }

    /// Write one log row. Never fails; a storage error is reported once at
    /// error level and the log line is dropped.
    pub async fn add_log(&self, text: impl Into<String>) {
        let log = ApplicationLog {
            id: Uuid::new_v4(),
            application_id: self.application_id,
            deployment_id: self.deployment_id,
            log: text.into(),
            created_at: Utc::now(),
        };
        let result = self.db.call(move |db| db.add_log(&log)).await;
        if let Err(e) = result {
            error!(
                deployment_id = %self.deployment_id,
                correlation_id = %self.correlation_id,
                "failed to write deployment log: {e:#}"
            );
        }
    }

    pub async fn update_status(&self, status: Status) -> Result<(), DeployError> {
        let (status_id, deployment_id) = (self.status_id, self.deployment_id);
        self.db
            .call(move |db| db.update_status(status_id, deployment_id, status))
            .await
            .map_err(DeployError::Storage)?;
        info!(
            deployment_id = %self.deployment_id,
            correlation_id = %self.correlation_id,
            status = %status,
            "deployment status changed"
        );
        Ok(())
    }

    /// Log first, then transition.
    pub async fn log_and_update_status(
        &self,
        text: impl Into<String>,
        status: Status,
    ) -> Result<(), DeployError> {
        self.add_log(text).await;
        self.update_status(status).await
    }

    pub async fn update_deployment(&self, update: ContainerUpdate) -> Result<(), DeployError> {
        let deployment_id = self.deployment_id;
        self.db
            .call(move |db| db.update_deployment_container(deployment_id, &update))
            .await
            .map_err(DeployError::Storage)
    }

    /// Record a handler failure: the error text becomes the last log row
    /// and the status ends as `failed`.
    pub async fn fail(&self, err: &DeployError) {
        if let Err(e) = self.log_and_update_status(err.to_string(), Status::Failed).await {
            error!(
                deployment_id = %self.deployment_id,
                "failed to record deployment failure: {e}"
            );
        }
    }
}

/// Synthetic commit hash of the deployment a live-dev session reports to.
pub fn live_dev_commit_hash(application_id: Uuid) -> String {
    let id = application_id.to_string();
    format!("live-dev-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::db::DeployDb;
    use crate::deploy::db::tests::sample_app;
    use crate::deploy::models::{ApplicationDeployment, DeploymentStatus};

    async fn context() -> (DbHandle, TaskContext) {
        let db = DeployDb::new_in_memory().unwrap();
        let app = sample_app("ctx");
        let dep = ApplicationDeployment::new(app.id, "");
        let status = DeploymentStatus::new(dep.id, Status::Started);
        db.prepare_deployment(&app, true, &dep, &status).unwrap();
        let handle = DbHandle::new(db);
        let ctx = TaskContext::new(handle.clone(), app.id, dep.id, status.id, Uuid::new_v4());
        (handle, ctx)
    }

    #[tokio::test]
    async fn test_add_log_writes_exactly_one_row() {
        let (db, ctx) = context().await;
        let before = Utc::now();
        ctx.add_log("Cloning repository").await;
        let page = db
            .call(move |db| db.get_logs(ctx.deployment_id, 1, 100))
            .await
            .unwrap();
        let matching: Vec<_> = page
            .logs
            .iter()
            .filter(|l| l.log == "Cloning repository")
            .collect();
        assert_eq!(matching.len(), 1);
        assert!(matching[0].created_at >= before);
    }

    #[tokio::test]
    async fn test_add_log_swallows_storage_errors() {
        let db = DbHandle::new(DeployDb::new_in_memory().unwrap());
        // Unknown deployment violates the foreign key; must not panic or error.
        let ctx = TaskContext::new(db, Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        ctx.add_log("orphan").await;
    }

    #[tokio::test]
    async fn test_log_and_update_status_orders_log_first() {
        let (db, ctx) = context().await;
        ctx.log_and_update_status("Build failed", Status::Failed)
            .await
            .unwrap();
        let (dep_id, status_id) = (ctx.deployment_id, ctx.status_id);
        let (page, status) = db
            .call(move |db| Ok((db.get_logs(dep_id, 1, 10)?, db.get_status(status_id)?)))
            .await
            .unwrap();
        assert_eq!(page.logs.last().map(|l| l.log.as_str()), Some("Build failed"));
        assert_eq!(status.map(|s| s.status), Some(Status::Failed));
    }

    #[tokio::test]
    async fn test_fail_writes_error_text_as_last_log() {
        let (db, ctx) = context().await;
        ctx.add_log("Starting").await;
        ctx.fail(&DeployError::ContainerNotRunning).await;
        let dep_id = ctx.deployment_id;
        let page = db.call(move |db| db.get_logs(dep_id, 1, 10)).await.unwrap();
        assert_eq!(
            page.logs.last().map(|l| l.log.as_str()),
            Some("container not running")
        );
    }

    #[test]
    fn test_live_dev_commit_hash_uses_id_prefix() {
        let id = Uuid::parse_str("0123abcd-0000-4000-8000-000000000000").unwrap();
        assert_eq!(live_dev_commit_hash(id), "live-dev-0123abcd");
    }
}
