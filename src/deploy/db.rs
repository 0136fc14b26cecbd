use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::models::*;

/// Async-safe handle to the deployment database.
///
/// Wraps `DeployDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<DeployDb>>,
}

impl DbHandle {
    pub fn new(db: DeployDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DeployDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, DeployDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// A task row left in `queued_tasks`.
#[derive(Debug, Clone)]
pub struct QueuedTaskRow {
    pub id: Uuid,
    pub queue: String,
    pub payload: String,
    pub state: String,
    pub reserved_at: Option<DateTime<Utc>>,
}

pub struct DeployDb {
    conn: Connection,
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{}'", s))?
        .with_timezone(&Utc))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid uuid '{}'", s))
}

impl DeployDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS applications (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    build_pack TEXT NOT NULL,
                    repository TEXT NOT NULL DEFAULT '',
                    branch TEXT NOT NULL DEFAULT '',
                    dockerfile_path TEXT NOT NULL DEFAULT 'Dockerfile',
                    base_path TEXT NOT NULL DEFAULT '/',
                    port INTEGER NOT NULL DEFAULT 0,
                    pre_run_command TEXT NOT NULL DEFAULT '',
                    post_run_command TEXT NOT NULL DEFAULT '',
                    build_variables TEXT NOT NULL DEFAULT '{}',
                    environment_variables TEXT NOT NULL DEFAULT '{}',
                    environment TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    organization_id TEXT NOT NULL,
                    family_id TEXT,
                    labels TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS application_domains (
                    id TEXT PRIMARY KEY,
                    application_id TEXT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                    domain TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(application_id, domain)
                );

                CREATE TABLE IF NOT EXISTS application_deployments (
                    id TEXT PRIMARY KEY,
                    application_id TEXT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                    commit_hash TEXT NOT NULL DEFAULT '',
                    container_id TEXT NOT NULL DEFAULT '',
                    container_name TEXT NOT NULL DEFAULT '',
                    container_image TEXT NOT NULL DEFAULT '',
                    container_status TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS application_deployment_status (
                    id TEXT PRIMARY KEY,
                    deployment_id TEXT NOT NULL REFERENCES application_deployments(id) ON DELETE CASCADE,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS application_logs (
                    id TEXT PRIMARY KEY,
                    application_id TEXT NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                    deployment_id TEXT NOT NULL REFERENCES application_deployments(id) ON DELETE CASCADE,
                    log TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS queued_tasks (
                    id TEXT PRIMARY KEY,
                    queue TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'queued',
                    reserved_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_apps_org ON applications(organization_id);
                CREATE INDEX IF NOT EXISTS idx_apps_repo_branch ON applications(repository, branch);
                CREATE INDEX IF NOT EXISTS idx_apps_family ON applications(family_id);
                CREATE INDEX IF NOT EXISTS idx_deployments_app ON application_deployments(application_id);
                CREATE INDEX IF NOT EXISTS idx_status_deployment ON application_deployment_status(deployment_id);
                CREATE INDEX IF NOT EXISTS idx_logs_deployment ON application_logs(deployment_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_queued_tasks_queue ON queued_tasks(queue, state);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Applications ──────────────────────────────────────────────────

    fn insert_application(&self, app: &Application) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO applications (id, name, build_pack, repository, branch, dockerfile_path, base_path, port,
                    pre_run_command, post_run_command, build_variables, environment_variables, environment,
                    user_id, organization_id, family_id, labels, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    app.id.to_string(),
                    app.name,
                    app.build_pack.as_str(),
                    app.repository,
                    app.branch,
                    app.dockerfile_path,
                    app.base_path,
                    app.port,
                    app.pre_run_command,
                    app.post_run_command,
                    serde_json::to_string(&app.build_variables)?,
                    serde_json::to_string(&app.environment_variables)?,
                    app.environment.as_str(),
                    app.user_id.to_string(),
                    app.organization_id.to_string(),
                    app.family_id.map(|f| f.to_string()),
                    serde_json::to_string(&app.labels)?,
                    ts(&app.created_at),
                    ts(&app.updated_at),
                ],
            )
            .context("Failed to insert application")?;
        for domain in &app.domains {
            self.add_domain(app.id, domain)?;
        }
        Ok(())
    }

    pub fn create_application(&self, app: &Application) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.insert_application(app)?;
        tx.commit().context("Failed to commit application")?;
        Ok(())
    }

    /// Overwrite the mutable fields of an application by id.
    pub fn update_application(&self, app: &Application) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE applications SET name = ?1, build_pack = ?2, repository = ?3, branch = ?4,
                    dockerfile_path = ?5, base_path = ?6, port = ?7, pre_run_command = ?8,
                    post_run_command = ?9, build_variables = ?10, environment_variables = ?11,
                    environment = ?12, family_id = ?13, labels = ?14, updated_at = ?15
                 WHERE id = ?16",
                params![
                    app.name,
                    app.build_pack.as_str(),
                    app.repository,
                    app.branch,
                    app.dockerfile_path,
                    app.base_path,
                    app.port,
                    app.pre_run_command,
                    app.post_run_command,
                    serde_json::to_string(&app.build_variables)?,
                    serde_json::to_string(&app.environment_variables)?,
                    app.environment.as_str(),
                    app.family_id.map(|f| f.to_string()),
                    serde_json::to_string(&app.labels)?,
                    ts(&app.updated_at),
                    app.id.to_string(),
                ],
            )
            .context("Failed to update application")?;
        if changed == 0 {
            anyhow::bail!("Application {} not found", app.id);
        }
        Ok(())
    }

    const APP_COLUMNS: &'static str = "id, name, build_pack, repository, branch, dockerfile_path, base_path, port,
        pre_run_command, post_run_command, build_variables, environment_variables, environment,
        user_id, organization_id, family_id, labels, created_at, updated_at";

    fn query_applications(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Application>> {
        let sql = format!(
            "SELECT {} FROM applications {} ORDER BY created_at",
            Self::APP_COLUMNS,
            where_clause
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare application query")?;
        let rows = stmt
            .query_map(params, ApplicationRow::from_row)
            .context("Failed to query applications")?;
        let mut apps = Vec::new();
        for row in rows {
            let row = row.context("Failed to read application row")?;
            let mut app = row.into_application()?;
            app.domains = self.list_domains(app.id)?.into_iter().map(|d| d.domain).collect();
            apps.push(app);
        }
        Ok(apps)
    }

    pub fn get_application(&self, id: Uuid, organization_id: Uuid) -> Result<Option<Application>> {
        Ok(self
            .query_applications(
                "WHERE id = ?1 AND organization_id = ?2",
                &[&id.to_string(), &organization_id.to_string()],
            )?
            .into_iter()
            .next())
    }

    /// Lookup without the organization scope, for internal flows.
    pub fn get_application_by_id(&self, id: Uuid) -> Result<Option<Application>> {
        Ok(self
            .query_applications("WHERE id = ?1", &[&id.to_string()])?
            .into_iter()
            .next())
    }

    pub fn list_applications(&self, organization_id: Uuid) -> Result<Vec<Application>> {
        self.query_applications("WHERE organization_id = ?1", &[&organization_id.to_string()])
    }

    /// Every application tracking `repository@branch`, across organizations.
    pub fn find_applications_by_repo_branch(
        &self,
        repository: &str,
        branch: &str,
    ) -> Result<Vec<Application>> {
        self.query_applications(
            "WHERE repository = ?1 AND branch = ?2",
            &[&repository, &branch],
        )
    }

    /// Delete the application row; dependent rows go by cascade.
    pub fn delete_application(&self, id: Uuid, organization_id: Uuid) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM applications WHERE id = ?1 AND organization_id = ?2",
                params![id.to_string(), organization_id.to_string()],
            )
            .context("Failed to delete application")?;
        Ok(changed > 0)
    }

    // ── Families ──────────────────────────────────────────────────────

    pub fn is_environment_in_family(&self, family_id: Uuid, environment: Environment) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM applications WHERE family_id = ?1 AND environment = ?2",
                params![family_id.to_string(), environment.as_str()],
                |row| row.get(0),
            )
            .context("Failed to query family environments")?;
        Ok(count > 0)
    }

    pub fn update_application_family_id(&self, id: Uuid, family_id: Uuid) -> Result<()> {
        self.conn
            .execute(
                "UPDATE applications SET family_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![family_id.to_string(), ts(&Utc::now()), id.to_string()],
            )
            .context("Failed to update family id")?;
        Ok(())
    }

    pub fn get_projects_by_family_id(&self, family_id: Uuid) -> Result<Vec<Application>> {
        self.query_applications("WHERE family_id = ?1", &[&family_id.to_string()])
    }

    // ── Domains ───────────────────────────────────────────────────────

    pub fn add_domain(&self, application_id: Uuid, domain: &str) -> Result<Domain> {
        let record = Domain {
            id: Uuid::new_v4(),
            application_id,
            domain: domain.to_string(),
            created_at: Utc::now(),
        };
        self.conn
            .execute(
                "INSERT INTO application_domains (id, application_id, domain, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(application_id, domain) DO NOTHING",
                params![
                    record.id.to_string(),
                    application_id.to_string(),
                    domain,
                    ts(&record.created_at)
                ],
            )
            .context("Failed to insert domain")?;
        Ok(record)
    }

    pub fn remove_domain(&self, application_id: Uuid, domain: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM application_domains WHERE application_id = ?1 AND domain = ?2",
                params![application_id.to_string(), domain],
            )
            .context("Failed to delete domain")?;
        Ok(changed > 0)
    }

    pub fn list_domains(&self, application_id: Uuid) -> Result<Vec<Domain>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, application_id, domain, created_at FROM application_domains
                 WHERE application_id = ?1 ORDER BY created_at, domain",
            )
            .context("Failed to prepare list_domains")?;
        let rows = stmt
            .query_map(params![application_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query domains")?;
        let mut domains = Vec::new();
        for row in rows {
            let (id, app_id, domain, created_at) = row.context("Failed to read domain row")?;
            domains.push(Domain {
                id: parse_uuid(&id)?,
                application_id: parse_uuid(&app_id)?,
                domain,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(domains)
    }

    // ── Deployments ───────────────────────────────────────────────────

    pub fn add_deployment(&self, deployment: &ApplicationDeployment) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO application_deployments (id, application_id, commit_hash, container_id,
                    container_name, container_image, container_status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    deployment.id.to_string(),
                    deployment.application_id.to_string(),
                    deployment.commit_hash,
                    deployment.container_id,
                    deployment.container_name,
                    deployment.container_image,
                    deployment.container_status,
                    ts(&deployment.created_at),
                    ts(&deployment.updated_at),
                ],
            )
            .context("Failed to insert deployment")?;
        Ok(())
    }

    pub fn update_deployment_commit(&self, id: Uuid, commit_hash: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE application_deployments SET commit_hash = ?1, updated_at = ?2 WHERE id = ?3",
                params![commit_hash, ts(&Utc::now()), id.to_string()],
            )
            .context("Failed to update deployment commit")?;
        Ok(())
    }

    /// Apply the present fields of `update`; absent fields are kept.
    pub fn update_deployment_container(&self, id: Uuid, update: &ContainerUpdate) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE application_deployments SET
                    container_id = COALESCE(?1, container_id),
                    container_name = COALESCE(?2, container_name),
                    container_image = COALESCE(?3, container_image),
                    container_status = COALESCE(?4, container_status),
                    updated_at = ?5
                 WHERE id = ?6",
                params![
                    update.container_id,
                    update.container_name,
                    update.container_image,
                    update.container_status,
                    ts(&Utc::now()),
                    id.to_string(),
                ],
            )
            .context("Failed to update deployment container fields")?;
        if changed == 0 {
            anyhow::bail!("Deployment {} not found", id);
        }
        Ok(())
    }

    const DEPLOYMENT_COLUMNS: &'static str = "id, application_id, commit_hash, container_id,
        container_name, container_image, container_status, created_at, updated_at";

    fn query_deployments(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ApplicationDeployment>> {
        let sql = format!(
            "SELECT {} FROM application_deployments {} ORDER BY created_at",
            Self::DEPLOYMENT_COLUMNS,
            where_clause
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare deployment query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .context("Failed to query deployments")?;
        let mut out = Vec::new();
        for row in rows {
            let (id, app_id, commit, cid, cname, cimage, cstatus, created, updated) =
                row.context("Failed to read deployment row")?;
            out.push(ApplicationDeployment {
                id: parse_uuid(&id)?,
                application_id: parse_uuid(&app_id)?,
                commit_hash: commit,
                container_id: cid,
                container_name: cname,
                container_image: cimage,
                container_status: cstatus,
                created_at: parse_ts(&created)?,
                updated_at: parse_ts(&updated)?,
            });
        }
        Ok(out)
    }

    pub fn get_deployment(&self, id: Uuid) -> Result<Option<ApplicationDeployment>> {
        Ok(self
            .query_deployments("WHERE id = ?1", &[&id.to_string()])?
            .into_iter()
            .next())
    }

    pub fn list_deployments(&self, application_id: Uuid) -> Result<Vec<ApplicationDeployment>> {
        self.query_deployments("WHERE application_id = ?1", &[&application_id.to_string()])
    }

    /// Most recent deployment of `application_id` carrying `commit_hash`.
    pub fn find_deployment_by_commit(
        &self,
        application_id: Uuid,
        commit_hash: &str,
    ) -> Result<Option<ApplicationDeployment>> {
        Ok(self
            .query_deployments(
                "WHERE application_id = ?1 AND commit_hash = ?2",
                &[&application_id.to_string(), &commit_hash],
            )?
            .into_iter()
            .last())
    }

    // ── Deployment status ─────────────────────────────────────────────

    pub fn add_status(&self, status: &DeploymentStatus) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO application_deployment_status (id, deployment_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    status.id.to_string(),
                    status.deployment_id.to_string(),
                    status.status.as_str(),
                    ts(&status.created_at),
                    ts(&status.updated_at),
                ],
            )
            .context("Failed to insert deployment status")?;
        Ok(())
    }

    /// Upsert the status row keyed by `status_id`.
    pub fn update_status(&self, status_id: Uuid, deployment_id: Uuid, status: Status) -> Result<()> {
        let now = ts(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO application_deployment_status (id, deployment_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
                params![
                    status_id.to_string(),
                    deployment_id.to_string(),
                    status.as_str(),
                    now
                ],
            )
            .context("Failed to update deployment status")?;
        Ok(())
    }

    pub fn get_status(&self, status_id: Uuid) -> Result<Option<DeploymentStatus>> {
        self.conn
            .query_row(
                "SELECT id, deployment_id, status, created_at, updated_at
                 FROM application_deployment_status WHERE id = ?1",
                params![status_id.to_string()],
                StatusRow::from_row,
            )
            .optional()
            .context("Failed to query deployment status")?
            .map(StatusRow::into_status)
            .transpose()
    }

    pub fn get_latest_status(&self, deployment_id: Uuid) -> Result<Option<DeploymentStatus>> {
        self.conn
            .query_row(
                "SELECT id, deployment_id, status, created_at, updated_at
                 FROM application_deployment_status WHERE deployment_id = ?1
                 ORDER BY updated_at DESC LIMIT 1",
                params![deployment_id.to_string()],
                StatusRow::from_row,
            )
            .optional()
            .context("Failed to query deployment status")?
            .map(StatusRow::into_status)
            .transpose()
    }

    // ── Prepare ───────────────────────────────────────────────────────

    /// Commit the rows a trigger needs in one transaction: the application
    /// (inserted when `insert_app`, otherwise updated), a new deployment and
    /// its initial status.
    pub fn prepare_deployment(
        &self,
        application: &Application,
        insert_app: bool,
        deployment: &ApplicationDeployment,
        status: &DeploymentStatus,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin prepare transaction")?;
        if insert_app {
            self.insert_application(application)?;
        } else {
            self.update_application(application)?;
        }
        self.add_deployment(deployment)?;
        self.add_status(status)?;
        tx.commit().context("Failed to commit prepare transaction")?;
        Ok(())
    }

    // ── Logs ──────────────────────────────────────────────────────────

    pub fn add_log(&self, log: &ApplicationLog) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO application_logs (id, application_id, deployment_id, log, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    log.id.to_string(),
                    log.application_id.to_string(),
                    log.deployment_id.to_string(),
                    log.log,
                    ts(&log.created_at),
                ],
            )
            .context("Failed to insert log")?;
        Ok(())
    }

    /// One page of a deployment's logs, oldest first. `page` starts at 1.
    pub fn get_logs(&self, deployment_id: Uuid, page: u32, page_size: u32) -> Result<LogPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 1000);
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM application_logs WHERE deployment_id = ?1",
                params![deployment_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to count logs")?;
        let offset = i64::from(page - 1) * i64::from(page_size);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, application_id, deployment_id, log, created_at FROM application_logs
                 WHERE deployment_id = ?1 ORDER BY created_at, rowid LIMIT ?2 OFFSET ?3",
            )
            .context("Failed to prepare get_logs")?;
        let rows = stmt
            .query_map(
                params![deployment_id.to_string(), page_size, offset],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .context("Failed to query logs")?;
        let mut logs = Vec::new();
        for row in rows {
            let (id, app_id, dep_id, log, created) = row.context("Failed to read log row")?;
            logs.push(ApplicationLog {
                id: parse_uuid(&id)?,
                application_id: parse_uuid(&app_id)?,
                deployment_id: parse_uuid(&dep_id)?,
                log,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(LogPage {
            logs,
            total: total as u64,
            page,
            page_size,
        })
    }

    // ── Durable queue ─────────────────────────────────────────────────

    pub fn enqueue_task(&self, id: Uuid, queue: &str, payload: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO queued_tasks (id, queue, payload, state, created_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4)",
                params![id.to_string(), queue, payload, ts(&Utc::now())],
            )
            .context("Failed to persist queued task")?;
        Ok(())
    }

    pub fn reserve_task(&self, id: Uuid) -> Result<()> {
        self.conn
            .execute(
                "UPDATE queued_tasks SET state = 'reserved', reserved_at = ?1 WHERE id = ?2",
                params![ts(&Utc::now()), id.to_string()],
            )
            .context("Failed to reserve queued task")?;
        Ok(())
    }

    pub fn complete_task(&self, id: Uuid) -> Result<()> {
        self.conn
            .execute("DELETE FROM queued_tasks WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete queued task")?;
        Ok(())
    }

    /// Rows to re-deliver after a restart: never reserved, or reserved
    /// before `reserved_before`.
    pub fn recoverable_tasks(
        &self,
        queue: &str,
        reserved_before: DateTime<Utc>,
    ) -> Result<Vec<QueuedTaskRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, queue, payload, state, reserved_at FROM queued_tasks
                 WHERE queue = ?1 AND (state = 'queued' OR (state = 'reserved' AND reserved_at < ?2))
                 ORDER BY created_at",
            )
            .context("Failed to prepare recoverable_tasks")?;
        let rows = stmt
            .query_map(params![queue, ts(&reserved_before)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .context("Failed to query queued tasks")?;
        let mut out = Vec::new();
        for row in rows {
            let (id, queue, payload, state, reserved_at) =
                row.context("Failed to read queued task row")?;
            out.push(QueuedTaskRow {
                id: parse_uuid(&id)?,
                queue,
                payload,
                state,
                reserved_at: reserved_at.as_deref().map(parse_ts).transpose()?,
            });
        }
        Ok(out)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

struct ApplicationRow {
    id: String,
    name: String,
    build_pack: String,
    repository: String,
    branch: String,
    dockerfile_path: String,
    base_path: String,
    port: u16,
    pre_run_command: String,
    post_run_command: String,
    build_variables: String,
    environment_variables: String,
    environment: String,
    user_id: String,
    organization_id: String,
    family_id: Option<String>,
    labels: String,
    created_at: String,
    updated_at: String,
}

impl ApplicationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            build_pack: row.get(2)?,
            repository: row.get(3)?,
            branch: row.get(4)?,
            dockerfile_path: row.get(5)?,
            base_path: row.get(6)?,
            port: row.get(7)?,
            pre_run_command: row.get(8)?,
            post_run_command: row.get(9)?,
            build_variables: row.get(10)?,
            environment_variables: row.get(11)?,
            environment: row.get(12)?,
            user_id: row.get(13)?,
            organization_id: row.get(14)?,
            family_id: row.get(15)?,
            labels: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn into_application(self) -> Result<Application> {
        let build_pack = BuildPack::from_str(&self.build_pack)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse build pack")?;
        let environment = Environment::from_str(&self.environment)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse environment")?;
        Ok(Application {
            id: parse_uuid(&self.id)?,
            name: self.name,
            build_pack,
            repository: self.repository,
            branch: self.branch,
            dockerfile_path: self.dockerfile_path,
            base_path: self.base_path,
            port: self.port,
            pre_run_command: self.pre_run_command,
            post_run_command: self.post_run_command,
            build_variables: serde_json::from_str(&self.build_variables)
                .context("Failed to parse build variables JSON")?,
            environment_variables: serde_json::from_str(&self.environment_variables)
                .context("Failed to parse environment variables JSON")?,
            domains: Vec::new(),
            environment,
            user_id: parse_uuid(&self.user_id)?,
            organization_id: parse_uuid(&self.organization_id)?,
            family_id: self.family_id.as_deref().map(parse_uuid).transpose()?,
            labels: serde_json::from_str(&self.labels).context("Failed to parse labels JSON")?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct StatusRow {
    id: String,
    deployment_id: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl StatusRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            deployment_id: row.get(1)?,
            status: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_status(self) -> Result<DeploymentStatus> {
        Ok(DeploymentStatus {
            id: parse_uuid(&self.id)?,
            deployment_id: parse_uuid(&self.deployment_id)?,
            status: Status::parse(&self.status),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_app(name: &str) -> Application {
        CreateDeploymentRequest {
            name: name.to_string(),
            build_pack: BuildPack::Dockerfile,
            repository: "42".into(),
            branch: "main".into(),
            dockerfile_path: None,
            base_path: None,
            port: 3000,
            pre_run_command: String::new(),
            post_run_command: String::new(),
            build_variables: "NODE_ENV=production".into(),
            environment_variables: "PORT=3000 API_TOKEN=s3cret".into(),
            domains: vec!["a.example".into()],
            environment: Environment::Production,
            user_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            labels: vec!["team-a".into()],
        }
        .into_application()
    }

    fn seeded() -> Result<(DeployDb, Application, ApplicationDeployment, DeploymentStatus)> {
        let db = DeployDb::new_in_memory()?;
        let app = sample_app("web");
        let dep = ApplicationDeployment::new(app.id, "");
        let status = DeploymentStatus::new(dep.id, Status::Started);
        db.prepare_deployment(&app, true, &dep, &status)?;
        Ok((db, app, dep, status))
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = DeployDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('applications', 'application_domains', 'application_deployments',
              'application_deployment_status', 'application_logs', 'queued_tasks')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 6);
        Ok(())
    }

    #[test]
    fn test_prepare_commits_all_rows() -> Result<()> {
        let (db, app, dep, status) = seeded()?;
        let fetched = db
            .get_application(app.id, app.organization_id)?
            .expect("application should exist");
        assert_eq!(fetched.name, "web");
        assert_eq!(fetched.domains, vec!["a.example".to_string()]);
        assert_eq!(fetched.environment_variables.get("API_TOKEN"), Some("s3cret"));
        assert!(db.get_deployment(dep.id)?.is_some());
        assert_eq!(db.get_status(status.id)?.map(|s| s.status), Some(Status::Started));
        Ok(())
    }

    #[test]
    fn test_prepare_rolls_back_on_failure() -> Result<()> {
        let (db, app, _, _) = seeded()?;
        // Re-inserting the same application id violates the primary key.
        let dep = ApplicationDeployment::new(app.id, "");
        let status = DeploymentStatus::new(dep.id, Status::Started);
        assert!(db.prepare_deployment(&app, true, &dep, &status).is_err());
        assert!(db.get_deployment(dep.id)?.is_none());
        assert!(db.get_status(status.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_prepare_update_of_missing_app_rolls_back() -> Result<()> {
        let db = DeployDb::new_in_memory()?;
        let app = sample_app("ghost");
        let dep = ApplicationDeployment::new(app.id, "");
        let status = DeploymentStatus::new(dep.id, Status::Started);
        assert!(db.prepare_deployment(&app, false, &dep, &status).is_err());
        assert!(db.get_deployment(dep.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_get_application_is_org_scoped() -> Result<()> {
        let (db, app, _, _) = seeded()?;
        assert!(db.get_application(app.id, Uuid::new_v4())?.is_none());
        assert!(db.get_application_by_id(app.id)?.is_some());
        Ok(())
    }

    #[test]
    fn test_update_status_last_write_wins() -> Result<()> {
        let (db, _, dep, status) = seeded()?;
        for s in [Status::Cloning, Status::Building, Status::Failed, Status::Deploying] {
            db.update_status(status.id, dep.id, s)?;
        }
        assert_eq!(db.get_status(status.id)?.map(|s| s.status), Some(Status::Deploying));
        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM application_deployment_status WHERE deployment_id = ?1",
            params![dep.id.to_string()],
            |row| row.get(0),
        )?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn test_update_deployment_container_partial() -> Result<()> {
        let (db, _, dep, _) = seeded()?;
        db.update_deployment_container(
            dep.id,
            &ContainerUpdate {
                container_id: Some("abc".into()),
                container_status: Some("running".into()),
                ..Default::default()
            },
        )?;
        db.update_deployment_container(
            dep.id,
            &ContainerUpdate {
                container_name: Some("/web".into()),
                ..Default::default()
            },
        )?;
        let fetched = db.get_deployment(dep.id)?.expect("deployment");
        assert_eq!(fetched.container_id, "abc");
        assert_eq!(fetched.container_name, "/web");
        assert_eq!(fetched.container_status, "running");
        Ok(())
    }

    #[test]
    fn test_logs_paginate_oldest_first() -> Result<()> {
        let (db, app, dep, _) = seeded()?;
        for i in 0..5 {
            db.add_log(&ApplicationLog {
                id: Uuid::new_v4(),
                application_id: app.id,
                deployment_id: dep.id,
                log: format!("line {i}"),
                created_at: Utc::now(),
            })?;
        }
        let first = db.get_logs(dep.id, 1, 2)?;
        assert_eq!(first.total, 5);
        assert_eq!(first.logs.len(), 2);
        assert_eq!(first.logs[0].log, "line 0");
        let last = db.get_logs(dep.id, 3, 2)?;
        assert_eq!(last.logs.len(), 1);
        assert_eq!(last.logs[0].log, "line 4");
        Ok(())
    }

    #[test]
    fn test_find_by_repo_branch_spans_orgs() -> Result<()> {
        let db = DeployDb::new_in_memory()?;
        let a = sample_app("a");
        let b = sample_app("b");
        let mut c = sample_app("c");
        c.branch = "dev".into();
        for app in [&a, &b, &c] {
            db.create_application(app)?;
        }
        let found = db.find_applications_by_repo_branch("42", "main")?;
        assert_eq!(found.len(), 2);
        Ok(())
    }

    #[test]
    fn test_family_queries() -> Result<()> {
        let db = DeployDb::new_in_memory()?;
        let app = sample_app("fam");
        db.create_application(&app)?;
        let family = Uuid::new_v4();
        db.update_application_family_id(app.id, family)?;
        assert!(db.is_environment_in_family(family, Environment::Production)?);
        assert!(!db.is_environment_in_family(family, Environment::Staging)?);
        assert_eq!(db.get_projects_by_family_id(family)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_domains_add_remove() -> Result<()> {
        let (db, app, _, _) = seeded()?;
        db.add_domain(app.id, "b.example")?;
        db.add_domain(app.id, "b.example")?;
        assert_eq!(db.list_domains(app.id)?.len(), 2);
        assert!(db.remove_domain(app.id, "a.example")?);
        assert!(!db.remove_domain(app.id, "a.example")?);
        assert_eq!(db.list_domains(app.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_delete_application_cascades() -> Result<()> {
        let (db, app, dep, status) = seeded()?;
        assert!(db.delete_application(app.id, app.organization_id)?);
        assert!(db.get_deployment(dep.id)?.is_none());
        assert!(db.get_status(status.id)?.is_none());
        assert!(db.list_domains(app.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_queued_task_lifecycle() -> Result<()> {
        let db = DeployDb::new_in_memory()?;
        let id = Uuid::new_v4();
        db.enqueue_task(id, "create-deployment", "{}")?;
        assert_eq!(db.recoverable_tasks("create-deployment", Utc::now())?.len(), 1);
        db.reserve_task(id)?;
        let cutoff = Utc::now() - chrono::Duration::seconds(10);
        assert!(db.recoverable_tasks("create-deployment", cutoff)?.is_empty());
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(db.recoverable_tasks("create-deployment", later)?.len(), 1);
        db.complete_task(id)?;
        assert!(db.recoverable_tasks("create-deployment", later)?.is_empty());
        Ok(())
    }
}
