use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Enums ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildPack {
    Dockerfile,
    DockerCompose,
    Static,
}

impl BuildPack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dockerfile => "dockerfile",
            Self::DockerCompose => "docker-compose",
            Self::Static => "static",
        }
    }
}

impl FromStr for BuildPack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dockerfile" => Ok(Self::Dockerfile),
            "docker-compose" => Ok(Self::DockerCompose),
            "static" => Ok(Self::Static),
            _ => Err(format!("Invalid build pack: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment status journal values. Strings this build does not know
/// deserialize as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Started,
    Cloning,
    Building,
    Deploying,
    Deployed,
    Running,
    Stopped,
    Failed,
    Draft,
    #[serde(other)]
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Cloning => "cloning",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Draft => "draft",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Deployed | Self::Failed | Self::Stopped | Self::Running
        )
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "started" => Self::Started,
            "cloning" => Self::Cloning,
            "building" => Self::Building,
            "deploying" => Self::Deploying,
            "deployed" => Self::Deployed,
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "failed" => Self::Failed,
            "draft" => Self::Draft,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Variable maps ────────────────────────────────────────────────────

/// Build or environment variables.
///
/// Held as an ordered map so serialization is deterministic. The external
/// text form is space-separated `k=v` pairs, which cannot represent keys or
/// values containing spaces, nor keys containing `=`; such entries do not
/// survive a round trip through [`get_string_from_map`] /
/// [`get_map_from_string`]. Storage keeps the structured JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvMap(pub BTreeMap<String, String>);

impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// `KEY=value` strings as containers expect them.
    pub fn to_env_list(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// `self` overlaid with `other`; keys in `other` win.
    pub fn merged_with(&self, other: &EnvMap) -> EnvMap {
        let mut merged = self.0.clone();
        for (k, v) in &other.0 {
            merged.insert(k.clone(), v.clone());
        }
        EnvMap(merged)
    }
}

impl FromIterator<(String, String)> for EnvMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Encode as space-separated `k=v`. Lossy, see [`EnvMap`].
pub fn get_string_from_map(map: &EnvMap) -> String {
    map.0
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode space-separated `k=v`. Tokens without `=` or with an empty key are
/// dropped; the value is everything after the first `=`.
pub fn get_map_from_string(s: &str) -> EnvMap {
    s.split_whitespace()
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            if k.is_empty() {
                None
            } else {
                Some((k.to_string(), v.to_string()))
            }
        })
        .collect()
}

const SENSITIVE_MARKERS: &[&str] = &[
    "password",
    "secret",
    "token",
    "key",
    "auth",
    "credential",
    "private",
];

pub const MASK: &str = "********";

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| lower.contains(m))
}

/// `k=v` pairs for log output with sensitive values replaced by [`MASK`].
pub fn masked_env(map: &EnvMap) -> Vec<String> {
    map.0
        .iter()
        .map(|(k, v)| {
            if is_sensitive_key(k) {
                format!("{k}={MASK}")
            } else {
                format!("{k}={v}")
            }
        })
        .collect()
}

// ── Entities ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub name: String,
    pub build_pack: BuildPack,
    /// Repository identifier as known to the git host.
    pub repository: String,
    pub branch: String,
    pub dockerfile_path: String,
    pub base_path: String,
    pub port: u16,
    pub pre_run_command: String,
    pub post_run_command: String,
    pub build_variables: EnvMap,
    pub environment_variables: EnvMap,
    pub domains: Vec<String>,
    pub environment: Environment,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub family_id: Option<Uuid>,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";
pub const DEFAULT_BASE_PATH: &str = "/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDeployment {
    pub id: Uuid,
    pub application_id: Uuid,
    pub commit_hash: String,
    pub container_id: String,
    pub container_name: String,
    pub container_image: String,
    pub container_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationDeployment {
    pub fn new(application_id: Uuid, commit_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            application_id,
            commit_hash: commit_hash.into(),
            container_id: String::new(),
            container_name: String::new(),
            container_image: String::new(),
            container_status: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentStatus {
    pub fn new(deployment_id: Uuid, status: Status) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            deployment_id,
            status,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationLog {
    pub id: Uuid,
    pub application_id: Uuid,
    pub deployment_id: Uuid,
    pub log: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub application_id: Uuid,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

/// Container fields written onto a deployment after the run stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerUpdate {
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub container_image: Option<String>,
    pub container_status: Option<String>,
}

// ── Task payload ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOptions {
    pub force: bool,
    pub force_without_cache: bool,
}

impl UpdateOptions {
    /// Options for webhook-triggered redeploys.
    pub fn webhook() -> Self {
        Self {
            force: true,
            force_without_cache: false,
        }
    }
}

/// Which trigger produced a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Create,
    Update,
    Redeploy,
    Rollback,
    Restart,
    LiveDev,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Redeploy => "redeploy",
            Self::Rollback => "rollback",
            Self::Restart => "restart",
            Self::LiveDev => "live_dev",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live-dev settings carried through the `live-dev` queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveDevOptions {
    pub framework: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub env: EnvMap,
    pub domain: Option<String>,
}

/// Envelope serialized through the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub correlation_id: Uuid,
    pub application: Application,
    pub deployment: ApplicationDeployment,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub update_options: UpdateOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_dev: Option<LiveDevOptions>,
}

// ── Requests ─────────────────────────────────────────────────────────

/// New application plus its first deployment. Variable fields use the
/// space-separated `k=v` text form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub build_pack: BuildPack,
    pub repository: String,
    pub branch: String,
    #[serde(default)]
    pub dockerfile_path: Option<String>,
    #[serde(default)]
    pub base_path: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub pre_run_command: String,
    #[serde(default)]
    pub post_run_command: String,
    #[serde(default)]
    pub build_variables: String,
    #[serde(default)]
    pub environment_variables: String,
    #[serde(default)]
    pub domains: Vec<String>,
    pub environment: Environment,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    #[serde(default)]
    pub labels: Vec<String>,
}

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\*\.)?([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)*[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$")
        .unwrap()
});

/// Host name accepted as a proxy route: dot-separated labels, optionally
/// behind a leading `*.` wildcard.
pub fn is_valid_domain(domain: &str) -> bool {
    domain.len() <= 253 && DOMAIN_RE.is_match(domain)
}

impl CreateDeploymentRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".into());
        }
        if self.repository.trim().is_empty() {
            return Err("repository is required".into());
        }
        if self.branch.trim().is_empty() {
            return Err("branch is required".into());
        }
        if self.port == 0 && self.build_pack == BuildPack::Dockerfile {
            return Err("port must be between 1 and 65535".into());
        }
        for domain in &self.domains {
            if !is_valid_domain(domain) {
                return Err(format!("invalid domain '{domain}'"));
            }
        }
        Ok(())
    }

    pub fn into_application(self) -> Application {
        let now = Utc::now();
        Application {
            id: Uuid::new_v4(),
            name: self.name,
            build_pack: self.build_pack,
            repository: self.repository,
            branch: self.branch,
            dockerfile_path: self
                .dockerfile_path
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string()),
            base_path: self
                .base_path
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_PATH.to_string()),
            port: self.port,
            pre_run_command: self.pre_run_command,
            post_run_command: self.post_run_command,
            build_variables: get_map_from_string(&self.build_variables),
            environment_variables: get_map_from_string(&self.environment_variables),
            domains: self.domains,
            environment: self.environment,
            user_id: self.user_id,
            organization_id: self.organization_id,
            family_id: None,
            labels: self.labels,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field changes for an existing application. Absent fields are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDeploymentRequest {
    pub application_id: Uuid,
    pub organization_id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub dockerfile_path: Option<String>,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub pre_run_command: Option<String>,
    #[serde(default)]
    pub post_run_command: Option<String>,
    #[serde(default)]
    pub build_variables: Option<String>,
    #[serde(default)]
    pub environment_variables: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub force_without_cache: bool,
}

impl UpdateDeploymentRequest {
    pub fn apply_to(&self, app: &mut Application) {
        if let Some(v) = &self.name {
            app.name = v.clone();
        }
        if let Some(v) = &self.branch {
            app.branch = v.clone();
        }
        if let Some(v) = self.port {
            app.port = v;
        }
        if let Some(v) = &self.dockerfile_path {
            app.dockerfile_path = v.clone();
        }
        if let Some(v) = &self.base_path {
            app.base_path = v.clone();
        }
        if let Some(v) = &self.pre_run_command {
            app.pre_run_command = v.clone();
        }
        if let Some(v) = &self.post_run_command {
            app.post_run_command = v.clone();
        }
        if let Some(v) = &self.build_variables {
            app.build_variables = get_map_from_string(v);
        }
        if let Some(v) = &self.environment_variables {
            app.environment_variables = get_map_from_string(v);
        }
        app.updated_at = Utc::now();
    }

    pub fn options(&self) -> UpdateOptions {
        UpdateOptions {
            force: self.force,
            force_without_cache: self.force_without_cache,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveDevRequest {
    pub application_id: Uuid,
    pub organization_id: Uuid,
    #[serde(flatten)]
    pub options: LiveDevOptions,
}

/// Page of deployment logs, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub logs: Vec<ApplicationLog>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}
