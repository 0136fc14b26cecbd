//! In-memory adapters for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::deploy::models::EnvMap;
use crate::docker::{
    APPLICATION_ID_LABEL, BuildImageOptions, ByteStream, ContainerSpec, ContainerState,
    ContainerSummary, DevServiceSpec, DockerAdapter, LogsOptions, PortMapping, ServiceHealth,
    ServiceSummary,
};
use crate::git::{CloneRequest, ClonedRepo, GitSource, workdir_path};
use crate::proxy::{ProxyReconciler, RouteOptions};
use crate::ssh::{CommandOutput, CommandRunner, CommandSession};

// ── docker ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeDockerState {
    pub containers: BTreeMap<String, ContainerSummary>,
    pub specs: HashMap<String, ContainerSpec>,
    pub builds: Vec<BuildImageOptions>,
    pub build_output: Vec<String>,
    pub removed_images: Vec<String>,
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
    pub services: Vec<ServiceSummary>,
    pub service_specs: Vec<DevServiceSpec>,
    pub service_updates: usize,
    pub health: Vec<ServiceHealth>,
    pub health_polls: usize,
    pub compose: Vec<(String, EnvMap)>,
    /// New containers exit right after start.
    pub exit_on_start: bool,
    pub next_id: usize,
}

#[derive(Default)]
pub struct FakeDocker {
    pub state: Mutex<FakeDockerState>,
}

impl FakeDocker {
    pub fn seed_container(&self, id: &str, application_id: &str, state: &str) {
        let mut labels = HashMap::new();
        labels.insert(APPLICATION_ID_LABEL.to_string(), application_id.to_string());
        self.state.lock().unwrap().containers.insert(
            id.to_string(),
            ContainerSummary {
                id: id.to_string(),
                names: vec![format!("/{id}")],
                image: "seed:latest".into(),
                state: state.to_string(),
                labels,
                ports: vec![],
            },
        );
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut FakeDockerState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Containers for `application_id` in `state`.
    pub fn count_in_state(&self, application_id: &str, state: &str) -> usize {
        self.with(|s| {
            s.containers
                .values()
                .filter(|c| c.label(APPLICATION_ID_LABEL) == Some(application_id) && c.state == state)
                .count()
        })
    }
}

fn lines_stream(lines: Vec<String>) -> ByteStream {
    futures::stream::iter(lines.into_iter().map(|l| Ok(Bytes::from(l)))).boxed()
}

#[async_trait]
impl DockerAdapter for FakeDocker {
    async fn build_image(&self, options: BuildImageOptions, _context: Bytes) -> Result<ByteStream> {
        let output = self.with(|s| {
            s.builds.push(options);
            if s.build_output.is_empty() {
                vec!["{\"stream\":\"Step 1/1 : FROM scratch\\n\"}\n".to_string()]
            } else {
                s.build_output.clone()
            }
        });
        Ok(lines_stream(output))
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        Ok(self.with(|s| {
            s.next_id += 1;
            let id = format!("ctr-{}", s.next_id);
            s.containers.insert(
                id.clone(),
                ContainerSummary {
                    id: id.clone(),
                    names: vec![format!("/{}", spec.name)],
                    image: spec.image.clone(),
                    state: "created".into(),
                    labels: spec.labels.clone(),
                    ports: vec![PortMapping {
                        private: spec.container_port,
                        public: spec.host_port,
                    }],
                },
            );
            s.specs.insert(id.clone(), spec);
            id
        }))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.with(|s| {
            let exit = s.exit_on_start;
            let c = s.containers.get_mut(id).ok_or_else(|| anyhow!("no such container {id}"))?;
            c.state = if exit { "exited" } else { "running" }.into();
            Ok(())
        })
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.with(|s| {
            s.stopped.push(id.to_string());
            let c = s.containers.get_mut(id).ok_or_else(|| anyhow!("no such container {id}"))?;
            c.state = "exited".into();
            Ok(())
        })
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
        self.with(|s| {
            s.containers.remove(id);
            s.specs.remove(id);
        });
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        self.with(|s| {
            let c = s.containers.get_mut(id).ok_or_else(|| anyhow!("no such container {id}"))?;
            c.state = "running".into();
            s.restarted.push(id.to_string());
            Ok(())
        })
    }

    async fn get_container_by_id(&self, id: &str) -> Result<ContainerState> {
        self.with(|s| {
            let c = s.containers.get(id).ok_or_else(|| anyhow!("no such container {id}"))?;
            Ok(ContainerState {
                id: c.id.clone(),
                name: c.names.first().cloned().unwrap_or_default().trim_start_matches('/').into(),
                image: c.image.clone(),
                status: c.state.clone(),
                running: c.state == "running",
            })
        })
    }

    async fn list_all_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self.with(|s| s.containers.values().cloned().collect()))
    }

    async fn remove_image(&self, reference: &str, _force: bool) -> Result<()> {
        self.with(|s| s.removed_images.push(reference.to_string()));
        Ok(())
    }

    async fn container_logs(&self, id: &str, _options: LogsOptions) -> Result<ByteStream> {
        Ok(lines_stream(vec![format!("log line from {id}\n")]))
    }

    async fn get_cluster_services(&self) -> Result<Vec<ServiceSummary>> {
        Ok(self.with(|s| s.services.clone()))
    }

    async fn create_service(&self, spec: DevServiceSpec) -> Result<String> {
        Ok(self.with(|s| {
            let id = format!("svc-{}", s.services.len() + 1);
            s.services.push(ServiceSummary {
                id: id.clone(),
                name: spec.name.clone(),
                version: 1,
                labels: spec.labels.clone(),
            });
            s.service_specs.push(spec);
            id
        }))
    }

    async fn update_service(&self, current: &ServiceSummary, spec: DevServiceSpec) -> Result<()> {
        self.with(|s| {
            let svc = s
                .services
                .iter_mut()
                .find(|svc| svc.id == current.id)
                .ok_or_else(|| anyhow!("no such service {}", current.name))?;
            svc.version += 1;
            svc.labels = spec.labels.clone();
            s.service_updates += 1;
            s.service_specs.push(spec);
            Ok(())
        })
    }

    async fn get_service_health(&self, _name: &str) -> Result<ServiceHealth> {
        Ok(self.with(|s| {
            s.health_polls += 1;
            if s.health.len() > 1 {
                s.health.remove(0)
            } else {
                s.health.first().cloned().unwrap_or(ServiceHealth {
                    running: 1,
                    desired: 1,
                    task_states: vec!["running".into()],
                })
            }
        }))
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.with(|s| s.services.retain(|svc| svc.name != name));
        Ok(())
    }

    async fn compose_build(&self, compose_file: &Path, env: &EnvMap, _no_cache: bool) -> Result<String> {
        self.with(|s| s.compose.push((format!("build {}", compose_file.display()), env.clone())));
        Ok("built".into())
    }

    async fn compose_up(&self, compose_file: &Path, env: &EnvMap) -> Result<String> {
        self.with(|s| s.compose.push((format!("up {}", compose_file.display()), env.clone())));
        Ok("up".into())
    }

    async fn compose_down(&self, compose_file: &Path) -> Result<String> {
        self.with(|s| s.compose.push((format!("down {}", compose_file.display()), EnvMap::new())));
        Ok("down".into())
    }
}

// ── proxy ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeProxy {
    pub routes: Mutex<BTreeMap<String, (String, u16)>>,
    pub reloads: Mutex<usize>,
    pub fail: Mutex<bool>,
}

impl FakeProxy {
    pub fn route(&self, domain: &str) -> Option<(String, u16)> {
        self.routes.lock().unwrap().get(domain).cloned()
    }

    pub fn reload_count(&self) -> usize {
        *self.reloads.lock().unwrap()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl ProxyReconciler for FakeProxy {
    async fn add_domain_with_auto_tls(
        &self,
        domain: &str,
        host: &str,
        port: u16,
        _options: RouteOptions,
    ) -> Result<()> {
        if *self.fail.lock().unwrap() {
            bail!("proxy admin unavailable");
        }
        self.routes
            .lock()
            .unwrap()
            .insert(domain.to_string(), (host.to_string(), port));
        Ok(())
    }

    async fn delete_domain(&self, domain: &str) -> Result<()> {
        self.routes.lock().unwrap().remove(domain);
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        if *self.fail.lock().unwrap() {
            bail!("proxy admin unavailable");
        }
        *self.reloads.lock().unwrap() += 1;
        Ok(())
    }
}

// ── ssh ──────────────────────────────────────────────────────────────

/// Answers `ss`/`netstat` with a fixed listener table and everything else
/// with exit 0, unless a command contains a configured failure marker.
pub struct FakeRunner {
    pub host: String,
    pub listeners: Mutex<String>,
    pub commands: Mutex<Vec<String>>,
    pub fail_marker: Mutex<Option<String>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            host: "10.0.0.2".into(),
            listeners: Mutex::new(String::new()),
            commands: Mutex::default(),
            fail_marker: Mutex::default(),
        }
    }
}

impl FakeRunner {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn fail_on(&self, marker: &str) {
        *self.fail_marker.lock().unwrap() = Some(marker.to_string());
    }

    fn answer(&self, command: &str) -> CommandOutput {
        self.commands.lock().unwrap().push(command.to_string());
        if let Some(marker) = self.fail_marker.lock().unwrap().as_deref() {
            if command.contains(marker) {
                return CommandOutput {
                    output: format!("{marker}: failed"),
                    exit_code: 1,
                };
            }
        }
        if command.contains("ss -tan") || command.contains("netstat") {
            return CommandOutput {
                output: self.listeners.lock().unwrap().clone(),
                exit_code: 0,
            };
        }
        CommandOutput {
            output: String::new(),
            exit_code: 0,
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        Ok(self.answer(command))
    }

    async fn connect(&self) -> Result<Box<dyn CommandSession>> {
        bail!("sessions are not supported by the fake runner")
    }

    fn host(&self) -> &str {
        &self.host
    }
}

// ── git ──────────────────────────────────────────────────────────────

/// Materializes `files` at the deterministic workdir instead of cloning.
pub struct FakeGit {
    pub mount_root: PathBuf,
    pub files: Mutex<Vec<(String, String)>>,
    pub clones: Mutex<Vec<CloneRequest>>,
    pub head: String,
}

impl FakeGit {
    pub fn new(mount_root: &Path) -> Self {
        Self {
            mount_root: mount_root.to_path_buf(),
            files: Mutex::new(vec![(
                "Dockerfile".to_string(),
                "FROM scratch\n".to_string(),
            )]),
            clones: Mutex::default(),
            head: "a".repeat(40),
        }
    }

    pub fn clone_count(&self) -> usize {
        self.clones.lock().unwrap().len()
    }

    pub fn last_clone(&self) -> Option<CloneRequest> {
        self.clones.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl GitSource for FakeGit {
    async fn clone_repository(&self, request: CloneRequest) -> Result<ClonedRepo> {
        let path = workdir_path(
            &self.mount_root,
            request.user_id,
            request.environment,
            request.deployment_id,
        );
        std::fs::create_dir_all(&path)?;
        for (name, content) in self.files.lock().unwrap().iter() {
            let file = path.join(name);
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(file, content)?;
        }
        let commit_hash = if request.commit_hash.is_empty() {
            self.head.clone()
        } else {
            request.commit_hash.clone()
        };
        self.clones.lock().unwrap().push(request);
        Ok(ClonedRepo { path, commit_hash })
    }

    async fn remove_repository(&self, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}
