use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{
    ContainerCreateBody, EndpointPortConfig, EndpointPortConfigProtocolEnum,
    EndpointPortConfigPublishModeEnum, EndpointSpec, HostConfig, Limit, Mount, MountTypeEnum,
    PortBinding, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated, TaskSpec,
    TaskSpecContainerSpec, TaskSpecContainerSpecDnsConfig, TaskSpecResources,
    TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, InspectServiceOptions,
    ListContainersOptions, ListServicesOptions, ListTasksOptions, LogsOptions as EngineLogsOptions,
    RemoveContainerOptions, RemoveImageOptions, RestartContainerOptions, StartContainerOptions,
    StopContainerOptions, UpdateServiceOptions,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::compose::{ComposeAction, run_compose};
use super::{
    BuildImageOptions, ByteStream, ContainerSpec, ContainerState, ContainerSummary,
    DevServiceSpec, DockerAdapter, LogsOptions, PortMapping, ServiceHealth, ServiceSummary,
};
use crate::deploy::models::EnvMap;

const CONNECT_TIMEOUT_SECS: u64 = 120;
const STREAM_BUFFER: usize = 64;

/// Engine enums serialize to their API string.
fn api_str<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn channel_stream(rx: mpsc::Receiver<Result<Bytes>>) -> ByteStream {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}

pub struct BollardDocker {
    docker: Docker,
    host: Option<String>,
}

impl BollardDocker {
    /// Connect to `host` (`unix://…` or `tcp://…`) or the local default socket.
    pub fn connect(host: Option<&str>) -> Result<Self> {
        let docker = match host {
            Some(h) if h.starts_with("unix://") => {
                Docker::connect_with_socket(h, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(h) => Docker::connect_with_http(h, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .context("Failed to connect to the Docker engine")?;
        Ok(Self {
            docker,
            host: host.map(str::to_string),
        })
    }

    fn service_spec(spec: DevServiceSpec) -> ServiceSpec {
        ServiceSpec {
            name: Some(spec.name),
            labels: Some(spec.labels.clone()),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
                ..Default::default()
            }),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(spec.image),
                    command: Some(spec.command),
                    dir: Some(spec.workdir.clone()),
                    env: Some(spec.env),
                    labels: Some(spec.labels),
                    mounts: Some(vec![Mount {
                        target: Some(spec.workdir),
                        source: Some(spec.mount_source),
                        typ: Some(MountTypeEnum::BIND),
                        ..Default::default()
                    }]),
                    dns_config: Some(TaskSpecContainerSpecDnsConfig {
                        nameservers: Some(spec.dns),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                resources: Some(TaskSpecResources {
                    limits: Some(Limit {
                        nano_cpus: Some(spec.nano_cpus),
                        memory_bytes: Some(spec.memory_bytes),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                restart_policy: Some(TaskSpecRestartPolicy {
                    condition: Some(TaskSpecRestartPolicyConditionEnum::ANY),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            endpoint_spec: Some(EndpointSpec {
                ports: Some(vec![EndpointPortConfig {
                    protocol: Some(EndpointPortConfigProtocolEnum::TCP),
                    target_port: Some(spec.target_port.into()),
                    published_port: Some(spec.published_port.into()),
                    publish_mode: Some(EndpointPortConfigPublishModeEnum::HOST),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DockerAdapter for BollardDocker {
    async fn build_image(&self, options: BuildImageOptions, context: Bytes) -> Result<ByteStream> {
        let engine_options = bollard::query_parameters::BuildImageOptions {
            dockerfile: options.dockerfile,
            t: Some(options.tag),
            nocache: options.no_cache,
            rm: true,
            forcerm: options.force_remove,
            buildargs: Some(options.build_args),
            labels: Some(options.labels),
            ..Default::default()
        };
        let docker = self.docker.clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut stream =
                docker.build_image(engine_options, None, Some(bollard::body_full(context)));
            while let Some(item) = stream.next().await {
                // Re-framed as newline-delimited JSON for the output parser.
                let frame = item
                    .map_err(anyhow::Error::from)
                    .and_then(|info| serde_json::to_vec(&info).map_err(anyhow::Error::from))
                    .map(|mut line| {
                        line.push(b'\n');
                        Bytes::from(line)
                    });
                let failed = frame.is_err();
                if tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(channel_stream(rx))
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            format!("{}/tcp", spec.container_port),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );
        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network_mode),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds)
            },
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(spec.image),
            hostname: Some(spec.hostname),
            env: Some(spec.env),
            labels: Some(spec.labels),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        });
        let created = self
            .docker
            .create_container(options, body)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;
        for warning in &created.warnings {
            warn!(container = %spec.name, "docker: {}", warning);
        }
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", id))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = Some(StopContainerOptions {
            t: Some(timeout.as_secs().try_into().unwrap_or(10)),
            ..Default::default()
        });
        self.docker
            .stop_container(id, options)
            .await
            .with_context(|| format!("Failed to stop container {}", id))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force,
            ..Default::default()
        });
        self.docker
            .remove_container(id, options)
            .await
            .with_context(|| format!("Failed to remove container {}", id))
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        self.docker
            .restart_container(id, None::<RestartContainerOptions>)
            .await
            .with_context(|| format!("Failed to restart container {}", id))
    }

    async fn get_container_by_id(&self, id: &str) -> Result<ContainerState> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {}", id))?;
        let state = inspect.state.unwrap_or_default();
        Ok(ContainerState {
            id: inspect.id.unwrap_or_else(|| id.to_string()),
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: inspect.config.and_then(|c| c.image).unwrap_or_default(),
            status: state.status.as_ref().map(api_str).unwrap_or_default(),
            running: state.running.unwrap_or(false),
        })
    }

    async fn list_all_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions {
            all: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.as_ref().map(api_str).unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                ports: c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| {
                        Some(PortMapping {
                            private: p.private_port.try_into().ok()?,
                            public: p.public_port.and_then(|v| v.try_into().ok())?,
                        })
                    })
                    .collect(),
            })
            .collect())
    }

    async fn remove_image(&self, reference: &str, force: bool) -> Result<()> {
        let options = Some(RemoveImageOptions {
            force,
            ..Default::default()
        });
        self.docker
            .remove_image(reference, options, None)
            .await
            .with_context(|| format!("Failed to remove image {}", reference))?;
        Ok(())
    }

    async fn container_logs(&self, id: &str, options: LogsOptions) -> Result<ByteStream> {
        let engine_options = EngineLogsOptions {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: options.timestamps,
            tail: options
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        let docker = self.docker.clone();
        let id = id.to_string();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut stream = docker.logs(&id, Some(engine_options));
            while let Some(item) = stream.next().await {
                let frame = item
                    .map(|output| output.into_bytes())
                    .with_context(|| format!("Failed to read logs of {}", id));
                let failed = frame.is_err();
                if tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(channel_stream(rx))
    }

    async fn get_cluster_services(&self) -> Result<Vec<ServiceSummary>> {
        let services = self
            .docker
            .list_services(None::<ListServicesOptions>)
            .await
            .context("Failed to list swarm services")?;
        Ok(services
            .into_iter()
            .map(|s| {
                let spec = s.spec.unwrap_or_default();
                ServiceSummary {
                    id: s.id.unwrap_or_default(),
                    name: spec.name.unwrap_or_default(),
                    version: s.version.and_then(|v| v.index).unwrap_or(0),
                    labels: spec.labels.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn create_service(&self, spec: DevServiceSpec) -> Result<String> {
        let name = spec.name.clone();
        let created = self
            .docker
            .create_service(Self::service_spec(spec), None)
            .await
            .with_context(|| format!("Failed to create service {}", name))?;
        Ok(created.id.unwrap_or(name))
    }

    async fn update_service(&self, current: &ServiceSummary, spec: DevServiceSpec) -> Result<()> {
        let mut spec = Self::service_spec(spec);
        // Renames are not supported by swarm; keep the existing name.
        spec.name = Some(current.name.clone());
        let options = UpdateServiceOptions {
            version: current.version.try_into().unwrap_or_default(),
            ..Default::default()
        };
        self.docker
            .update_service(&current.name, spec, options, None)
            .await
            .with_context(|| format!("Failed to update service {}", current.name))?;
        Ok(())
    }

    async fn get_service_health(&self, name: &str) -> Result<ServiceHealth> {
        let service = self
            .docker
            .inspect_service(name, None::<InspectServiceOptions>)
            .await
            .with_context(|| format!("Failed to inspect service {}", name))?;
        let desired = service
            .spec
            .and_then(|s| s.mode)
            .and_then(|m| m.replicated)
            .and_then(|r| r.replicas)
            .unwrap_or(0);

        let mut filters = HashMap::new();
        filters.insert("service".to_string(), vec![name.to_string()]);
        let tasks = self
            .docker
            .list_tasks(Some(ListTasksOptions {
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .with_context(|| format!("Failed to list tasks of {}", name))?;

        let mut running = 0u64;
        let mut task_states = Vec::new();
        for task in tasks {
            let desired_state = task.desired_state.as_ref().map(api_str).unwrap_or_default();
            let status = task.status.unwrap_or_default();
            let state = status.state.as_ref().map(api_str).unwrap_or_default();
            if state == "running" && desired_state == "running" {
                running += 1;
            }
            match status.err {
                Some(err) if !err.is_empty() => task_states.push(format!("{state}: {err}")),
                _ => task_states.push(state),
            }
        }
        debug!(service = %name, running, desired, "service health");
        Ok(ServiceHealth {
            running,
            desired: desired.try_into().unwrap_or(0),
            task_states,
        })
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.docker
            .delete_service(name)
            .await
            .with_context(|| format!("Failed to delete service {}", name))
    }

    async fn compose_build(&self, compose_file: &Path, env: &EnvMap, no_cache: bool) -> Result<String> {
        run_compose(
            self.host.as_deref(),
            compose_file,
            env,
            ComposeAction::Build { no_cache },
        )
        .await
    }

    async fn compose_up(&self, compose_file: &Path, env: &EnvMap) -> Result<String> {
        run_compose(self.host.as_deref(), compose_file, env, ComposeAction::Up).await
    }

    async fn compose_down(&self, compose_file: &Path) -> Result<String> {
        run_compose(
            self.host.as_deref(),
            compose_file,
            &EnvMap::new(),
            ComposeAction::Down,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev_spec() -> DevServiceSpec {
        let mut labels = HashMap::new();
        labels.insert("com.application.id".to_string(), "app-1".to_string());
        DevServiceSpec {
            name: "nixopus-dev-app-1".into(),
            image: "node:20-alpine".into(),
            command: vec!["sh".into(), "-c".into(), "npm install && npm run dev".into()],
            workdir: "/app".into(),
            env: vec!["PORT=3000".into()],
            mount_source: "/srv/live/app-1".into(),
            labels,
            published_port: 50000,
            target_port: 3000,
            dns: vec!["8.8.8.8".into()],
            memory_bytes: 2 * 1024 * 1024 * 1024,
            nano_cpus: 2_000_000_000,
        }
    }

    #[test]
    fn test_service_spec_shape() {
        let spec = BollardDocker::service_spec(dev_spec());
        assert_eq!(spec.name.as_deref(), Some("nixopus-dev-app-1"));
        let replicas = spec
            .mode
            .as_ref()
            .and_then(|m| m.replicated.as_ref())
            .and_then(|r| r.replicas);
        assert_eq!(replicas, Some(1));

        let task = spec.task_template.as_ref().unwrap();
        let container = task.container_spec.as_ref().unwrap();
        assert_eq!(container.dir.as_deref(), Some("/app"));
        let mount = &container.mounts.as_ref().unwrap()[0];
        assert_eq!(mount.source.as_deref(), Some("/srv/live/app-1"));
        assert_eq!(mount.target.as_deref(), Some("/app"));
        assert_eq!(mount.typ, Some(MountTypeEnum::BIND));

        let port = &spec.endpoint_spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
        assert_eq!(port.publish_mode, Some(EndpointPortConfigPublishModeEnum::HOST));
        assert_eq!(api_str(port.protocol.as_ref().unwrap()), "tcp");
    }

    #[test]
    fn test_api_str_uses_wire_name() {
        assert_eq!(api_str(&MountTypeEnum::BIND), "bind");
    }
}
