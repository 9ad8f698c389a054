//! Docker Engine implementation of the runtime adapter

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{
    ContainerCreateBody, ContainerStatsResponse, HostConfig, Mount, MountTypeEnum, PortBinding,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, RemoveContainerOptionsBuilder, RenameContainerOptionsBuilder,
    StartContainerOptions, StatsOptionsBuilder,
};
use bollard::Docker;
use futures_util::{future, StreamExt, TryStreamExt};

use super::{
    ContainerDetails, ContainerRuntime, ContainerStats, CreateSpec, RuntimeContainer, StatsStream,
};
use crate::Result;

pub struct DockerRuntime {
    docker: Docker,
    retry_delay: Duration,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket)
    pub fn connect(retry_delay: Duration) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker, retry_delay))
    }

    pub fn with_client(docker: Docker, retry_delay: Duration) -> Self {
        Self { docker, retry_delay }
    }

    async fn pull_once(&self, image: &str) -> Result<()> {
        let (from_image, tag) = split_image(image);
        let options = CreateImageOptionsBuilder::new()
            .from_image(from_image)
            .tag(tag)
            .build();
        // Drain the progress stream; the pull is done when it closes
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

/// Split `registry/name:tag` into name and tag, defaulting to `latest`
fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

fn stats_from_response(response: &ContainerStatsResponse) -> ContainerStats {
    let cpu = response.cpu_stats.as_ref();
    let container_cpu = cpu
        .and_then(|c| c.cpu_usage.as_ref())
        .and_then(|u| u.total_usage)
        .unwrap_or(0);
    let system_cpu = cpu.and_then(|c| c.system_cpu_usage).unwrap_or(0);
    let memory = response.memory_stats.as_ref();
    ContainerStats::from_usage(
        container_cpu,
        system_cpu,
        memory.and_then(|m| m.usage).unwrap_or(0),
        memory.and_then(|m| m.max_usage).unwrap_or(0),
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list(&self) -> Result<Vec<RuntimeContainer>> {
        let options = ListContainersOptionsBuilder::new().all(false).build();
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let public_port = c
                    .ports
                    .and_then(|ports| ports.iter().find_map(|p| p.public_port));
                Some(RuntimeContainer {
                    id,
                    name,
                    image: c.image.unwrap_or_default(),
                    public_port,
                })
            })
            .collect())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        let port_key = format!("{}/tcp", spec.container_port);
        let port_bindings = HashMap::from([(
            port_key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                mounts: Some(vec![Mount {
                    typ: Some(MountTypeEnum::BIND),
                    source: Some(spec.world_path.to_string_lossy().into_owned()),
                    target: Some(spec.world_mount_target.clone()),
                    ..Default::default()
                }]),
                memory: Some(spec.memory_bytes),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        let response = self.docker.create_container(Some(options), body).await?;
        tracing::debug!(container = %response.id, name = %spec.name, "Container created");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn pause(&self, container_id: &str) -> Result<()> {
        self.docker.pause_container(container_id).await?;
        Ok(())
    }

    async fn unpause(&self, container_id: &str) -> Result<()> {
        self.docker.unpause_container(container_id).await?;
        Ok(())
    }

    async fn rename(&self, container_id: &str, name: &str) -> Result<()> {
        let options = RenameContainerOptionsBuilder::new().name(name).build();
        self.docker.rename_container(container_id, options).await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        self.docker.remove_container(container_id, Some(options)).await?;
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerDetails> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;

        let paused = info.state.as_ref().and_then(|s| s.paused).unwrap_or(false);
        let env = info.config.and_then(|c| c.env).unwrap_or_default();
        let published_port = info
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|ports| {
                ports
                    .values()
                    .flatten()
                    .flatten()
                    .find_map(|b| b.host_port.as_deref()?.parse().ok())
            });

        Ok(ContainerDetails {
            env,
            published_port,
            paused,
        })
    }

    async fn stream_stats(&self, container_id: &str) -> Result<StatsStream> {
        let options = StatsOptionsBuilder::new().stream(true).build();
        let stream = self
            .docker
            .stats(container_id, Some(options))
            .take_while(|item| future::ready(item.is_ok()))
            .filter_map(|item| future::ready(item.ok().map(|s| stats_from_response(&s))));
        Ok(stream.boxed())
    }

    async fn pull_image(&self, image: &str) {
        loop {
            match self.pull_once(image).await {
                Ok(()) => {
                    tracing::info!(image, "Image is ready");
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        image,
                        error = %e,
                        "Couldn't pull image. Retrying in {:?}...",
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}
