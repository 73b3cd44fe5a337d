//! Docker implementation of the container backend, via bollard.

use crate::backend::{ContainerBackend, ContainerNetwork, ContainerSpec, ExecStream};
use crate::error::BackendError;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
        RestartContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{ContainerInspectResponse, HostConfig, PortBinding},
    Docker,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect to the local daemon and verify it answers.
    pub async fn connect() -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }
}

/// Splits an image reference into repository and tag, defaulting the tag to
/// `latest`. Digest references are passed through whole with no tag.
fn split_image_ref(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    match image.rsplit_once(':') {
        // A '/' after the colon means it was a registry port.
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

fn map_not_found(id: &str, err: bollard::errors::Error) -> BackendError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => BackendError::ContainerNotFound(id.to_string()),
        other => BackendError::Docker(other),
    }
}

/// Bollard container config for a sandbox: TTY, attached stdio, auto-remove,
/// and every exposed port published on a dynamically allocated host port.
fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for key in &spec.exposed_ports {
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some("0".to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        auto_remove: Some(spec.auto_remove),
        network_mode: Some("bridge".to_string()),
        port_bindings: Some(port_bindings),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        tty: Some(spec.tty),
        open_stdin: Some(spec.open_stdin),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Pull the container address and published host ports out of an inspect result.
fn network_from_inspect(inspect: &ContainerInspectResponse) -> ContainerNetwork {
    let Some(settings) = inspect.network_settings.as_ref() else {
        return ContainerNetwork::default();
    };

    let ip_address = settings
        .networks
        .as_ref()
        .and_then(|networks| networks.values().find_map(|n| n.ip_address.clone()))
        .filter(|ip| !ip.is_empty())
        .or_else(|| settings.ip_address.clone().filter(|ip| !ip.is_empty()));

    let mut host_ports = HashMap::new();
    if let Some(ports) = &settings.ports {
        for (key, bindings) in ports {
            let host_port = bindings
                .as_ref()
                .and_then(|b| b.first())
                .and_then(|b| b.host_port.as_ref())
                .and_then(|p| p.parse::<u16>().ok());
            if let Some(port) = host_port {
                host_ports.insert(key.clone(), port);
            }
        }
    }

    ContainerNetwork {
        ip_address,
        host_ports,
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn inspect_image(&self, image: &str) -> Result<(), BackendError> {
        self.docker.inspect_image(image).await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), BackendError> {
        let (repo, tag) = split_image_ref(image);
        debug!(image, repo, tag, "Pulling image");
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(BackendError::ImageUnavailable {
                        image: image.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, BackendError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), to_bollard_config(spec))
            .await?;
        for warning in &response.warnings {
            warn!(container_id = %response.id, "Create warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), BackendError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), BackendError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<(), BackendError> {
        let options = RestartContainerOptions {
            t: timeout_secs as isize,
        };
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerNetwork, BackendError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_not_found(id, e))?;
        Ok(network_from_inspect(&inspect))
    }

    async fn exec_detached(&self, id: &str, cmd: Vec<String>) -> Result<(), BackendError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_not_found(id, e))?;

        let options = StartExecOptions {
            detach: true,
            ..Default::default()
        };
        self.docker.start_exec(&exec.id, Some(options)).await?;
        debug!(container_id = id, exec_id = %exec.id, "Dispatched detached exec");
        Ok(())
    }

    async fn exec_interactive(
        &self,
        id: &str,
        cmd: Vec<String>,
    ) -> Result<ExecStream, BackendError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_not_found(id, e))?;

        let options = StartExecOptions {
            detach: false,
            tty: true,
            ..Default::default()
        };
        match self.docker.start_exec(&exec.id, Some(options)).await? {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map(|chunk| {
                        chunk
                            .map(|log| log.into_bytes().to_vec())
                            .map_err(BackendError::from)
                    })
                    .boxed();
                Ok(ExecStream {
                    exec_id: exec.id,
                    output,
                    input,
                })
            }
            StartExecResults::Detached => Err(BackendError::ExecDetached),
        }
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<(), BackendError> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await?;
        Ok(())
    }
}
