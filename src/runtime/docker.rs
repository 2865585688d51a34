use super::{ContainerEngine, Probe};
use crate::error::EngineError;
use crate::types::{Address, ContainerSpec};
use async_trait::async_trait;
use bytes::Bytes;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ImportImageOptions};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Label attached to every container we create.
const SERVICE_LABEL: &str = "neodock.service";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Bolt magic preamble followed by the protocol versions we offer.
const BOLT_HANDSHAKE: [u8; 20] = [
    0x60, 0x60, 0xB0, 0x17, 0, 0, 0, 4, 0, 0, 0, 3, 0, 0, 0, 2, 0, 0, 0, 1,
];

pub struct DockerEngine {
    docker: Docker,
    stop_timeout: i64,
}

impl DockerEngine {
    pub fn connect(stop_timeout: i64) -> Result<Self, EngineError> {
        // Unix socket on Linux, named pipe on Windows, DOCKER_HOST if set.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            stop_timeout,
        })
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse, EngineError> {
        self.docker
            .inspect_container(id, None)
            .await
            .map_err(|e| not_found_or(e, id))
    }
}

fn not_found_or(err: bollard::errors::Error, resource: &str) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(resource.to_string()),
        other => EngineError::Docker(other),
    }
}

/// Sends `request` and waits for the first four bytes of a reply. A port
/// that accepts and then closes or resets the connection is not serving.
async fn answers(address: &Address, request: &[u8]) -> bool {
    let exchange = async {
        let mut stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
        stream.write_all(request).await?;
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        Ok::<_, std::io::Error>(())
    };
    matches!(timeout(CONNECT_TIMEOUT, exchange).await, Ok(Ok(())))
}

async fn serves_bolt(address: &Address) -> bool {
    answers(address, &BOLT_HANDSHAKE).await
}

async fn serves_http(address: &Address) -> bool {
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", address.host);
    answers(address, request.as_bytes()).await
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match not_found_or(e, name) {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn create_network(&self, name: &str) -> Result<(), EngineError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            ..Default::default()
        };
        let response = self.docker.create_network(options).await?;
        debug!("Created network {} ({:?})", name, response.id);
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| not_found_or(e, name))
    }

    async fn load_image(&self, archive: &Path) -> Result<String, EngineError> {
        info!("Loading Docker image from {}", archive.display());
        let tarball = tokio::fs::read(archive).await?;
        let mut stream = self.docker.import_image(
            ImportImageOptions { quiet: true },
            Bytes::from(tarball),
            None,
        );
        let mut loaded = None;
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(error) = progress.error {
                return Err(EngineError::Failed(format!(
                    "loading {}: {}",
                    archive.display(),
                    error
                )));
            }
            if let Some(line) = progress.stream {
                debug!("[load {}] {}", archive.display(), line.trim());
                if let Some(tag) = line.trim().strip_prefix("Loaded image: ") {
                    loaded = Some(tag.to_string());
                }
            }
        }
        loaded.ok_or_else(|| {
            EngineError::Failed(format!("{} did not contain a tagged image", archive.display()))
        })
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        info!("Downloading Docker image {:?}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!("[pull {}] {}", image, status);
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (container_port, host_port) in spec.port_bindings() {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            env: Some(spec.env_list()),
            exposed_ports: Some(exposed_ports),
            labels: Some(HashMap::from([(
                SERVICE_LABEL.to_string(),
                spec.network.clone(),
            )])),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                network_mode: Some(spec.network.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        match self.docker.create_container(Some(options), config).await {
            Ok(response) => {
                for warning in response.warnings {
                    warn!("Creating {}: {}", spec.name, warning);
                }
                Ok(response.id)
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(EngineError::ImageNotFound(spec.image.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| not_found_or(e, id))
    }

    async fn probe(&self, id: &str, spec: &ContainerSpec) -> Result<Probe, EngineError> {
        let detail = self.inspect(id).await?;
        let state = detail.state.unwrap_or_default();
        match state.status {
            Some(ContainerStateStatusEnum::RUNNING) => {}
            Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
                return Ok(Probe::Exited {
                    code: state.exit_code.unwrap_or(-1),
                });
            }
            _ => return Ok(Probe::Starting),
        }

        let bolt_address = spec.bolt_address();
        let http_address = spec.http_address();
        let (bolt, http) = tokio::join!(serves_bolt(&bolt_address), serves_http(&http_address));
        debug!("Probe {}: bolt={} http={}", spec.name, bolt, http);
        Ok(if bolt && http {
            Probe::Ready
        } else {
            Probe::Starting
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>, EngineError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| not_found_or(e, id))?;
            lines.extend(chunk.to_string().lines().map(str::to_string));
        }
        Ok(lines)
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: self.stop_timeout,
                }),
            )
            .await
            .map_err(|e| not_found_or(e, id))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| not_found_or(e, id))
    }

    async fn find_service_containers(&self, service: &str) -> Result<Vec<String>, EngineError> {
        let opts = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{}={}", SERVICE_LABEL, service)],
            )]),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
