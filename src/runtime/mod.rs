use std::path::Path;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::types::ContainerSpec;

pub mod docker;
#[cfg(test)]
pub mod fake;

pub use docker::DockerEngine;

/// What a single readiness probe saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Running but not accepting client connections yet.
    Starting,
    /// Accepting client connections.
    Ready,
    /// The container stopped. It will not become ready.
    Exited { code: i64 },
}

/// The operations the orchestrator needs from a container engine.
///
/// Every call is a single engine round trip; retry and rollback policy
/// live in the lifecycle manager.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn network_exists(&self, name: &str) -> Result<bool, EngineError>;

    async fn create_network(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    /// Loads a saved image archive and returns the tag it was loaded as.
    async fn load_image(&self, archive: &Path) -> Result<String, EngineError>;

    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Creates (but does not start) a container and returns its id.
    /// Fails with [`EngineError::ImageNotFound`] if the image is missing.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn probe(&self, id: &str, spec: &ContainerSpec) -> Result<Probe, EngineError>;

    /// The last `tail` lines of the container's output.
    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>, EngineError>;

    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    /// Force-removes the container.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Ids of all containers, running or not, labelled as members of
    /// `service`.
    async fn find_service_containers(&self, service: &str) -> Result<Vec<String>, EngineError>;
}
