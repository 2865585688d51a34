//! Error taxonomy for the orchestrator.
//!
//! Configuration problems are rejected before any container is touched.
//! Everything that goes wrong after the first side effect carries the
//! outcome of the rollback that followed it, so a teardown failure is
//! reported next to the original cause instead of replacing it.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Bad command-line or topology input.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("instance count must be at least 1 (got {0})")]
    InstanceCount(usize),

    #[error("{replicas} read replica(s) requested but a {instances}-member service needs at least one core member")]
    ReadReplicas { replicas: usize, instances: usize },

    #[error("{key:?} is managed by neodock and cannot be overridden")]
    ReservedKey { key: String },

    #[error("malformed override {0:?}: expected NAME=VALUE")]
    MalformedOverride(String),

    #[error("invalid auth {0:?}: only the 'neo4j' user can bootstrap a service")]
    InvalidAuth(String),

    #[error("invalid address {0:?}: expected HOST:PORT")]
    InvalidAddress(String),

    #[error("host port for member {member} overflows the port range")]
    PortOverflow { member: usize },

    #[error("invalid image reference {0:?}")]
    InvalidImage(String),
}

/// Failure reported by the container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The resource is already gone. Teardown treats this as success.
    #[error("no such resource: {0}")]
    NotFound(String),

    /// The image is not present locally and has to be pulled.
    #[error("no such image: {0}")]
    ImageNotFound(String),

    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::NotFound(_) => true,
            EngineError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 404,
            _ => false,
        }
    }
}

/// One resource that could not be removed during teardown.
#[derive(Debug, Clone)]
pub struct ResourceFailure {
    pub resource: String,
    pub message: String,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.message)
    }
}

/// Aggregate of every removal that failed during one teardown pass.
#[derive(Debug, Clone, Error)]
#[error("teardown left {} resource(s) behind", .failures.len())]
pub struct TeardownError {
    pub failures: Vec<ResourceFailure>,
}

impl TeardownError {
    pub fn explanation(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("  - {}", f))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Top-level error surfaced by the service handle and the CLI.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A member could not be created or started. Everything already
    /// provisioned has been rolled back.
    #[error("service {service:?} failed to start: {cause}")]
    Start {
        service: String,
        cause: String,
        members: Vec<String>,
        rollback: Option<TeardownError>,
    },

    /// Not every member reported ready within the timeout.
    #[error("service {service:?} not ready after {timeout:?}")]
    Readiness {
        service: String,
        timeout: Duration,
        pending: Vec<String>,
        rollback: Option<TeardownError>,
    },

    #[error("interrupted")]
    Interrupted { rollback: Option<TeardownError> },

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("console i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to run {command:?}: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl ServiceError {
    /// Structured detail printed under the flattened message.
    pub fn explanation(&self) -> Option<String> {
        let mut lines = Vec::new();
        let rollback = match self {
            ServiceError::Start {
                members, rollback, ..
            } => {
                if !members.is_empty() {
                    lines.push(format!("affected members: {}", members.join(", ")));
                }
                rollback.as_ref()
            }
            ServiceError::Readiness {
                pending, rollback, ..
            } => {
                if !pending.is_empty() {
                    lines.push(format!("members not ready: {}", pending.join(", ")));
                }
                rollback.as_ref()
            }
            ServiceError::Interrupted { rollback } => rollback.as_ref(),
            ServiceError::Teardown(e) => {
                lines.push(e.explanation());
                None
            }
            _ => None,
        };
        if let Some(teardown) = rollback {
            lines.push(format!("rollback: {}", teardown));
            lines.push(teardown.explanation());
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, ServiceError::Interrupted { .. })
    }

    /// Attaches the outcome of a rollback without replacing the cause.
    pub(crate) fn with_rollback(self, outcome: Result<(), TeardownError>) -> Self {
        let failed = outcome.err();
        match self {
            ServiceError::Start {
                service,
                cause,
                members,
                ..
            } => ServiceError::Start {
                service,
                cause,
                members,
                rollback: failed,
            },
            ServiceError::Readiness {
                service,
                timeout,
                pending,
                ..
            } => ServiceError::Readiness {
                service,
                timeout,
                pending,
                rollback: failed,
            },
            ServiceError::Interrupted { .. } => ServiceError::Interrupted { rollback: failed },
            other => {
                if let Some(teardown) = failed {
                    log::error!("Rollback after {} also failed: {}", other, teardown);
                }
                other
            }
        }
    }
}
