//! The running service as a scoped resource.
//!
//! A `ServiceHandle` only exists once every member is ready. It must be
//! released with [`ServiceHandle::close`], which tears everything down
//! exactly once and folds any teardown failure into the outcome of
//! whatever ran while the service was up.

use std::sync::Arc;

use log::{debug, info, warn};
use rand::Rng;
use tokio::process::Command;

use crate::config::RunConfig;
use crate::container_spec::build_specs;
use crate::error::{EngineError, ServiceError};
use crate::images::resolve_image;
use crate::lifecycle::{ContainerSet, LifecycleManager};
use crate::runtime::ContainerEngine;
use crate::signal::Interrupt;
use crate::topology::{build_topology, ServiceTopology, TopologyRequest};
use crate::types::{Address, Auth, ContainerRecord};

const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz";
const NAME_LENGTH: usize = 7;

/// A throwaway service name, also used for the network.
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    (0..NAME_LENGTH)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}

pub struct ServiceHandle {
    manager: LifecycleManager,
    topology: ServiceTopology,
    set: ContainerSet,
    auth: Auth,
    closed: bool,
}

impl ServiceHandle {
    /// Provisions every member and waits until all of them are ready.
    /// On failure nothing is left running.
    pub async fn start(
        engine: Arc<dyn ContainerEngine>,
        run: &RunConfig,
        interrupt: &mut Interrupt,
    ) -> Result<Self, ServiceError> {
        let (service_name, user_named) = match &run.network_name {
            Some(name) => (name.clone(), true),
            None => (random_name(), false),
        };

        let topology = build_topology(
            &TopologyRequest {
                service_name: service_name.clone(),
                instance_count: run.instance_count,
                read_replicas: run.read_replicas,
                config: run.config.clone(),
                env: run.env.clone(),
            },
            &run.settings,
        )?;
        let source = resolve_image(&run.image, topology.is_cluster())?;

        let manager = LifecycleManager::new(engine, run.settings.poll_interval());
        let image = manager.prepare_image(&source, interrupt).await?;
        let specs = build_specs(&topology, &image, &run.auth, &run.config, &run.env);

        info!(
            "Starting service {:?} ({} member(s), image {})",
            service_name,
            topology.instance_count(),
            image
        );
        debug!("Member roles: {:?}", topology.roles());
        let mut set = manager
            .provision(&service_name, user_named, specs, interrupt)
            .await?;
        manager
            .await_ready(&mut set, run.settings.ready_timeout(), interrupt)
            .await?;

        Ok(Self {
            manager,
            topology,
            set,
            auth: run.auth.clone(),
            closed: false,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.topology.service_name
    }

    pub fn client_address(&self) -> &Address {
        &self.topology.client_address
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn members(&self) -> &[ContainerRecord] {
        &self.set.records
    }

    pub fn member(&self, name: &str) -> Option<&ContainerRecord> {
        self.set.find(name)
    }

    /// Variables handed to clients of the service.
    pub fn env(&self) -> Vec<(String, String)> {
        let addresses: Vec<String> = self
            .topology
            .members
            .iter()
            .map(|m| m.bolt_address().to_string())
            .collect();
        vec![
            ("BOLT_SERVER_ADDR".to_string(), addresses.join(" ")),
            ("NEO4J_AUTH".to_string(), self.auth.to_string()),
        ]
    }

    pub async fn logs(&self, record: &ContainerRecord, tail: usize) -> Result<Vec<String>, EngineError> {
        self.manager.engine().logs(&record.id, tail).await
    }

    /// Runs `argv` with the service environment and returns its exit code.
    /// An interrupt kills the child.
    pub async fn run_command(
        &self,
        argv: &[String],
        interrupt: &mut Interrupt,
    ) -> Result<i32, ServiceError> {
        let command = argv.join(" ");
        let Some((program, args)) = argv.split_first() else {
            return Err(ServiceError::Command {
                command,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        info!("Running {:?}", command);
        let mut child = Command::new(program)
            .args(args)
            .envs(self.env())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ServiceError::Command {
                command: command.clone(),
                source,
            })?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|source| ServiceError::Command {
                    command: command.clone(),
                    source,
                })?;
                // Killed by a signal: no code.
                let code = status.code().unwrap_or(-1);
                info!("{:?} exited with code {}", command, code);
                Ok(code)
            }
            _ = interrupt.triggered() => {
                warn!("Interrupted, killing {:?}", command);
                if let Err(e) = child.kill().await {
                    debug!("Kill of {:?} failed: {}", command, e);
                }
                Err(ServiceError::Interrupted { rollback: None })
            }
        }
    }

    /// Tears the service down and combines the result with `outcome`.
    /// A teardown failure never replaces an error already in `outcome`.
    pub async fn close<T>(mut self, outcome: Result<T, ServiceError>) -> Result<T, ServiceError> {
        let teardown = self.manager.teardown(&mut self.set).await;
        self.closed = true;
        match outcome {
            Ok(value) => match teardown {
                Ok(()) => {
                    info!("Service {:?} stopped", self.topology.service_name);
                    Ok(value)
                }
                Err(e) => Err(ServiceError::Teardown(e)),
            },
            Err(err) => Err(err.with_rollback(teardown)),
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if !self.closed && !self.set.is_torn_down() {
            warn!(
                "Service {:?} dropped while running; remove it with `neodock --cleanup --name {}`",
                self.topology.service_name, self.topology.service_name
            );
        }
    }
}
