//! In-memory engine for tests. Records every call and can be told to fail
//! specific members.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerEngine, Probe};
use crate::error::EngineError;
use crate::types::ContainerSpec;

#[derive(Default)]
struct State {
    networks: HashSet<String>,
    /// id -> (container name, service label)
    containers: HashMap<String, (String, String)>,
    images: HashSet<String>,
    calls: Vec<String>,
    next_id: usize,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
    /// Container names whose start fails.
    pub fail_start: HashSet<String>,
    /// Container names that never pass the readiness probe.
    pub never_ready: HashSet<String>,
    /// Container names that exit during startup, with their exit code.
    pub exits: HashMap<String, i64>,
    /// Container names whose removal fails.
    pub fail_remove: HashSet<String>,
    /// How long pulling or loading an image takes.
    pub image_delay: Duration,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, image: &str) -> Self {
        self.lock().images.insert(image.to_string());
        self
    }

    pub fn with_network(self, name: &str) -> Self {
        self.lock().networks.insert(name.to_string());
        self
    }

    /// Pretends a container is left over from an earlier run. The service
    /// label is everything after the member name.
    pub fn with_container(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            state.next_id += 1;
            let id = format!("leftover{}", state.next_id);
            let service = name.split_once('.').map_or("", |(_, s)| s);
            state
                .containers
                .insert(id, (name.to_string(), service.to_string()));
        }
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }

    fn name_of(&self, id: &str) -> Result<String, EngineError> {
        self.lock()
            .containers
            .get(id)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().networks.contains(name)
    }

    pub fn network_count(&self) -> usize {
        self.lock().networks.len()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.has_network(name))
    }

    async fn create_network(&self, name: &str) -> Result<(), EngineError> {
        self.record(format!("create_network {}", name));
        self.lock().networks.insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.record(format!("remove_network {}", name));
        if self.lock().networks.remove(name) {
            Ok(())
        } else {
            Err(EngineError::NotFound(name.to_string()))
        }
    }

    async fn load_image(&self, archive: &Path) -> Result<String, EngineError> {
        self.record(format!("load_image {}", archive.display()));
        tokio::time::sleep(self.image_delay).await;
        let tag = "neo4j:from-archive".to_string();
        self.lock().images.insert(tag.clone());
        Ok(tag)
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record(format!("pull_image {}", image));
        tokio::time::sleep(self.image_delay).await;
        self.lock().images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record(format!("create_container {}", spec.name));
        let mut state = self.lock();
        if !state.images.contains(&spec.image) {
            return Err(EngineError::ImageNotFound(spec.image.clone()));
        }
        state.next_id += 1;
        let id = format!("id{}", state.next_id);
        state
            .containers
            .insert(id.clone(), (spec.name.clone(), spec.network.clone()));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let name = self.name_of(id)?;
        self.record(format!("start_container {}", name));
        if self.fail_start.contains(&name) {
            return Err(EngineError::Failed(format!("port is already allocated ({})", name)));
        }
        Ok(())
    }

    async fn probe(&self, id: &str, _spec: &ContainerSpec) -> Result<Probe, EngineError> {
        let name = self.name_of(id)?;
        if let Some(code) = self.exits.get(&name) {
            return Ok(Probe::Exited { code: *code });
        }
        if self.never_ready.contains(&name) {
            return Ok(Probe::Starting);
        }
        Ok(Probe::Ready)
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>, EngineError> {
        let name = self.name_of(id)?;
        let lines: Vec<String> = (1..=3).map(|i| format!("{} line {}", name, i)).collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let name = self.name_of(id)?;
        self.record(format!("stop_container {}", name));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let name = self.name_of(id)?;
        self.record(format!("remove_container {}", name));
        if self.fail_remove.contains(&name) {
            return Err(EngineError::Failed("removal of container in progress".into()));
        }
        self.lock().containers.remove(id);
        Ok(())
    }

    async fn find_service_containers(&self, service: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|(_, (_, label))| label == service)
            .map(|(id, _)| id.clone())
            .collect())
    }
}
