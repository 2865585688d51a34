//! Container set lifecycle: create, start, await readiness, tear down.
//!
//! The engine works one container at a time; this module makes the whole
//! set behave as one unit. Startup is all-or-nothing: any failure before
//! every member is ready rolls back everything created so far. Teardown is
//! best-effort and idempotent: it keeps going past individual failures and
//! skips resources that are already gone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::error::{EngineError, ResourceFailure, ServiceError, TeardownError};
use crate::images::ImageSource;
use crate::runtime::{ContainerEngine, Probe};
use crate::signal::Interrupt;
use crate::types::{ContainerRecord, ContainerSpec, ContainerState, NetworkOwnership, NetworkRef};

/// Lines of container output logged when a member dies during startup.
const FAILURE_LOG_TAIL: usize = 50;

/// The provisioned members of one service and the network they share.
#[derive(Debug)]
pub struct ContainerSet {
    pub service_name: String,
    pub network: NetworkRef,
    pub records: Vec<ContainerRecord>,
    network_removed: bool,
}

impl ContainerSet {
    /// Looks a member up by container name (`a.svc`) or member name (`a`).
    pub fn find(&self, name: &str) -> Option<&ContainerRecord> {
        let qualified = format!("{}.{}", name, self.service_name);
        self.records
            .iter()
            .find(|r| r.spec.name == name || r.spec.name == qualified)
    }

    pub fn is_torn_down(&self) -> bool {
        let network_done =
            self.network.ownership == NetworkOwnership::UserProvided || self.network_removed;
        network_done
            && self
                .records
                .iter()
                .all(|r| r.state == ContainerState::Stopped)
    }
}

enum LaunchError {
    Engine(EngineError),
    Interrupted,
}

struct LaunchFailure {
    /// Set when the container was created before the failure.
    id: Option<String>,
    error: LaunchError,
}

impl LaunchFailure {
    fn uncreated(error: EngineError) -> Self {
        Self {
            id: None,
            error: LaunchError::Engine(error),
        }
    }

    fn interrupted(id: Option<String>) -> Self {
        Self {
            id,
            error: LaunchError::Interrupted,
        }
    }
}

enum Readiness {
    Ready(Duration),
    Exited(i64),
    Gone,
    TimedOut,
}

pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    poll_interval: Duration,
}

impl LifecycleManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, poll_interval: Duration) -> Self {
        Self {
            engine,
            poll_interval,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Turns an image source into a tag the engine can create containers
    /// from. Archives are loaded; registry tags are pulled lazily.
    pub async fn prepare_image(
        &self,
        source: &ImageSource,
        interrupt: &Interrupt,
    ) -> Result<String, ServiceError> {
        let path = match source {
            ImageSource::Tag(tag) => return Ok(tag.clone()),
            ImageSource::Archive(path) => path,
        };
        let mut interrupt = interrupt.clone();
        tokio::select! {
            loaded = self.engine.load_image(path) => Ok(loaded?),
            _ = interrupt.triggered() => {
                warn!("Interrupted while loading {}", path.display());
                Err(ServiceError::Interrupted { rollback: None })
            }
        }
    }

    /// Creates the network and launches every member concurrently.
    ///
    /// `user_named` says the network name came from the operator; an
    /// existing network with that name is reused and never removed.
    pub async fn provision(
        &self,
        service_name: &str,
        user_named: bool,
        specs: Vec<ContainerSpec>,
        interrupt: &Interrupt,
    ) -> Result<ContainerSet, ServiceError> {
        if interrupt.is_set() {
            return Err(ServiceError::Interrupted { rollback: None });
        }
        let network = self
            .attach_network(service_name, user_named)
            .await
            .map_err(|e| ServiceError::Start {
                service: service_name.to_string(),
                cause: format!("network {:?}: {}", service_name, e),
                members: Vec::new(),
                rollback: None,
            })?;

        let mut set = ContainerSet {
            service_name: service_name.to_string(),
            network,
            records: Vec::with_capacity(specs.len()),
            network_removed: false,
        };

        let results = join_all(
            specs
                .iter()
                .map(|spec| self.launch(spec, interrupt.clone())),
        )
        .await;

        let mut failed = Vec::new();
        let mut first_cause = None;
        let mut interrupted = interrupt.is_set();
        for (spec, result) in specs.into_iter().zip(results) {
            let failure = match result {
                Ok(id) => {
                    set.records.push(ContainerRecord {
                        id,
                        spec,
                        state: ContainerState::Starting,
                    });
                    continue;
                }
                Err(failure) => failure,
            };
            match &failure.error {
                LaunchError::Engine(e) => {
                    error!("Member {} failed to start: {}", spec.name, e);
                    failed.push(spec.name.clone());
                    first_cause.get_or_insert_with(|| e.to_string());
                }
                LaunchError::Interrupted => interrupted = true,
            }
            // Created but never started; still needs removing.
            if let Some(id) = failure.id {
                set.records.push(ContainerRecord {
                    id,
                    spec,
                    state: ContainerState::Created,
                });
            }
        }

        if interrupted {
            warn!("Interrupted while starting service {:?}", service_name);
            let outcome = self.teardown(&mut set).await;
            return Err(ServiceError::Interrupted { rollback: None }.with_rollback(outcome));
        }

        if let Some(cause) = first_cause {
            let err = ServiceError::Start {
                service: service_name.to_string(),
                cause,
                members: failed,
                rollback: None,
            };
            let outcome = self.teardown(&mut set).await;
            return Err(err.with_rollback(outcome));
        }
        Ok(set)
    }

    async fn attach_network(
        &self,
        name: &str,
        user_named: bool,
    ) -> Result<NetworkRef, EngineError> {
        if user_named && self.engine.network_exists(name).await? {
            info!("Attaching to existing network {:?}", name);
            return Ok(NetworkRef {
                name: name.to_string(),
                ownership: NetworkOwnership::UserProvided,
            });
        }
        self.engine.create_network(name).await?;
        debug!("Created network {:?}", name);
        Ok(NetworkRef {
            name: name.to_string(),
            ownership: NetworkOwnership::AutoCreated,
        })
    }

    async fn launch(
        &self,
        spec: &ContainerSpec,
        mut interrupt: Interrupt,
    ) -> Result<String, LaunchFailure> {
        if interrupt.is_set() {
            return Err(LaunchFailure::interrupted(None));
        }
        let id = match self.engine.create_container(spec).await {
            Ok(id) => id,
            Err(EngineError::ImageNotFound(image)) => {
                tokio::select! {
                    pulled = self.engine.pull_image(&image) => {
                        pulled.map_err(LaunchFailure::uncreated)?
                    }
                    _ = interrupt.triggered() => return Err(LaunchFailure::interrupted(None)),
                }
                self.engine
                    .create_container(spec)
                    .await
                    .map_err(LaunchFailure::uncreated)?
            }
            Err(e) => return Err(LaunchFailure::uncreated(e)),
        };
        if interrupt.is_set() {
            return Err(LaunchFailure::interrupted(Some(id)));
        }

        info!(
            "Starting {} member {:?} at {}",
            spec.role,
            spec.name,
            spec.bolt_address()
        );
        match self.engine.start_container(&id).await {
            Ok(()) => Ok(id),
            Err(error) => Err(LaunchFailure {
                id: Some(id),
                error: LaunchError::Engine(error),
            }),
        }
    }

    /// Waits until every member accepts client connections. Any member
    /// that exits or misses the deadline fails the whole set, which is
    /// then rolled back.
    pub async fn await_ready(
        &self,
        set: &mut ContainerSet,
        timeout: Duration,
        interrupt: &mut Interrupt,
    ) -> Result<(), ServiceError> {
        let polls = join_all(set.records.iter().map(|r| self.poll_member(r, timeout)));
        let results = tokio::select! {
            results = polls => Some(results),
            _ = interrupt.triggered() => None,
        };

        let Some(results) = results else {
            warn!("Interrupted while waiting for service {:?}", set.service_name);
            let outcome = self.teardown(set).await;
            return Err(ServiceError::Interrupted { rollback: None }.with_rollback(outcome));
        };

        let mut pending = Vec::new();
        for (record, result) in set.records.iter_mut().zip(results) {
            match result {
                Readiness::Ready(elapsed) => {
                    record.state = ContainerState::Ready;
                    info!(
                        "Member {:?} available after {:.02}s",
                        record.spec.name,
                        elapsed.as_secs_f64()
                    );
                }
                Readiness::Exited(code) => {
                    record.state = ContainerState::Failed;
                    pending.push(format!("{} (exited with code {})", record.spec.name, code));
                }
                Readiness::Gone => {
                    record.state = ContainerState::Failed;
                    pending.push(format!("{} (container disappeared)", record.spec.name));
                }
                Readiness::TimedOut => {
                    record.state = ContainerState::Failed;
                    pending.push(record.spec.name.clone());
                }
            }
        }

        if pending.is_empty() {
            info!("Service {:?} available", set.service_name);
            return Ok(());
        }

        let err = ServiceError::Readiness {
            service: set.service_name.clone(),
            timeout,
            pending,
            rollback: None,
        };
        let outcome = self.teardown(set).await;
        Err(err.with_rollback(outcome))
    }

    async fn poll_member(&self, record: &ContainerRecord, timeout: Duration) -> Readiness {
        let started = Instant::now();
        let name = &record.spec.name;
        let poll = async {
            loop {
                match self.engine.probe(&record.id, &record.spec).await {
                    Ok(Probe::Ready) => return Readiness::Ready(started.elapsed()),
                    Ok(Probe::Exited { code }) => {
                        error!("Member {:?} exited with code {}", name, code);
                        self.log_tail(record).await;
                        return Readiness::Exited(code);
                    }
                    Ok(Probe::Starting) => {}
                    Err(e) if e.is_not_found() => {
                        error!("Member {:?} disappeared during startup", name);
                        return Readiness::Gone;
                    }
                    Err(e) => debug!("Probe of {:?} failed: {}", name, e),
                }
                sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(readiness) => readiness,
            Err(_) => {
                error!("Member {:?} did not become available", name);
                Readiness::TimedOut
            }
        }
    }

    async fn log_tail(&self, record: &ContainerRecord) {
        match self.engine.logs(&record.id, FAILURE_LOG_TAIL).await {
            Ok(lines) => {
                for line in lines {
                    error!("> {}", line);
                }
            }
            Err(e) => debug!("No logs for {:?}: {}", record.spec.name, e),
        }
    }

    /// Stops and removes every member, then the network if we created it.
    /// Resources that are already gone count as removed; a second call
    /// only retries what failed the first time.
    pub async fn teardown(&self, set: &mut ContainerSet) -> Result<(), TeardownError> {
        let live: Vec<usize> = (0..set.records.len())
            .filter(|&i| set.records[i].state != ContainerState::Stopped)
            .collect();
        let network_pending =
            set.network.ownership == NetworkOwnership::AutoCreated && !set.network_removed;
        if live.is_empty() && !network_pending {
            debug!("Service {:?} already torn down", set.service_name);
            return Ok(());
        }

        info!("Stopping service {:?}", set.service_name);
        let records = &set.records;
        let results = join_all(live.iter().map(|&i| {
            let record = &records[i];
            self.remove_container(&record.id, &record.spec.name)
        }))
        .await;

        let mut failures = Vec::new();
        for (i, result) in live.into_iter().zip(results) {
            let record = &mut set.records[i];
            match result {
                Ok(()) => record.state = ContainerState::Stopped,
                Err(e) => failures.push(ResourceFailure {
                    resource: format!("container {}", record.spec.name),
                    message: e.to_string(),
                }),
            }
        }

        if network_pending {
            match self.engine.remove_network(&set.network.name).await {
                Ok(()) => {
                    debug!("Removed network {:?}", set.network.name);
                    set.network_removed = true;
                }
                Err(e) if e.is_not_found() => set.network_removed = true,
                Err(e) => failures.push(ResourceFailure {
                    resource: format!("network {}", set.network.name),
                    message: e.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                warn!("Teardown: {}", failure);
            }
            Err(TeardownError { failures })
        }
    }

    async fn remove_container(&self, id: &str, name: &str) -> Result<(), EngineError> {
        info!("Stopping container {:?}", name);
        match self.engine.stop_container(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            // Removal is forced, so a failed stop is not fatal.
            Err(e) => debug!("Stop of {:?} failed: {}", name, e),
        }
        match self.engine.remove_container(id).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Removes containers and the network left behind by an earlier run
    /// of `service_name`. Returns how many containers were removed.
    pub async fn remove_leftovers(&self, service_name: &str) -> Result<usize, TeardownError> {
        let ids = self
            .engine
            .find_service_containers(service_name)
            .await
            .map_err(|e| TeardownError {
                failures: vec![ResourceFailure {
                    resource: format!("containers of {}", service_name),
                    message: e.to_string(),
                }],
            })?;

        let results = join_all(ids.iter().map(|id| self.remove_container(id, id))).await;
        let mut failures = Vec::new();
        let mut removed = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => removed += 1,
                Err(e) => failures.push(ResourceFailure {
                    resource: format!("container {}", id),
                    message: e.to_string(),
                }),
            }
        }
        match self.engine.remove_network(service_name).await {
            Err(e) if !e.is_not_found() => failures.push(ResourceFailure {
                resource: format!("network {}", service_name),
                message: e.to_string(),
            }),
            _ => {}
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(TeardownError { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Overrides, Settings};
    use crate::container_spec::build_specs;
    use crate::runtime::fake::FakeEngine;
    use crate::topology::{build_topology, TopologyRequest};
    use crate::types::Auth;

    const IMAGE: &str = "neo4j:4.0-enterprise";

    fn specs(count: usize) -> Vec<ContainerSpec> {
        let topology = build_topology(
            &TopologyRequest {
                service_name: "svc".into(),
                instance_count: count,
                read_replicas: 0,
                config: Overrides::new(),
                env: Overrides::new(),
            },
            &Settings::default(),
        )
        .unwrap();
        let auth = Auth {
            user: "neo4j".into(),
            password: "password".into(),
        };
        build_specs(&topology, IMAGE, &auth, &Overrides::new(), &Overrides::new())
    }

    fn manager(engine: &Arc<FakeEngine>) -> LifecycleManager {
        LifecycleManager::new(engine.clone(), Duration::from_millis(5))
    }

    /// The sender is dropped, so this never fires.
    fn no_interrupt() -> Interrupt {
        Interrupt::channel().1
    }

    #[tokio::test]
    async fn provisions_every_member() {
        let engine = Arc::new(FakeEngine::new().with_image(IMAGE));
        let manager = manager(&engine);

        let set = manager
            .provision("svc", false, specs(3), &no_interrupt())
            .await
            .unwrap();

        assert_eq!(set.records.len(), 3);
        assert!(set
            .records
            .iter()
            .all(|r| r.state == ContainerState::Starting));
        assert_eq!(set.network.ownership, NetworkOwnership::AutoCreated);
        assert_eq!(engine.container_count(), 3);
        assert!(engine.has_network("svc"));
        assert_eq!(set.find("b").unwrap().spec.name, "b.svc");
        assert_eq!(set.find("c.svc").unwrap().spec.name, "c.svc");
    }

    #[tokio::test]
    async fn failed_start_rolls_back_everything() {
        let mut fake = FakeEngine::new().with_image(IMAGE);
        fake.fail_start.insert("b.svc".into());
        let engine = Arc::new(fake);
        let manager = manager(&engine);

        let err = manager
            .provision("svc", false, specs(3), &no_interrupt())
            .await
            .unwrap_err();

        match &err {
            ServiceError::Start {
                members, rollback, ..
            } => {
                assert_eq!(members, &vec!["b.svc".to_string()]);
                assert!(rollback.is_none());
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.to_string().contains("port is already allocated"));
        assert_eq!(engine.container_count(), 0);
        assert_eq!(engine.network_count(), 0);
    }

    #[tokio::test]
    async fn user_network_survives_rollback() {
        let mut fake = FakeEngine::new().with_image(IMAGE).with_network("svc");
        fake.fail_start.insert("a.svc".into());
        let engine = Arc::new(fake);
        let manager = manager(&engine);

        assert!(manager
            .provision("svc", true, specs(1), &no_interrupt())
            .await
            .is_err());
        assert_eq!(engine.container_count(), 0);
        assert!(engine.has_network("svc"));
        assert_eq!(engine.count_calls("create_network"), 0);
        assert_eq!(engine.count_calls("remove_network"), 0);
    }

    #[tokio::test]
    async fn missing_image_is_pulled_once_then_created() {
        let engine = Arc::new(FakeEngine::new());
        let manager = manager(&engine);

        let set = manager
            .provision("svc", false, specs(1), &no_interrupt())
            .await
            .unwrap();
        assert_eq!(set.records.len(), 1);
        assert_eq!(engine.count_calls("pull_image"), 1);
        assert_eq!(engine.count_calls("create_container"), 2);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let engine = Arc::new(FakeEngine::new().with_image(IMAGE));
        let manager = manager(&engine);
        let mut set = manager
            .provision("svc", false, specs(3), &no_interrupt())
            .await
            .unwrap();

        manager.teardown(&mut set).await.unwrap();
        manager.teardown(&mut set).await.unwrap();

        assert!(set.is_torn_down());
        assert_eq!(engine.count_calls("remove_container"), 3);
        assert_eq!(engine.count_calls("remove_network"), 1);
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn teardown_collects_failures_and_keeps_going() {
        let mut fake = FakeEngine::new().with_image(IMAGE);
        fake.fail_remove.insert("a.svc".into());
        let engine = Arc::new(fake);
        let manager = manager(&engine);
        let mut set = manager
            .provision("svc", false, specs(3), &no_interrupt())
            .await
            .unwrap();

        let err = manager.teardown(&mut set).await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].resource, "container a.svc");
        assert_eq!(engine.container_count(), 1);
        assert!(!set.is_torn_down());

        // Only the failed member is retried.
        let _ = manager.teardown(&mut set).await;
        assert_eq!(engine.count_calls("remove_container"), 4);
    }

    #[tokio::test]
    async fn ready_only_when_every_member_is_ready() {
        let engine = Arc::new(FakeEngine::new().with_image(IMAGE));
        let manager = manager(&engine);
        let mut set = manager
            .provision("svc", false, specs(3), &no_interrupt())
            .await
            .unwrap();

        manager
            .await_ready(&mut set, Duration::from_secs(1), &mut no_interrupt())
            .await
            .unwrap();
        assert!(set.records.iter().all(|r| r.state == ContainerState::Ready));
    }

    #[tokio::test]
    async fn one_never_ready_member_fails_the_set() {
        let mut fake = FakeEngine::new().with_image(IMAGE);
        fake.never_ready.insert("c.svc".into());
        let engine = Arc::new(fake);
        let manager = manager(&engine);
        let mut set = manager
            .provision("svc", false, specs(3), &no_interrupt())
            .await
            .unwrap();

        let err = manager
            .await_ready(&mut set, Duration::from_millis(50), &mut no_interrupt())
            .await
            .unwrap_err();

        match err {
            ServiceError::Readiness { pending, .. } => {
                assert_eq!(pending, vec!["c.svc".to_string()])
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(engine.container_count(), 0);
        assert_eq!(engine.network_count(), 0);
    }

    #[tokio::test]
    async fn exited_member_is_reported_with_its_code() {
        let mut fake = FakeEngine::new().with_image(IMAGE);
        fake.exits.insert("a.svc".into(), 137);
        let engine = Arc::new(fake);
        let manager = manager(&engine);
        let mut set = manager
            .provision("svc", false, specs(1), &no_interrupt())
            .await
            .unwrap();

        let err = manager
            .await_ready(&mut set, Duration::from_secs(5), &mut no_interrupt())
            .await
            .unwrap_err();
        let explanation = err.explanation().unwrap();
        assert!(explanation.contains("a.svc (exited with code 137)"));
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn interrupt_while_waiting_rolls_back() {
        let mut fake = FakeEngine::new().with_image(IMAGE);
        fake.never_ready.insert("a.svc".into());
        let engine = Arc::new(fake);
        let manager = manager(&engine);
        let mut set = manager
            .provision("svc", false, specs(2), &no_interrupt())
            .await
            .unwrap();

        let (tx, mut interrupt) = Interrupt::channel();
        tx.send(true).unwrap();
        let err = manager
            .await_ready(&mut set, Duration::from_secs(30), &mut interrupt)
            .await
            .unwrap_err();

        assert!(err.is_interrupt());
        assert_eq!(engine.container_count(), 0);
        assert!(set.is_torn_down());
    }

    #[tokio::test]
    async fn interrupt_before_provision_touches_nothing() {
        let engine = Arc::new(FakeEngine::new().with_image(IMAGE));
        let manager = manager(&engine);
        let (tx, interrupt) = Interrupt::channel();
        tx.send(true).unwrap();

        let err = manager
            .provision("svc", false, specs(3), &interrupt)
            .await
            .unwrap_err();
        assert!(err.is_interrupt());
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn interrupt_during_pull_rolls_back() {
        let mut fake = FakeEngine::new();
        fake.image_delay = Duration::from_secs(30);
        let engine = Arc::new(fake);
        let manager = manager(&engine);
        let (tx, interrupt) = Interrupt::channel();

        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            manager.provision("svc", false, specs(3), &interrupt),
        )
        .await
        .expect("pull should be abandoned")
        .unwrap_err();

        assert!(err.is_interrupt());
        assert_eq!(engine.count_calls("pull_image"), 3);
        assert_eq!(engine.count_calls("start_container"), 0);
        assert_eq!(engine.container_count(), 0);
        assert_eq!(engine.network_count(), 0);
    }

    #[tokio::test]
    async fn interrupt_while_loading_archive() {
        let mut fake = FakeEngine::new();
        fake.image_delay = Duration::from_secs(30);
        let engine = Arc::new(fake);
        let manager = manager(&engine);
        let (tx, interrupt) = Interrupt::channel();

        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });
        let source = ImageSource::Archive("/tmp/neo4j.tar".into());
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            manager.prepare_image(&source, &interrupt),
        )
        .await
        .expect("load should be abandoned")
        .unwrap_err();
        assert!(err.is_interrupt());
    }

    #[tokio::test]
    async fn leftovers_are_found_by_service_label() {
        let engine = Arc::new(
            FakeEngine::new()
                .with_network("old")
                .with_container("a.old")
                .with_container("b.old")
                .with_container("a.other")
                .with_container("a.foo.old"),
        );
        let manager = manager(&engine);

        assert_eq!(manager.remove_leftovers("old").await.unwrap(), 2);
        // `a.foo.old` belongs to service `foo.old`.
        assert_eq!(engine.container_count(), 2);
        assert!(!engine.has_network("old"));
    }
}
