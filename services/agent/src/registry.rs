//! Container registry.
//!
//! The registry hosts the collection of active containers: it accepts
//! create/start/stop/destroy from the HTTP API, routes heartbeats, and
//! publishes per-container state deltas to subscribers. Every state
//! change by any container becomes exactly one message on the fan-out.
//!
//! Heartbeats for unknown ids are answered with `FORCEDOWN`; that is the
//! protocol by which an orphaned container process kills itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use convoy_broadcast::SinkSet;
use convoy_types::{
    ContainerConfig, ContainerInstance, ContainerStatus, Heartbeat, HostResources, StateEvent,
    WantState,
};

use crate::container::{
    spawn_container, spawn_recovered_container, ContainerOp, ContainerUpdate, OpError,
};
use crate::runtime::ProcessRuntime;
use crate::rundir::InstanceRecord;
use crate::supervisor::SupervisorSettings;

/// What subscribers receive: a full snapshot on subscribe, then deltas
/// carrying only the changed instances.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Snapshot(StateEvent),
    Delta(StateEvent),
}

enum RegistryMessage {
    Register {
        id: String,
        config: ContainerConfig,
        reply: oneshot::Sender<Result<(), OpError>>,
    },
    Recover {
        record: InstanceRecord,
    },
    Start {
        id: String,
        reply: oneshot::Sender<Result<(), OpError>>,
    },
    Stop {
        id: String,
        reply: oneshot::Sender<Result<(), OpError>>,
    },
    Destroy {
        id: String,
        reply: oneshot::Sender<Result<(), OpError>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<ContainerInstance>>,
    },
    Instances {
        reply: oneshot::Sender<BTreeMap<String, ContainerInstance>>,
    },
    Snapshot {
        reply: oneshot::Sender<StateEvent>,
    },
    Heartbeat {
        heartbeat: Heartbeat,
        reply: oneshot::Sender<WantState>,
    },
    Notify {
        sink: mpsc::Sender<RegistryEvent>,
    },
    StopNotify {
        sink: mpsc::Sender<RegistryEvent>,
    },
}

/// Handle to the registry worker.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryMessage>,
}

impl RegistryHandle {
    /// Spawn the registry worker.
    pub fn spawn<R: ProcessRuntime>(
        runtime: Arc<R>,
        settings: SupervisorSettings,
        base_resources: HostResources,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (updates_tx, updates_rx) = mpsc::channel(256);

        let worker = Worker {
            runtime,
            settings,
            base_resources,
            containers: BTreeMap::new(),
            sinks: SinkSet::new("container-registry"),
            updates_tx,
            mailbox: rx,
            updates: updates_rx,
        };
        tokio::spawn(worker.run());

        Self { tx }
    }

    /// Register a new container and drive it to `Created`.
    pub async fn register(&self, id: &str, config: ContainerConfig) -> Result<(), OpError> {
        self.request(|reply| RegistryMessage::Register {
            id: id.to_string(),
            config,
            reply,
        })
        .await?
    }

    /// Re-admit a container found in the run root after a restart.
    pub async fn recover(&self, record: InstanceRecord) {
        let _ = self.tx.send(RegistryMessage::Recover { record }).await;
    }

    pub async fn start(&self, id: &str) -> Result<(), OpError> {
        self.request(|reply| RegistryMessage::Start {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn stop(&self, id: &str) -> Result<(), OpError> {
        self.request(|reply| RegistryMessage::Stop {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn destroy(&self, id: &str) -> Result<(), OpError> {
        self.request(|reply| RegistryMessage::Destroy {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn get(&self, id: &str) -> Option<ContainerInstance> {
        self.request(|reply| RegistryMessage::Get {
            id: id.to_string(),
            reply,
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn instances(&self) -> BTreeMap<String, ContainerInstance> {
        self.request(|reply| RegistryMessage::Instances { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> StateEvent {
        self.request(|reply| RegistryMessage::Snapshot { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn heartbeat(&self, heartbeat: Heartbeat) -> WantState {
        self.request(|reply| RegistryMessage::Heartbeat { heartbeat, reply })
            .await
            .unwrap_or(WantState::ForceDown)
    }

    pub async fn notify(&self, sink: mpsc::Sender<RegistryEvent>) {
        let _ = self.tx.send(RegistryMessage::Notify { sink }).await;
    }

    pub async fn stop_notify(&self, sink: mpsc::Sender<RegistryEvent>) {
        let _ = self.tx.send(RegistryMessage::StopNotify { sink }).await;
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, OpError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| OpError::Internal("registry is gone".to_string()))?;
        rx.await
            .map_err(|_| OpError::Internal("registry dropped the request".to_string()))
    }
}

struct Entry {
    ops: mpsc::Sender<ContainerOp>,
    /// None until the container reached `Created`.
    instance: Option<ContainerInstance>,
}

struct Worker<R: ProcessRuntime> {
    runtime: Arc<R>,
    settings: SupervisorSettings,
    base_resources: HostResources,

    containers: BTreeMap<String, Entry>,
    sinks: SinkSet<RegistryEvent>,
    updates_tx: mpsc::Sender<ContainerUpdate>,

    mailbox: mpsc::Receiver<RegistryMessage>,
    updates: mpsc::Receiver<ContainerUpdate>,
}

impl<R: ProcessRuntime> Worker<R> {
    async fn run(mut self) {
        debug!("container registry started");

        loop {
            tokio::select! {
                biased;

                update = self.updates.recv() => {
                    match update {
                        Some(update) => self.handle_update(update).await,
                        None => break,
                    }
                }

                msg = self.mailbox.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => break,
                    }
                }
            }
        }

        debug!("container registry stopped");
    }

    fn resources(&self) -> HostResources {
        let mut resources = self.base_resources.clone();
        for entry in self.containers.values() {
            if let Some(instance) = &entry.instance {
                resources.reserve(&instance.config);
            }
        }
        resources
    }

    fn state_event(&self) -> StateEvent {
        StateEvent {
            resources: self.resources(),
            instances: self
                .containers
                .iter()
                .filter_map(|(id, e)| e.instance.clone().map(|i| (id.clone(), i)))
                .collect(),
        }
    }

    async fn handle_message(&mut self, msg: RegistryMessage) {
        match msg {
            RegistryMessage::Register { id, config, reply } => {
                if self.containers.contains_key(&id) {
                    let _ = reply.send(Err(OpError::AlreadyExists));
                    return;
                }

                info!(container_id = %id, "registering container");
                let (ops_tx, ops_rx) = mpsc::channel(16);
                self.containers.insert(
                    id.clone(),
                    Entry {
                        ops: ops_tx,
                        instance: None,
                    },
                );
                spawn_container(
                    id,
                    config,
                    Arc::clone(&self.runtime),
                    self.settings.clone(),
                    ops_rx,
                    self.updates_tx.clone(),
                    reply,
                );
            }
            RegistryMessage::Recover { record } => {
                if self.containers.contains_key(&record.id) {
                    return;
                }
                info!(container_id = %record.id, "recovering container from rundir");
                let (ops_tx, ops_rx) = mpsc::channel(16);
                self.containers.insert(
                    record.id.clone(),
                    Entry {
                        ops: ops_tx,
                        instance: None,
                    },
                );
                spawn_recovered_container(
                    record.id,
                    record.config,
                    Arc::clone(&self.runtime),
                    self.settings.clone(),
                    ops_rx,
                    self.updates_tx.clone(),
                );
            }
            RegistryMessage::Start { id, reply } => {
                self.forward(&id, reply, |reply| ContainerOp::Start { reply })
                    .await;
            }
            RegistryMessage::Stop { id, reply } => {
                self.forward(&id, reply, |reply| ContainerOp::Stop { reply })
                    .await;
            }
            RegistryMessage::Destroy { id, reply } => {
                self.forward(&id, reply, |reply| ContainerOp::Destroy { reply })
                    .await;
            }
            RegistryMessage::Get { id, reply } => {
                let instance = self
                    .containers
                    .get(&id)
                    .and_then(|e| e.instance.clone());
                let _ = reply.send(instance);
            }
            RegistryMessage::Instances { reply } => {
                let _ = reply.send(self.state_event().instances);
            }
            RegistryMessage::Snapshot { reply } => {
                let _ = reply.send(self.state_event());
            }
            RegistryMessage::Heartbeat { heartbeat, reply } => {
                match self.containers.get(&heartbeat.id) {
                    Some(entry) => {
                        let op = ContainerOp::Heartbeat {
                            state: heartbeat.state,
                            reply,
                        };
                        if let Err(mpsc::error::SendError(ContainerOp::Heartbeat {
                            reply, ..
                        })) = entry.ops.send(op).await
                        {
                            let _ = reply.send(WantState::ForceDown);
                        }
                    }
                    None => {
                        debug!(container_id = %heartbeat.id, "heartbeat from unknown container");
                        let _ = reply.send(WantState::ForceDown);
                    }
                }
            }
            RegistryMessage::Notify { sink } => {
                let _ = sink
                    .send(RegistryEvent::Snapshot(self.state_event()))
                    .await;
                self.sinks.add(sink);
            }
            RegistryMessage::StopNotify { sink } => {
                self.sinks.remove(&sink);
            }
        }
    }

    async fn forward(
        &mut self,
        id: &str,
        reply: oneshot::Sender<Result<(), OpError>>,
        make: impl FnOnce(oneshot::Sender<Result<(), OpError>>) -> ContainerOp,
    ) {
        match self.containers.get(id) {
            Some(entry) => {
                if entry.ops.send(make(reply)).await.is_err() {
                    // Worker died between lookup and send; the entry will
                    // be reaped by its final update.
                    warn!(container_id = %id, "container worker unreachable");
                }
            }
            None => {
                let _ = reply.send(Err(OpError::NotFound));
            }
        }
    }

    async fn handle_update(&mut self, update: ContainerUpdate) {
        match update {
            ContainerUpdate::Instance(instance) => {
                let id = instance.id.clone();
                let deleted = instance.status == ContainerStatus::Deleted;

                if deleted {
                    self.containers.remove(&id);
                } else {
                    match self.containers.get_mut(&id) {
                        Some(entry) => entry.instance = Some(instance.clone()),
                        None => return, // update raced a removal
                    }
                }

                let delta = StateEvent {
                    resources: self.resources(),
                    instances: BTreeMap::from([(id, instance)]),
                };
                self.sinks.publish(RegistryEvent::Delta(delta)).await;
            }
            ContainerUpdate::RegistrationFailed { id } => {
                self.containers.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockBehavior, MockRuntime};
    use convoy_types::container::{Command, ResourceLimits, RestartPolicy, Storage};
    use convoy_types::ContainerProcessState;
    use std::time::Duration;

    fn test_config() -> ContainerConfig {
        ContainerConfig {
            artifact_url: "https://a.example.com/x.tar".to_string(),
            ports: BTreeMap::new(),
            env: BTreeMap::new(),
            command: Command {
                work_dir: "/".to_string(),
                argv: vec!["/bin/x".to_string()],
            },
            resources: ResourceLimits {
                memory_mb: 64,
                cpus: 0.5,
                fd_limit: 64,
            },
            storage: Storage::default(),
            startup_grace_secs: 1,
            shutdown_grace_secs: 1,
            restart: RestartPolicy::No,
        }
    }

    fn base_resources() -> HostResources {
        HostResources {
            memory_total_mb: 1024,
            cpus_total: 4.0,
            memory_reserved_mb: 0,
            cpus_reserved: 0.0,
            volumes: Default::default(),
        }
    }

    fn registry() -> (RegistryHandle, Arc<MockRuntime>) {
        let runtime = Arc::new(MockRuntime::new());
        let handle = RegistryHandle::spawn(
            Arc::clone(&runtime),
            SupervisorSettings::default(),
            base_resources(),
        );
        (handle, runtime)
    }

    async fn wait_for_status(
        registry: &RegistryHandle,
        id: &str,
        wanted: ContainerStatus,
    ) -> ContainerInstance {
        for _ in 0..200 {
            if let Some(instance) = registry.get(id).await {
                if instance.status == wanted {
                    return instance;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("container {id} never reached {wanted:?}");
    }

    #[tokio::test]
    async fn test_register_creates_container() {
        let (registry, _) = registry();
        registry.register("c-1", test_config()).await.unwrap();

        let instance = registry.get("c-1").await.unwrap();
        assert_eq!(instance.status, ContainerStatus::Created);
    }

    #[tokio::test]
    async fn test_register_twice_conflicts() {
        let (registry, _) = registry();
        registry.register("c-1", test_config()).await.unwrap();
        assert_eq!(
            registry.register("c-1", test_config()).await,
            Err(OpError::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (registry, _) = registry();
        registry.register("c-1", test_config()).await.unwrap();

        registry.start("c-1").await.unwrap();
        wait_for_status(&registry, "c-1", ContainerStatus::Running).await;

        registry.stop("c-1").await.unwrap();
        wait_for_status(&registry, "c-1", ContainerStatus::Finished).await;

        registry.destroy("c-1").await.unwrap();
        assert!(registry.get("c-1").await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_running_conflicts() {
        let (registry, _) = registry();
        registry.register("c-1", test_config()).await.unwrap();
        registry.start("c-1").await.unwrap();
        wait_for_status(&registry, "c-1", ContainerStatus::Running).await;

        assert_eq!(registry.destroy("c-1").await, Err(OpError::NotDown));
    }

    #[tokio::test]
    async fn test_unknown_ops_not_found() {
        let (registry, _) = registry();
        assert_eq!(registry.start("missing").await, Err(OpError::NotFound));
        assert_eq!(registry.stop("missing").await, Err(OpError::NotFound));
        assert_eq!(registry.destroy("missing").await, Err(OpError::NotFound));
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_forcedown() {
        let (registry, _) = registry();
        let want = registry
            .heartbeat(Heartbeat {
                id: "orphan".to_string(),
                state: ContainerProcessState::up(),
            })
            .await;
        assert_eq!(want, WantState::ForceDown);
    }

    #[tokio::test]
    async fn test_heartbeat_known_container() {
        let (registry, _) = registry();
        registry.register("c-1", test_config()).await.unwrap();
        registry.start("c-1").await.unwrap();
        wait_for_status(&registry, "c-1", ContainerStatus::Running).await;

        let want = registry
            .heartbeat(Heartbeat {
                id: "c-1".to_string(),
                state: ContainerProcessState::up(),
            })
            .await;
        assert_eq!(want, WantState::Up);
    }

    #[tokio::test]
    async fn test_resources_track_reservations() {
        let (registry, _) = registry();
        let before = registry.snapshot().await.resources;
        assert_eq!(before.memory_reserved_mb, 0);

        registry.register("c-1", test_config()).await.unwrap();
        let after = registry.snapshot().await.resources;
        assert_eq!(after.memory_reserved_mb, 64);
        assert!((after.cpus_reserved - 0.5).abs() < 1e-9);

        registry.destroy("c-1").await.unwrap();
        let released = registry.snapshot().await.resources;
        assert_eq!(released.memory_reserved_mb, 0);
    }

    #[tokio::test]
    async fn test_subscribers_get_snapshot_then_deltas() {
        let (registry, _) = registry();
        let (tx, mut rx) = mpsc::channel(64);
        registry.notify(tx).await;

        match rx.recv().await.unwrap() {
            RegistryEvent::Snapshot(snapshot) => assert!(snapshot.instances.is_empty()),
            other => panic!("expected snapshot, got {other:?}"),
        }

        registry.register("c-1", test_config()).await.unwrap();
        match rx.recv().await.unwrap() {
            RegistryEvent::Delta(delta) => {
                assert_eq!(delta.instances.len(), 1);
                assert_eq!(
                    delta.instances["c-1"].status,
                    ContainerStatus::Created
                );
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deleted_emitted_once_on_destroy() {
        let (registry, runtime) = registry();
        registry.register("c-1", test_config()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        registry.notify(tx).await;
        rx.recv().await; // snapshot

        registry.destroy("c-1").await.unwrap();

        let mut deleted_count = 0;
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = rx.try_recv() {
            if let RegistryEvent::Delta(delta) = event {
                for instance in delta.instances.values() {
                    if instance.status == ContainerStatus::Deleted {
                        deleted_count += 1;
                    }
                }
            }
        }
        assert_eq!(deleted_count, 1);
        assert_eq!(runtime.destroyed().await, vec!["c-1".to_string()]);
    }

    #[tokio::test]
    async fn test_registration_failure_leaves_nothing() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.script("c-1", MockBehavior::FailCreate).await;
        let registry = RegistryHandle::spawn(
            Arc::clone(&runtime),
            SupervisorSettings::default(),
            base_resources(),
        );

        let result = registry.register("c-1", test_config()).await;
        assert!(matches!(result, Err(OpError::Internal(_))));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.get("c-1").await.is_none());

        // The id is free again after the failed creation.
        runtime.script("c-1", MockBehavior::Serve).await;
        registry.register("c-1", test_config()).await.unwrap();
    }
}
