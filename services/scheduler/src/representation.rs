//! Agent representation.
//!
//! One representation per remote agent keeps a live, best-effort model of
//! that agent. Two cooperating loops do the work:
//!
//! - the **connection loop** owns the event-stream connection: it pumps
//!   frames into the request loop, signals interruption on loss, and
//!   retries on a fixed interval;
//! - the **request loop** is the single serialization point for all state:
//!   frames, schedule/unschedule commands, outstanding-op outcomes, and
//!   the abandon timer all mutate the model here and nowhere else.
//!
//! Commands are reflected in the model (FSM step plus pending entry)
//! before the call returns. Outcomes observed on the event stream resolve
//! pending entries; a pending entry that sees neither outcome nor timeout
//! before `abandon-timeout` is dropped with the rest of the agent's state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use convoy_broadcast::{Broadcast, SinkSet};
use convoy_types::{ContainerConfig, ContainerInstance, ContainerStatus, HostResources, StateEvent};

use crate::client::{AgentApi, AgentFrame, ClientError};
use crate::fsm::{self, Step, TrackedState, Transition};
use crate::metrics::SchedulerCounters;

/// Attempts to destroy a stopping container before giving up on the
/// command and leaving resolution to the pending-op timeout.
const DESTROY_RETRIES: u32 = 50;
const DESTROY_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepresentationError {
    /// Not connected to the agent right now.
    #[error("connection to agent interrupted")]
    ConnectionInterrupted,

    /// A command for this container id is still outstanding.
    #[error("transaction pending for this container")]
    TransactionPending,

    #[error("representation is gone")]
    Gone,
}

/// Kind of an outstanding command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Schedule,
    Unschedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpOutcome {
    Success,
    Failure,
}

/// Timing knobs for a representation.
#[derive(Debug, Clone)]
pub struct RepresentationSettings {
    pub reconnect_interval: Duration,
    pub abandon_timeout: Duration,
    pub pending_op_timeout: Duration,
}

impl Default for RepresentationSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(2),
            abandon_timeout: Duration::from_secs(60),
            pending_op_timeout: Duration::from_secs(15),
        }
    }
}

enum RepMessage {
    Schedule {
        id: String,
        config: ContainerConfig,
        reply: oneshot::Sender<Result<(), RepresentationError>>,
    },
    Unschedule {
        id: String,
        reply: oneshot::Sender<Result<(), RepresentationError>>,
    },
    Subscribe {
        sink: mpsc::Sender<StateEvent>,
    },
    Unsubscribe {
        sink: mpsc::Sender<StateEvent>,
    },
    Snapshot {
        reply: oneshot::Sender<StateEvent>,
    },
    Frame(AgentFrame),
    Interrupted,
    Outcome {
        id: String,
        outcome: OpOutcome,
    },
    AbandonFired {
        epoch: u64,
    },
}

/// Handle to one agent's representation.
#[derive(Clone)]
pub struct RepresentationHandle {
    tx: mpsc::Sender<RepMessage>,
    quit: watch::Sender<bool>,
}

impl RepresentationHandle {
    /// Spawn the request loop and connection loop for one agent.
    pub fn spawn(
        endpoint: String,
        client: Arc<dyn AgentApi>,
        settings: RepresentationSettings,
        counters: Arc<SchedulerCounters>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(128);
        let (quit, quit_rx) = watch::channel(false);

        let worker = Worker {
            endpoint: endpoint.clone(),
            client: Arc::clone(&client),
            settings: settings.clone(),
            counters,
            connected: false,
            ever_connected: false,
            resources: HostResources::default(),
            tracked: BTreeMap::new(),
            pending: HashMap::new(),
            sinks: SinkSet::new("representation"),
            last_published: None,
            abandon_epoch: 0,
            abandon_armed: false,
            self_tx: tx.clone(),
            mailbox: rx,
            quit: quit_rx.clone(),
        };
        tokio::spawn(worker.run());
        tokio::spawn(connection_loop(
            endpoint,
            client,
            settings.reconnect_interval,
            tx.clone(),
            quit_rx,
        ));

        Self { tx, quit }
    }

    /// Issue create+start for `id` on the remote and record a
    /// pending-schedule.
    pub async fn schedule(
        &self,
        id: &str,
        config: ContainerConfig,
    ) -> Result<(), RepresentationError> {
        self.request(|reply| RepMessage::Schedule {
            id: id.to_string(),
            config,
            reply,
        })
        .await?
    }

    /// Issue stop+destroy for `id` on the remote and record a
    /// pending-unschedule.
    pub async fn unschedule(&self, id: &str) -> Result<(), RepresentationError> {
        self.request(|reply| RepMessage::Unschedule {
            id: id.to_string(),
            reply,
        })
        .await?
    }

    /// Stop both loops.
    pub fn quit(&self) {
        let _ = self.quit.send(true);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RepMessage,
    ) -> Result<T, RepresentationError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RepresentationError::Gone)?;
        rx.await.map_err(|_| RepresentationError::Gone)
    }
}

#[async_trait]
impl Broadcast<StateEvent> for RepresentationHandle {
    async fn subscribe(&self, sink: mpsc::Sender<StateEvent>) {
        let _ = self.tx.send(RepMessage::Subscribe { sink }).await;
    }

    async fn unsubscribe(&self, sink: mpsc::Sender<StateEvent>) {
        let _ = self.tx.send(RepMessage::Unsubscribe { sink }).await;
    }

    async fn snapshot(&self) -> StateEvent {
        self.request(|reply| RepMessage::Snapshot { reply })
            .await
            .unwrap_or_default()
    }
}

// =============================================================================
// Connection loop
// =============================================================================

async fn connection_loop(
    endpoint: String,
    client: Arc<dyn AgentApi>,
    reconnect_interval: Duration,
    tx: mpsc::Sender<RepMessage>,
    mut quit: watch::Receiver<bool>,
) {
    use futures_util::StreamExt;

    loop {
        match client.open_events(&endpoint).await {
            Ok(mut stream) => {
                debug!(endpoint = %endpoint, "event stream connected");
                loop {
                    tokio::select! {
                        _ = quit.changed() => {
                            if *quit.borrow() {
                                return;
                            }
                        }
                        frame = stream.next() => match frame {
                            Some(frame) => {
                                if tx.send(RepMessage::Frame(frame)).await.is_err() {
                                    return;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "event stream connect failed");
            }
        }

        if tx.send(RepMessage::Interrupted).await.is_err() {
            return;
        }

        tokio::select! {
            _ = quit.changed() => {
                if *quit.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(reconnect_interval) => {}
        }
    }
}

// =============================================================================
// Request loop
// =============================================================================

struct Tracked {
    state: TrackedState,
    /// Most recent instance seen for this id, if any.
    instance: Option<ContainerInstance>,
}

struct PendingEntry {
    kind: OpKind,
    /// Fires the waiter's success signal; dropping it cancels silently.
    matched: Option<oneshot::Sender<()>>,
}

struct Worker {
    endpoint: String,
    client: Arc<dyn AgentApi>,
    settings: RepresentationSettings,
    counters: Arc<SchedulerCounters>,

    connected: bool,
    ever_connected: bool,
    resources: HostResources,
    tracked: BTreeMap<String, Tracked>,
    pending: HashMap<String, PendingEntry>,
    sinks: SinkSet<StateEvent>,
    last_published: Option<StateEvent>,

    abandon_epoch: u64,
    abandon_armed: bool,

    self_tx: mpsc::Sender<RepMessage>,
    mailbox: mpsc::Receiver<RepMessage>,
    quit: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(endpoint = %self.endpoint, "representation started");

        loop {
            tokio::select! {
                biased;

                _ = self.quit.changed() => {
                    if *self.quit.borrow() {
                        break;
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

        debug!(endpoint = %self.endpoint, "representation stopped");
    }

    fn state_event(&self) -> StateEvent {
        StateEvent {
            resources: self.resources.clone(),
            instances: self
                .tracked
                .iter()
                .filter_map(|(id, t)| t.instance.clone().map(|i| (id.clone(), i)))
                .collect(),
        }
    }

    async fn publish_if_changed(&mut self) {
        let event = self.state_event();
        if self.last_published.as_ref() != Some(&event) {
            self.last_published = Some(event.clone());
            self.sinks.publish(event).await;
        }
    }

    async fn handle_message(&mut self, msg: RepMessage) {
        match msg {
            RepMessage::Schedule { id, config, reply } => {
                let _ = reply.send(self.handle_schedule(id, config));
                self.publish_if_changed().await;
            }
            RepMessage::Unschedule { id, reply } => {
                let _ = reply.send(self.handle_unschedule(id));
                self.publish_if_changed().await;
            }
            RepMessage::Subscribe { sink } => {
                // No push before the first remote snapshot: subscribers
                // (the proxy) treat the first delivery as this agent's
                // baseline.
                if self.ever_connected {
                    let _ = sink.send(self.state_event()).await;
                }
                self.sinks.add(sink);
            }
            RepMessage::Unsubscribe { sink } => {
                self.sinks.remove(&sink);
            }
            RepMessage::Snapshot { reply } => {
                let _ = reply.send(self.state_event());
            }
            RepMessage::Frame(frame) => {
                match frame {
                    AgentFrame::Snapshot(event) => self.ingest_snapshot(event),
                    AgentFrame::Delta(event) => self.ingest_delta(event),
                }
                self.publish_if_changed().await;
            }
            RepMessage::Interrupted => {
                self.handle_interrupted();
            }
            RepMessage::Outcome { id, outcome } => {
                self.handle_outcome(id, outcome);
                self.publish_if_changed().await;
            }
            RepMessage::AbandonFired { epoch } => {
                self.handle_abandon(epoch).await;
            }
        }
    }

    fn handle_schedule(
        &mut self,
        id: String,
        config: ContainerConfig,
    ) -> Result<(), RepresentationError> {
        if !self.connected {
            return Err(RepresentationError::ConnectionInterrupted);
        }
        if self.pending.contains_key(&id) {
            return Err(RepresentationError::TransactionPending);
        }

        debug!(endpoint = %self.endpoint, container_id = %id, "scheduling container");
        self.apply(&id, Transition::Schedule, None);
        self.record_pending(id.clone(), OpKind::Schedule);
        self.issue_schedule(id, config);
        Ok(())
    }

    fn handle_unschedule(&mut self, id: String) -> Result<(), RepresentationError> {
        if !self.connected {
            return Err(RepresentationError::ConnectionInterrupted);
        }
        if self.pending.contains_key(&id) {
            return Err(RepresentationError::TransactionPending);
        }

        debug!(endpoint = %self.endpoint, container_id = %id, "unscheduling container");
        self.apply(&id, Transition::Unschedule, None);
        self.record_pending(id.clone(), OpKind::Unschedule);
        self.issue_unschedule(id);
        Ok(())
    }

    fn record_pending(&mut self, id: String, kind: OpKind) {
        let (matched_tx, matched_rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingEntry {
                kind,
                matched: Some(matched_tx),
            },
        );

        // Per-op waiter: success exactly once when the expected status
        // arrives, failure exactly once on the pending-op timeout.
        let tx = self.self_tx.clone();
        let timeout = self.settings.pending_op_timeout;
        tokio::spawn(async move {
            tokio::select! {
                matched = matched_rx => {
                    if matched.is_ok() {
                        let _ = tx.send(RepMessage::Outcome { id, outcome: OpOutcome::Success }).await;
                    }
                    // Err: entry was dropped (abandon); stay silent.
                }
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(RepMessage::Outcome { id, outcome: OpOutcome::Failure }).await;
                }
            }
        });
    }

    fn issue_schedule(&self, id: String, config: ContainerConfig) {
        let client = Arc::clone(&self.client);
        let endpoint = self.endpoint.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = async {
                match client.create_container(&endpoint, &id, &config).await {
                    // Already exists: a previous create landed; proceed to start.
                    Ok(()) | Err(ClientError::Conflict) => {}
                    Err(e) => return Err(e),
                }
                match client.start_container(&endpoint, &id).await {
                    Ok(()) | Err(ClientError::Conflict) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            .await;

            if let Err(e) = result {
                warn!(endpoint = %endpoint, container_id = %id, error = %e, "schedule command failed");
                let _ = tx
                    .send(RepMessage::Outcome {
                        id,
                        outcome: OpOutcome::Failure,
                    })
                    .await;
            }
        });
    }

    fn issue_unschedule(&self, id: String) {
        let client = Arc::clone(&self.client);
        let endpoint = self.endpoint.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = async {
                match client.stop_container(&endpoint, &id).await {
                    Ok(()) | Err(ClientError::Conflict) | Err(ClientError::NotFound) => {}
                    Err(e) => return Err(e),
                }
                // The stop takes effect asynchronously; retry the destroy
                // while the container is still coming down.
                let mut attempts = 0;
                loop {
                    match client.destroy_container(&endpoint, &id).await {
                        Ok(()) | Err(ClientError::NotFound) => return Ok(()),
                        Err(ClientError::Conflict) if attempts < DESTROY_RETRIES => {
                            attempts += 1;
                            tokio::time::sleep(DESTROY_RETRY_INTERVAL).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            .await;

            if let Err(e) = result {
                warn!(endpoint = %endpoint, container_id = %id, error = %e, "unschedule command failed");
                let _ = tx
                    .send(RepMessage::Outcome {
                        id,
                        outcome: OpOutcome::Failure,
                    })
                    .await;
            }
        });
    }

    /// First frame after a (re)connect: reset connection state and make
    /// the model match the agent wholesale.
    fn ingest_snapshot(&mut self, event: StateEvent) {
        if !self.connected {
            info!(endpoint = %self.endpoint, instances = event.instances.len(), "agent connected");
        }
        self.connected = true;
        self.ever_connected = true;
        self.abandon_armed = false;
        self.abandon_epoch += 1;
        self.resources = event.resources;

        let gone: Vec<String> = self
            .tracked
            .keys()
            .filter(|id| !event.instances.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            self.match_pending(&id, ContainerStatus::Deleted);
            self.apply(&id, Transition::Deleted, None);
        }

        for (id, instance) in event.instances {
            self.match_pending(&id, instance.status);
            self.apply(&id, fsm::transition_for(instance.status), Some(instance));
        }
    }

    fn ingest_delta(&mut self, event: StateEvent) {
        self.resources = event.resources;
        for (id, instance) in event.instances {
            self.match_pending(&id, instance.status);
            self.apply(&id, fsm::transition_for(instance.status), Some(instance));
        }
    }

    fn apply(&mut self, id: &str, transition: Transition, instance: Option<ContainerInstance>) {
        let current = self.tracked.get(id).map(|t| t.state);
        match fsm::step(current, transition) {
            Step::Goto(next) => {
                let entry = self.tracked.entry(id.to_string()).or_insert(Tracked {
                    state: next,
                    instance: None,
                });
                entry.state = next;
                if let Some(instance) = instance {
                    entry.instance = Some(instance);
                }
            }
            Step::Remove => {
                self.tracked.remove(id);
            }
            Step::Ignore => {}
        }
    }

    fn match_pending(&mut self, id: &str, status: ContainerStatus) {
        let Some(entry) = self.pending.get_mut(id) else {
            return;
        };
        let matched = match entry.kind {
            OpKind::Schedule => status.is_supervised(),
            OpKind::Unschedule => status == ContainerStatus::Deleted,
        };
        if matched {
            if let Some(tx) = entry.matched.take() {
                let _ = tx.send(());
            }
        }
    }

    fn handle_outcome(&mut self, id: String, outcome: OpOutcome) {
        let Some(_entry) = self.pending.remove(&id) else {
            return; // already resolved or abandoned
        };

        match outcome {
            OpOutcome::Success => {
                debug!(endpoint = %self.endpoint, container_id = %id, "pending op resolved");
                SchedulerCounters::bump(&self.counters.ops_resolved);
            }
            OpOutcome::Failure => {
                warn!(endpoint = %self.endpoint, container_id = %id, "pending op failed");
                SchedulerCounters::bump(&self.counters.ops_failed);
                // Reset the visible state to what it was.
                self.apply(&id, Transition::Timeout, None);
            }
        }
    }

    fn handle_interrupted(&mut self) {
        if self.connected {
            warn!(endpoint = %self.endpoint, "agent connection interrupted");
        }
        self.connected = false;

        if !self.abandon_armed {
            self.abandon_armed = true;
            let epoch = self.abandon_epoch;
            let tx = self.self_tx.clone();
            let timeout = self.settings.abandon_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(RepMessage::AbandonFired { epoch }).await;
            });
        }
    }

    /// The agent stayed unreachable past the abandon timeout: its
    /// containers are declared lost and the reconciler will re-place them.
    async fn handle_abandon(&mut self, epoch: u64) {
        if !self.abandon_armed || self.connected || epoch != self.abandon_epoch {
            return; // reconnected in the meantime
        }

        warn!(
            endpoint = %self.endpoint,
            containers = self.tracked.len(),
            pending = self.pending.len(),
            "abandoning agent"
        );

        // Pending outcomes are unknown, not failed.
        for _ in self.pending.drain() {
            SchedulerCounters::bump(&self.counters.ops_abandoned);
        }

        self.tracked.clear();
        self.resources = HostResources::default();
        self.abandon_armed = false;
        self.publish_if_changed().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
