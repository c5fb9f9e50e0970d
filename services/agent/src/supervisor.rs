//! Per-container supervisor.
//!
//! One worker task per container drives the container process: it starts
//! the process exactly when told, observes its lifetime through the
//! control channel, broadcasts every state change, answers stop with
//! graceful-then-forceful shutdown, and enforces the restart policy.
//!
//! ## State machine (per process attempt)
//!
//! ```text
//! initial -> creating -> {created, destroyed}
//! created -> starting -> running -> stopping -> {stopped, finished, failed}
//! failed | finished -> restart-wait -> starting     (policy permitting)
//! any terminal state -> destroyed                   (on exit)
//! ```
//!
//! All externally-visible mutations happen on the single worker; reads
//! traverse it via snapshot messages.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use convoy_broadcast::SinkSet;
use convoy_types::{
    ContainerConfig, ContainerMetrics, ContainerProcessState, ControlCommand, ExitInfo, WantState,
};

use crate::runtime::{ProcessEvent, ProcessHandle, ProcessRuntime, RuntimeError};

/// Grace for a killed process to actually die before the supervisor
/// synthesizes the exit.
const KILL_BACKSTOP: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The executable environment could not be produced. Not retried.
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("create failed: {0}")]
    Create(String),

    #[error("container is not down")]
    NotDown,

    #[error("container is already running")]
    AlreadyRunning,

    #[error("container is not running")]
    NotRunning,

    #[error("container is not created yet")]
    NotCreated,

    #[error("supervisor is gone")]
    Gone,
}

impl From<RuntimeError> for SupervisorError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Spawn(msg) => Self::Spawn(msg),
            RuntimeError::Create(msg) => Self::Create(msg),
            RuntimeError::Destroy(msg) => Self::Create(msg),
        }
    }
}

/// Supervisor position in the per-attempt state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Initial,
    Creating,
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Finished,
    Failed,
    RestartWait,
    Destroyed,
}

impl SupervisorState {
    /// Down and not restarting: `exit` is permitted.
    fn is_down(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Stopped | Self::Finished | Self::Failed
        )
    }
}

/// Snapshot pushed to subscribers on every state change.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorUpdate {
    pub state: SupervisorState,
    pub process: ContainerProcessState,
    pub metrics: ContainerMetrics,
    pub last_error: Option<String>,
}

/// Exponential back-off between restart attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Jitter fraction (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before restart attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(16) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Agent-wide supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Control/heartbeat silence after which a running container counts
    /// as failed.
    pub no_update_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            no_update_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

enum SupervisorMessage {
    Create {
        reply: oneshot::Sender<Result<BTreeMap<String, u16>, SupervisorError>>,
    },
    Start {
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Exit {
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Heartbeat {
        state: ContainerProcessState,
        reply: oneshot::Sender<WantState>,
    },
    Subscribe {
        sink: mpsc::Sender<SupervisorUpdate>,
    },
    Unsubscribe {
        sink: mpsc::Sender<SupervisorUpdate>,
    },
    Snapshot {
        reply: oneshot::Sender<SupervisorUpdate>,
    },
}

/// Handle to one container's supervisor worker.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorMessage>,
    quit: watch::Sender<bool>,
}

impl SupervisorHandle {
    /// Spawn a supervisor for a fresh container.
    pub fn spawn<R: ProcessRuntime>(
        id: String,
        config: ContainerConfig,
        runtime: Arc<R>,
        settings: SupervisorSettings,
    ) -> Self {
        Self::spawn_in_state(id, config, runtime, settings, SupervisorState::Initial)
    }

    /// Spawn a supervisor for a container recovered from a rundir record.
    ///
    /// The old process is assumed dead; the container starts out `Failed`
    /// and can be started again or destroyed.
    pub fn spawn_recovered<R: ProcessRuntime>(
        id: String,
        config: ContainerConfig,
        runtime: Arc<R>,
        settings: SupervisorSettings,
    ) -> Self {
        Self::spawn_in_state(id, config, runtime, settings, SupervisorState::Failed)
    }

    fn spawn_in_state<R: ProcessRuntime>(
        id: String,
        config: ContainerConfig,
        runtime: Arc<R>,
        settings: SupervisorSettings,
        state: SupervisorState,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let (quit, quit_rx) = watch::channel(false);
        let memory_limit_bytes = config.resources.memory_mb * 1024 * 1024;

        let worker = Worker {
            id,
            config,
            runtime,
            settings,
            state,
            process: ContainerProcessState::default(),
            metrics: ContainerMetrics {
                memory_limit_bytes,
                ..Default::default()
            },
            last_error: None,
            sinks: SinkSet::new("supervisor"),
            proc: None,
            deadline: None,
            backoff_attempts: 0,
            mailbox: rx,
            quit: quit_rx,
        };
        tokio::spawn(worker.run());

        Self { tx, quit }
    }

    pub async fn create(&self) -> Result<BTreeMap<String, u16>, SupervisorError> {
        self.request(|reply| SupervisorMessage::Create { reply })
            .await?
    }

    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorMessage::Start { reply })
            .await?
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorMessage::Stop { reply })
            .await?
    }

    /// Destroy a down container, releasing its resources.
    pub async fn exit(&self) -> Result<(), SupervisorError> {
        self.request(|reply| SupervisorMessage::Exit { reply })
            .await?
    }

    pub async fn heartbeat(
        &self,
        state: ContainerProcessState,
    ) -> Result<WantState, SupervisorError> {
        self.request(|reply| SupervisorMessage::Heartbeat { state, reply })
            .await
    }

    pub async fn subscribe(&self, sink: mpsc::Sender<SupervisorUpdate>) {
        let _ = self.tx.send(SupervisorMessage::Subscribe { sink }).await;
    }

    pub async fn unsubscribe(&self, sink: mpsc::Sender<SupervisorUpdate>) {
        let _ = self.tx.send(SupervisorMessage::Unsubscribe { sink }).await;
    }

    pub async fn snapshot(&self) -> Result<SupervisorUpdate, SupervisorError> {
        self.request(|reply| SupervisorMessage::Snapshot { reply })
            .await
    }

    /// Tell the worker to drain and exit.
    pub fn quit(&self) {
        let _ = self.quit.send(true);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SupervisorMessage,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::Gone)?;
        rx.await.map_err(|_| SupervisorError::Gone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    /// Startup grace exceeded while starting.
    Startup,
    /// Control silence exceeded while running.
    NoUpdate,
    /// Shutdown grace exceeded while stopping; force kill.
    Kill,
    /// Back-off elapsed; restart.
    Restart,
    /// Kill was sent but no exit arrived; synthesize one.
    Backstop,
}

struct Worker<R: ProcessRuntime> {
    id: String,
    config: ContainerConfig,
    runtime: Arc<R>,
    settings: SupervisorSettings,

    state: SupervisorState,
    process: ContainerProcessState,
    metrics: ContainerMetrics,
    last_error: Option<String>,
    sinks: SinkSet<SupervisorUpdate>,

    proc: Option<ProcessHandle>,
    deadline: Option<(Instant, DeadlineKind)>,
    backoff_attempts: u32,

    mailbox: mpsc::Receiver<SupervisorMessage>,
    quit: watch::Receiver<bool>,
}

async fn recv_event(proc: &mut Option<ProcessHandle>) -> Option<ProcessEvent> {
    match proc {
        Some(handle) => handle.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<(Instant, DeadlineKind)>) -> DeadlineKind {
    match deadline {
        Some((at, kind)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

impl<R: ProcessRuntime> Worker<R> {
    async fn run(mut self) {
        debug!(container_id = %self.id, "supervisor started");

        loop {
            let deadline = self.deadline;
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

                event = recv_event(&mut self.proc) => {
                    match event {
                        Some(event) => self.handle_process_event(event).await,
                        None => {
                            // Driver went away without an exit event.
                            self.proc = None;
                            self.finish_attempt(
                                ExitInfo { exit_status: -1, ..Default::default() },
                                true,
                            )
                            .await;
                        }
                    }
                }

                kind = wait_deadline(deadline) => {
                    self.handle_deadline(kind).await;
                }
            }

            if self.state == SupervisorState::Destroyed {
                break;
            }
        }

        debug!(container_id = %self.id, state = ?self.state, "supervisor stopped");
    }

    fn update(&self) -> SupervisorUpdate {
        SupervisorUpdate {
            state: self.state,
            process: self.process,
            metrics: self.metrics,
            last_error: self.last_error.clone(),
        }
    }

    async fn publish(&mut self) {
        let update = self.update();
        self.sinks.publish(update).await;
    }

    async fn handle_message(&mut self, msg: SupervisorMessage) {
        match msg {
            SupervisorMessage::Create { reply } => {
                let _ = reply.send(self.handle_create().await);
            }
            SupervisorMessage::Start { reply } => {
                let _ = reply.send(self.handle_start().await);
            }
            SupervisorMessage::Stop { reply } => {
                let _ = reply.send(self.handle_stop().await);
            }
            SupervisorMessage::Exit { reply } => {
                let _ = reply.send(self.handle_exit().await);
            }
            SupervisorMessage::Heartbeat { state, reply } => {
                let want = match self.state {
                    SupervisorState::Initial
                    | SupervisorState::Creating
                    | SupervisorState::Created
                    | SupervisorState::Starting
                    | SupervisorState::Running => WantState::Up,
                    _ => WantState::Down,
                };
                let _ = reply.send(want);
                self.ingest_state(state).await;
            }
            SupervisorMessage::Subscribe { sink } => {
                let _ = sink.send(self.update()).await;
                self.sinks.add(sink);
            }
            SupervisorMessage::Unsubscribe { sink } => {
                self.sinks.remove(&sink);
            }
            SupervisorMessage::Snapshot { reply } => {
                let _ = reply.send(self.update());
            }
        }
    }

    async fn handle_create(&mut self) -> Result<BTreeMap<String, u16>, SupervisorError> {
        if self.state != SupervisorState::Initial {
            return Err(SupervisorError::AlreadyRunning);
        }

        self.state = SupervisorState::Creating;
        self.publish().await;

        match self.runtime.create(&self.id, &self.config).await {
            Ok(ports) => {
                info!(container_id = %self.id, "container created");
                self.state = SupervisorState::Created;
                self.publish().await;
                Ok(ports)
            }
            Err(e) => {
                warn!(container_id = %self.id, error = %e, "create failed");
                self.last_error = Some(e.to_string());
                self.state = SupervisorState::Destroyed;
                self.publish().await;
                Err(e.into())
            }
        }
    }

    async fn handle_start(&mut self) -> Result<(), SupervisorError> {
        match self.state {
            SupervisorState::Created
            | SupervisorState::Stopped
            | SupervisorState::Finished
            | SupervisorState::Failed => self.begin_attempt().await,
            SupervisorState::Starting | SupervisorState::Running | SupervisorState::Stopping => {
                Err(SupervisorError::AlreadyRunning)
            }
            SupervisorState::RestartWait => Err(SupervisorError::AlreadyRunning),
            SupervisorState::Initial | SupervisorState::Creating => {
                Err(SupervisorError::NotCreated)
            }
            SupervisorState::Destroyed => Err(SupervisorError::Gone),
        }
    }

    async fn handle_stop(&mut self) -> Result<(), SupervisorError> {
        match self.state {
            SupervisorState::Starting | SupervisorState::Running => {
                self.send_command(ControlCommand::Stop).await;
                self.state = SupervisorState::Stopping;
                self.deadline = Some((
                    Instant::now() + self.config.shutdown_grace(),
                    DeadlineKind::Kill,
                ));
                self.publish().await;
                Ok(())
            }
            SupervisorState::RestartWait => {
                // Cancels the pending restart.
                self.deadline = None;
                self.state = SupervisorState::Stopped;
                self.publish().await;
                Ok(())
            }
            SupervisorState::Stopping => Ok(()),
            SupervisorState::Destroyed => Err(SupervisorError::Gone),
            _ => Err(SupervisorError::NotRunning),
        }
    }

    async fn handle_exit(&mut self) -> Result<(), SupervisorError> {
        if !self.state.is_down() {
            return Err(SupervisorError::NotDown);
        }

        // Release container-side resources if anything is still attached.
        self.send_command(ControlCommand::Exit).await;
        self.proc = None;

        if let Err(e) = self.runtime.destroy(&self.id).await {
            warn!(container_id = %self.id, error = %e, "destroy failed");
            return Err(e.into());
        }

        info!(container_id = %self.id, "container destroyed");
        self.state = SupervisorState::Destroyed;
        self.publish().await;
        Ok(())
    }

    async fn begin_attempt(&mut self) -> Result<(), SupervisorError> {
        match self.runtime.spawn(&self.id, &self.config).await {
            Ok(handle) => {
                self.proc = Some(handle);
                self.process = ContainerProcessState::default();
                self.state = SupervisorState::Starting;
                self.last_error = None;
                self.deadline = Some((
                    Instant::now() + self.config.startup_grace(),
                    DeadlineKind::Startup,
                ));
                self.publish().await;
                Ok(())
            }
            Err(e) => {
                // SpawnError is not retried, policy or not.
                warn!(container_id = %self.id, error = %e, "spawn failed");
                self.last_error = Some(e.to_string());
                self.state = SupervisorState::Failed;
                self.deadline = None;
                self.publish().await;
                Err(e.into())
            }
        }
    }

    async fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Attached => {
                debug!(container_id = %self.id, "control socket attached");
            }
            ProcessEvent::State(state) => {
                self.ingest_state(state).await;
            }
            ProcessEvent::AttachFailed(exit) => {
                self.last_error =
                    Some("control endpoint never became reachable".to_string());
                self.proc = None;
                self.finish_attempt(exit, true).await;
            }
            ProcessEvent::Exited(exit) => {
                self.proc = None;
                self.finish_attempt(exit, false).await;
            }
        }
    }

    async fn ingest_state(&mut self, state: ContainerProcessState) {
        let oomed = self.process.oomed || state.oomed;
        self.process = state;
        self.process.oomed = oomed;

        self.metrics.cpu_ns = state.cpu_ns.max(self.metrics.cpu_ns);
        self.metrics.memory_used_bytes = state.memory_bytes;

        match self.state {
            SupervisorState::Starting if state.up => {
                info!(container_id = %self.id, "container up");
                self.state = SupervisorState::Running;
                self.deadline = Some((
                    Instant::now() + self.settings.no_update_timeout,
                    DeadlineKind::NoUpdate,
                ));
                self.backoff_attempts = 0;
            }
            SupervisorState::Running => {
                // Any update refreshes the heartbeat contract.
                self.deadline = Some((
                    Instant::now() + self.settings.no_update_timeout,
                    DeadlineKind::NoUpdate,
                ));
            }
            _ => {}
        }

        self.publish().await;
    }

    async fn handle_deadline(&mut self, kind: DeadlineKind) {
        match kind {
            DeadlineKind::Startup => {
                warn!(container_id = %self.id, "startup grace exceeded");
                self.last_error = Some("startup grace exceeded".to_string());
                self.send_command(ControlCommand::Kill).await;
                self.deadline = Some((Instant::now() + KILL_BACKSTOP, DeadlineKind::Backstop));
            }
            DeadlineKind::NoUpdate => {
                warn!(container_id = %self.id, "no update from container");
                self.last_error = Some("no update from container".to_string());
                self.send_command(ControlCommand::Kill).await;
                self.deadline = Some((Instant::now() + KILL_BACKSTOP, DeadlineKind::Backstop));
            }
            DeadlineKind::Kill => {
                info!(container_id = %self.id, "shutdown grace exceeded, killing");
                self.metrics.force_kills += 1;
                self.send_command(ControlCommand::Kill).await;
                self.deadline = Some((Instant::now() + KILL_BACKSTOP, DeadlineKind::Backstop));
            }
            DeadlineKind::Backstop => {
                warn!(container_id = %self.id, "kill produced no exit, synthesizing");
                self.proc = None;
                self.finish_attempt(
                    ExitInfo {
                        exit_status: -1,
                        signaled: true,
                        signal: 9,
                        oomed: false,
                    },
                    true,
                )
                .await;
            }
            DeadlineKind::Restart => {
                if self.state == SupervisorState::RestartWait {
                    let _ = self.begin_attempt().await;
                }
            }
        }
    }

    /// Route one finished process attempt to its terminal state, then to
    /// `restart-wait` when the policy says so.
    async fn finish_attempt(&mut self, mut exit: ExitInfo, forced_failure: bool) {
        use convoy_types::RestartPolicy;

        self.deadline = None;
        if self.process.oomed {
            exit.oomed = true;
        }
        if exit.oomed {
            self.metrics.oom_kills += 1;
        }
        self.metrics.exit = Some(exit);
        self.process = ContainerProcessState {
            exited: true,
            exit_status: exit.exit_status,
            signaled: exit.signaled,
            signal: exit.signal,
            oomed: exit.oomed,
            cpu_ns: self.metrics.cpu_ns,
            memory_bytes: 0,
            up: false,
        };

        let stopping = self.state == SupervisorState::Stopping;
        let clean = exit.is_clean() && !forced_failure;

        self.state = if stopping {
            SupervisorState::Stopped
        } else if clean {
            SupervisorState::Finished
        } else {
            SupervisorState::Failed
        };
        self.publish().await;

        if stopping {
            return;
        }

        let restart = match self.config.restart {
            RestartPolicy::No => false,
            RestartPolicy::OnFailure => !clean,
            RestartPolicy::Always => true,
        };

        if restart {
            let delay = self.settings.backoff.delay(self.backoff_attempts);
            self.backoff_attempts += 1;
            self.metrics.restarts += 1;
            info!(
                container_id = %self.id,
                delay_ms = delay.as_millis(),
                restarts = self.metrics.restarts,
                "scheduling restart"
            );
            self.state = SupervisorState::RestartWait;
            self.deadline = Some((Instant::now() + delay, DeadlineKind::Restart));
            self.publish().await;
        }
    }

    async fn send_command(&mut self, cmd: ControlCommand) {
        if let Some(proc) = &self.proc {
            let _ = proc.commands.send(cmd).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
