//! Agent-side container state machine.
//!
//! One worker per container sits between the HTTP API and the
//! supervisor: it serializes API requests against supervisor events,
//! folds supervisor attempt states into the externally-visible
//! [`ContainerStatus`], and emits exactly one instance delta per change
//! to the registry.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use convoy_types::{
    ContainerConfig, ContainerInstance, ContainerProcessState, ContainerStatus, WantState,
};

use crate::runtime::ProcessRuntime;
use crate::supervisor::{
    SupervisorError, SupervisorHandle, SupervisorSettings, SupervisorState, SupervisorUpdate,
};

/// Business-state errors surfaced to the API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpError {
    #[error("container not found")]
    NotFound,

    #[error("container already exists")]
    AlreadyExists,

    #[error("container is already running")]
    AlreadyRunning,

    #[error("container is not running")]
    NotRunning,

    #[error("container is still running")]
    NotDown,

    #[error("{0}")]
    Internal(String),
}

impl From<SupervisorError> for OpError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::AlreadyRunning => Self::AlreadyRunning,
            SupervisorError::NotRunning => Self::NotRunning,
            SupervisorError::NotDown => Self::NotDown,
            SupervisorError::Gone => Self::NotFound,
            SupervisorError::Spawn(_) | SupervisorError::Create(_) | SupervisorError::NotCreated => {
                Self::Internal(e.to_string())
            }
        }
    }
}

/// Requests routed from the registry into one container's worker.
pub enum ContainerOp {
    Start {
        reply: oneshot::Sender<Result<(), OpError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), OpError>>,
    },
    Destroy {
        reply: oneshot::Sender<Result<(), OpError>>,
    },
    Heartbeat {
        state: ContainerProcessState,
        reply: oneshot::Sender<WantState>,
    },
}

/// What a container worker reports up to the registry.
pub enum ContainerUpdate {
    Instance(ContainerInstance),
    /// Creation failed; the container never existed.
    RegistrationFailed { id: String },
}

/// Spawn a container worker for a fresh registration.
///
/// `registered` resolves once the container reached `Created` (or
/// creation failed); the registry hands it the API caller's reply.
pub fn spawn_container<R: ProcessRuntime>(
    id: String,
    config: ContainerConfig,
    runtime: Arc<R>,
    settings: SupervisorSettings,
    ops: mpsc::Receiver<ContainerOp>,
    updates: mpsc::Sender<ContainerUpdate>,
    registered: oneshot::Sender<Result<(), OpError>>,
) {
    tokio::spawn(run(
        id, config, runtime, settings, ops, updates, Some(registered), false,
    ));
}

/// Spawn a container worker for a rundir record found at startup.
pub fn spawn_recovered_container<R: ProcessRuntime>(
    id: String,
    config: ContainerConfig,
    runtime: Arc<R>,
    settings: SupervisorSettings,
    ops: mpsc::Receiver<ContainerOp>,
    updates: mpsc::Sender<ContainerUpdate>,
) {
    tokio::spawn(run(id, config, runtime, settings, ops, updates, None, true));
}

#[allow(clippy::too_many_arguments)]
async fn run<R: ProcessRuntime>(
    id: String,
    config: ContainerConfig,
    runtime: Arc<R>,
    settings: SupervisorSettings,
    mut ops: mpsc::Receiver<ContainerOp>,
    updates: mpsc::Sender<ContainerUpdate>,
    registered: Option<oneshot::Sender<Result<(), OpError>>>,
    recovered: bool,
) {
    let supervisor = if recovered {
        SupervisorHandle::spawn_recovered(id.clone(), config.clone(), runtime, settings)
    } else {
        SupervisorHandle::spawn(id.clone(), config.clone(), runtime, settings)
    };

    let (sup_tx, mut sup_rx) = mpsc::channel(32);
    supervisor.subscribe(sup_tx).await;

    if !recovered {
        match supervisor.create().await {
            Ok(_ports) => {}
            Err(e) => {
                warn!(container_id = %id, error = %e, "container creation failed");
                let _ = updates
                    .send(ContainerUpdate::RegistrationFailed { id: id.clone() })
                    .await;
                if let Some(registered) = registered {
                    let _ = registered.send(Err(e.into()));
                }
                return;
            }
        }
    }

    let mut instance = ContainerInstance::new(id.clone(), config);
    if recovered {
        instance.status = ContainerStatus::Failed;
    }
    let _ = updates
        .send(ContainerUpdate::Instance(instance.clone()))
        .await;
    if let Some(registered) = registered {
        let _ = registered.send(Ok(()));
    }

    loop {
        tokio::select! {
            update = sup_rx.recv() => {
                let Some(update) = update else { break };
                if apply_update(&mut instance, &update) {
                    let deleted = instance.status == ContainerStatus::Deleted;
                    let _ = updates
                        .send(ContainerUpdate::Instance(instance.clone()))
                        .await;
                    if deleted {
                        break;
                    }
                }
            }

            op = ops.recv() => {
                let Some(op) = op else { break };
                match op {
                    ContainerOp::Start { reply } => {
                        let result = supervisor.start().await.map_err(OpError::from);
                        let _ = reply.send(result);
                    }
                    ContainerOp::Stop { reply } => {
                        let result = supervisor.stop().await.map_err(OpError::from);
                        let _ = reply.send(result);
                    }
                    ContainerOp::Destroy { reply } => {
                        match supervisor.exit().await {
                            Ok(()) => {
                                // Emit the Deleted meta-status exactly once,
                                // then this worker is done.
                                instance.status = ContainerStatus::Deleted;
                                let _ = updates
                                    .send(ContainerUpdate::Instance(instance.clone()))
                                    .await;
                                let _ = reply.send(Ok(()));
                                break;
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e.into()));
                            }
                        }
                    }
                    ContainerOp::Heartbeat { state, reply } => {
                        let want = supervisor
                            .heartbeat(state)
                            .await
                            .unwrap_or(WantState::ForceDown);
                        let _ = reply.send(want);
                    }
                }
            }
        }
    }

    supervisor.quit();
    debug!(container_id = %id, "container worker stopped");
}

/// Fold one supervisor update into the instance view. Returns whether the
/// externally-visible instance changed.
fn apply_update(instance: &mut ContainerInstance, update: &SupervisorUpdate) -> bool {
    let next_status = fold_status(instance.status, update);
    let changed = next_status != instance.status || instance.metrics != update.metrics;

    instance.status = next_status;
    instance.metrics = update.metrics;
    changed
}

/// Map a supervisor attempt state onto the instance status.
///
/// `Created` is left exactly once: during later restarts the previous
/// status shows until the process is back up.
fn fold_status(prev: ContainerStatus, update: &SupervisorUpdate) -> ContainerStatus {
    match update.state {
        SupervisorState::Initial | SupervisorState::Creating => prev,
        SupervisorState::Created => ContainerStatus::Created,
        SupervisorState::Starting | SupervisorState::RestartWait => prev,
        SupervisorState::Running | SupervisorState::Stopping => ContainerStatus::Running,
        SupervisorState::Finished => ContainerStatus::Finished,
        SupervisorState::Failed => ContainerStatus::Failed,
        SupervisorState::Stopped => match update.metrics.exit {
            Some(exit) if !exit.is_clean() => ContainerStatus::Failed,
            _ => ContainerStatus::Finished,
        },
        SupervisorState::Destroyed => ContainerStatus::Deleted,
    }
}
