//! Container process runtime interface and implementations.
//!
//! The runtime abstracts everything below the supervisor:
//!
//! - `create`: reserve the rundir, fetch the artifact, allocate ports
//! - `spawn`: start the prepared process and dial its control socket
//! - `destroy`: release everything `create` reserved
//!
//! [`HostRuntime`] spawns real processes; [`MockRuntime`] scripts
//! container behavior for tests and development.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use convoy_types::{
    ContainerConfig, ContainerProcessState, ControlCommand, ExitInfo, Frame, FrameDecoder,
    STATE_EVENT,
};

use crate::artifact::ArtifactStore;
use crate::logring::{LogRouter, LogStream};
use crate::ports::PortAllocator;
use crate::rundir::{InstanceRecord, RunDir};

/// How often the attach loop re-dials the control socket.
const DIAL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The executable environment could not be produced. Not retried.
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("create failed: {0}")]
    Create(String),

    #[error("destroy failed: {0}")]
    Destroy(String),
}

/// Events surfaced by one process attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The control socket was dialed successfully.
    Attached,
    /// A state frame arrived from the container.
    State(ContainerProcessState),
    /// The process died before the control endpoint became reachable.
    AttachFailed(ExitInfo),
    /// The process was reaped. Terminal for the attempt.
    Exited(ExitInfo),
}

/// A live process attempt.
///
/// Dropping the handle detaches from (but does not kill) the process;
/// send [`ControlCommand::Kill`] for that.
pub struct ProcessHandle {
    pub events: mpsc::Receiver<ProcessEvent>,
    pub commands: mpsc::Sender<ControlCommand>,
}

/// Everything below the supervisor.
#[async_trait]
pub trait ProcessRuntime: Send + Sync + 'static {
    /// Reserve the rundir, fetch the artifact, allocate ports.
    /// Returns the resolved named ports.
    async fn create(
        &self,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<BTreeMap<String, u16>, RuntimeError>;

    /// Spawn the prepared container process and begin the control dial.
    async fn spawn(&self, id: &str, config: &ContainerConfig)
        -> Result<ProcessHandle, RuntimeError>;

    /// Release everything `create` reserved.
    async fn destroy(&self, id: &str) -> Result<(), RuntimeError>;
}

// =============================================================================
// Host Runtime
// =============================================================================

/// The real runtime: artifact cache, rundirs, port allocation, process
/// spawning, and the unix-domain control channel.
pub struct HostRuntime {
    run_root: PathBuf,
    artifacts: ArtifactStore,
    ports: PortAllocator,
    logs: LogRouter,
}

impl HostRuntime {
    pub fn new(
        run_root: impl Into<PathBuf>,
        artifacts: ArtifactStore,
        ports: PortAllocator,
        logs: LogRouter,
    ) -> Self {
        Self {
            run_root: run_root.into(),
            artifacts,
            ports,
            logs,
        }
    }
}

#[async_trait]
impl ProcessRuntime for HostRuntime {
    async fn create(
        &self,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<BTreeMap<String, u16>, RuntimeError> {
        let rootfs = self
            .artifacts
            .ensure(&config.artifact_url)
            .await
            .map_err(|e| RuntimeError::Create(e.to_string()))?;

        let ports = self
            .ports
            .allocate(config.ports.clone())
            .await
            .map_err(|e| RuntimeError::Create(e.to_string()))?;

        let record = InstanceRecord {
            id: id.to_string(),
            config: config.clone(),
            ports: ports.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = RunDir::prepare(&self.run_root, &record, &rootfs).await {
            self.ports.release(ports.values().copied().collect()).await;
            return Err(RuntimeError::Create(e.to_string()));
        }

        Ok(ports)
    }

    async fn spawn(
        &self,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<ProcessHandle, RuntimeError> {
        let dir = RunDir::open(&self.run_root, id);
        let record = dir
            .read_record()
            .await
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;

        let rootfs = dir.rootfs();
        let program = rootfs.join(config.command.argv[0].trim_start_matches('/'));
        let work_dir = rootfs.join(config.command.work_dir.trim_start_matches('/'));

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&config.command.argv[1..])
            .current_dir(if work_dir.is_dir() { &work_dir } else { &rootfs })
            .envs(&config.env)
            .env("CONVOY_CONTAINER_ID", id)
            .env("CONVOY_CONTROL_SOCKET", dir.control_socket())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        for (name, port) in &record.ports {
            command.env(format!("PORT_{}", name.to_uppercase()), port.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {e}", program.display())))?;

        info!(container_id = %id, program = %program.display(), pid = ?child.id(), "spawned container process");

        // Stdout/stderr capture into the log ring.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(
                self.logs.clone(),
                id.to_string(),
                LogStream::Stdout,
                stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(
                self.logs.clone(),
                id.to_string(),
                LogStream::Stderr,
                stderr,
            ));
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        tokio::spawn(drive_process(
            id.to_string(),
            child,
            dir.control_socket(),
            events_tx,
            commands_rx,
        ));

        Ok(ProcessHandle {
            events: events_rx,
            commands: commands_tx,
        })
    }

    async fn destroy(&self, id: &str) -> Result<(), RuntimeError> {
        let dir = RunDir::open(&self.run_root, id);
        if let Ok(record) = dir.read_record().await {
            self.ports
                .release(record.ports.values().copied().collect())
                .await;
        }
        dir.remove()
            .await
            .map_err(|e| RuntimeError::Destroy(e.to_string()))?;
        self.logs.remove(id).await;
        Ok(())
    }
}

async fn pump_lines<R: tokio::io::AsyncRead + Unpin>(
    logs: LogRouter,
    id: String,
    stream: LogStream,
    reader: R,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logs.push(&id, stream, line).await;
    }
}

/// Drive one spawned process: dial the control socket (bounded by early
/// exit), then shuttle state frames up and commands down until the
/// process is reaped.
async fn drive_process(
    id: String,
    mut child: tokio::process::Child,
    socket: PathBuf,
    events: mpsc::Sender<ProcessEvent>,
    mut commands: mpsc::Receiver<ControlCommand>,
) {
    // Attach phase: retry the dial until it succeeds or the child dies.
    let stream = loop {
        tokio::select! {
            status = child.wait() => {
                let exit = exit_info(status.ok());
                debug!(container_id = %id, "process died before control attach");
                let _ = events.send(ProcessEvent::AttachFailed(exit)).await;
                return;
            }
            _ = tokio::time::sleep(DIAL_INTERVAL) => {
                match tokio::net::UnixStream::connect(&socket).await {
                    Ok(stream) => break stream,
                    Err(_) => continue,
                }
            }
            // A kill during attach must still land.
            cmd = commands.recv() => match cmd {
                Some(ControlCommand::Kill) => {
                    let _ = child.start_kill();
                }
                Some(_) => {}
                None => {
                    // Supervisor is gone; reap and bail.
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return;
                }
            }
        }
    };

    let _ = events.send(ProcessEvent::Attached).await;
    let (read_half, mut write_half) = stream.into_split();

    // Reader: state frames -> events.
    let reader_events = events.clone();
    let reader_id = id.clone();
    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for frame in decoder.feed(&buf[..n]) {
                if frame.event != STATE_EVENT {
                    continue;
                }
                match serde_json::from_str::<ContainerProcessState>(&frame.data) {
                    Ok(state) => {
                        if reader_events
                            .send(ProcessEvent::State(state))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(container_id = %reader_id, error = %e, "bad state frame");
                    }
                }
            }
        }
    });

    // Main: commands down, reap the child.
    loop {
        tokio::select! {
            status = child.wait() => {
                let exit = exit_info(status.ok());
                info!(
                    container_id = %id,
                    exit_status = exit.exit_status,
                    signaled = exit.signaled,
                    "process exited"
                );
                let _ = events.send(ProcessEvent::Exited(exit)).await;
                break;
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => {
                        let frame = Frame::new(cmd.event_name(), "{}");
                        let _ = write_half.write_all(frame.encode().as_bytes()).await;
                        if cmd == ControlCommand::Kill {
                            let _ = child.start_kill();
                        }
                    }
                    None => {
                        // Supervisor dropped us; keep waiting for the exit.
                        let status = child.wait().await.ok();
                        let _ = events.send(ProcessEvent::Exited(exit_info(status))).await;
                        break;
                    }
                }
            }
        }
    }

    reader.abort();
}

fn exit_info(status: Option<std::process::ExitStatus>) -> ExitInfo {
    let Some(status) = status else {
        return ExitInfo {
            exit_status: -1,
            ..Default::default()
        };
    };

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitInfo {
                exit_status: -1,
                signaled: true,
                signal,
                oomed: false,
            };
        }
    }

    ExitInfo {
        exit_status: status.code().unwrap_or(-1),
        ..Default::default()
    }
}

// =============================================================================
// Mock Runtime
// =============================================================================

/// Scripted container behavior for tests and development.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Attach, report up, serve until stopped; exit 0 on stop.
    Serve,
    /// Attach, report up, then exit with the given status.
    ExitWith(i32),
    /// Attach, report up, then die of an OOM kill.
    OomAfterUp,
    /// Attach, report up, ignore graceful stop; only a kill lands.
    IgnoreStop,
    /// Fail the spawn itself.
    FailSpawn,
    /// Fail creation (artifact fetch, rundir).
    FailCreate,
    /// Die before the control socket comes up.
    DieBeforeAttach,
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    default_behavior: MockBehavior,
    behaviors: Mutex<BTreeMap<String, MockBehavior>>,
    next_port: AtomicU16,
    destroyed: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::Serve)
    }

    pub fn with_behavior(default_behavior: MockBehavior) -> Self {
        Self {
            default_behavior,
            behaviors: Mutex::new(BTreeMap::new()),
            next_port: AtomicU16::new(30000),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    /// Script a specific container's behavior.
    pub async fn script(&self, id: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .await
            .insert(id.to_string(), behavior);
    }

    /// Ids destroyed so far.
    pub async fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().await.clone()
    }

    async fn behavior_for(&self, id: &str) -> MockBehavior {
        self.behaviors
            .lock()
            .await
            .get(id)
            .copied()
            .unwrap_or(self.default_behavior)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRuntime for MockRuntime {
    async fn create(
        &self,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<BTreeMap<String, u16>, RuntimeError> {
        if self.behavior_for(id).await == MockBehavior::FailCreate {
            return Err(RuntimeError::Create("mock: artifact unavailable".to_string()));
        }

        let mut ports = BTreeMap::new();
        for (name, requested) in &config.ports {
            let port = if *requested == 0 {
                self.next_port.fetch_add(1, Ordering::SeqCst)
            } else {
                *requested
            };
            ports.insert(name.clone(), port);
        }
        Ok(ports)
    }

    async fn spawn(
        &self,
        id: &str,
        _config: &ContainerConfig,
    ) -> Result<ProcessHandle, RuntimeError> {
        let behavior = self.behavior_for(id).await;
        if behavior == MockBehavior::FailSpawn {
            return Err(RuntimeError::Spawn("mock: no executable".to_string()));
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        tokio::spawn(run_mock_child(behavior, events_tx, commands_rx));

        Ok(ProcessHandle {
            events: events_rx,
            commands: commands_tx,
        })
    }

    async fn destroy(&self, id: &str) -> Result<(), RuntimeError> {
        self.destroyed.lock().await.push(id.to_string());
        Ok(())
    }
}

async fn run_mock_child(
    behavior: MockBehavior,
    events: mpsc::Sender<ProcessEvent>,
    mut commands: mpsc::Receiver<ControlCommand>,
) {
    if behavior == MockBehavior::DieBeforeAttach {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = events
            .send(ProcessEvent::AttachFailed(ExitInfo {
                exit_status: 1,
                ..Default::default()
            }))
            .await;
        return;
    }

    let _ = events.send(ProcessEvent::Attached).await;
    let _ = events
        .send(ProcessEvent::State(ContainerProcessState::up()))
        .await;

    match behavior {
        MockBehavior::ExitWith(status) => {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = events
                .send(ProcessEvent::Exited(ExitInfo {
                    exit_status: status,
                    ..Default::default()
                }))
                .await;
        }
        MockBehavior::OomAfterUp => {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = events
                .send(ProcessEvent::Exited(ExitInfo {
                    exit_status: -1,
                    signaled: true,
                    signal: 9,
                    oomed: true,
                }))
                .await;
        }
        MockBehavior::Serve | MockBehavior::IgnoreStop => loop {
            match commands.recv().await {
                Some(ControlCommand::Stop) if behavior == MockBehavior::Serve => {
                    let _ = events.send(ProcessEvent::Exited(ExitInfo::default())).await;
                    break;
                }
                Some(ControlCommand::Stop) => {
                    // scripted to ignore graceful stop
                }
                Some(ControlCommand::Kill) => {
                    let _ = events
                        .send(ProcessEvent::Exited(ExitInfo {
                            exit_status: -1,
                            signaled: true,
                            signal: 9,
                            oomed: false,
                        }))
                        .await;
                    break;
                }
                Some(ControlCommand::Exit) | None => break,
            }
        },
        MockBehavior::FailSpawn | MockBehavior::FailCreate | MockBehavior::DieBeforeAttach => {
            unreachable!()
        }
    }
}
