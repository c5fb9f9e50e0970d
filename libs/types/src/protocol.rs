//! Heartbeat and control-socket message types.
//!
//! Two channels connect an agent to its container processes:
//!
//! - the HTTP heartbeat (`POST /containers/{id}/heartbeat`), by which the
//!   container reports its process state and learns the agent's desired
//!   status for it;
//! - the unix-domain control socket in the container rundir, over which
//!   the agent pushes `stop`/`kill`/`exit` commands and the container
//!   streams `state` events.

use serde::{Deserialize, Serialize};

/// What the container process reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerProcessState {
    /// Process is up and serving.
    pub up: bool,
    /// Process has exited.
    pub exited: bool,
    pub exit_status: i32,
    pub signaled: bool,
    pub signal: i32,
    pub oomed: bool,
    /// Cumulative metrics since the first start.
    pub cpu_ns: u64,
    pub memory_bytes: u64,
}

impl ContainerProcessState {
    /// A process that came up and is running.
    pub fn up() -> Self {
        Self {
            up: true,
            ..Default::default()
        }
    }

    /// A clean zero exit.
    pub fn exited_ok() -> Self {
        Self {
            exited: true,
            ..Default::default()
        }
    }

    /// A non-zero exit.
    pub fn exited_with(status: i32) -> Self {
        Self {
            exited: true,
            exit_status: status,
            ..Default::default()
        }
    }

    /// Whether this is a failure exit (non-zero, signaled, or OOMed).
    pub fn is_failure(&self) -> bool {
        self.exited && (self.exit_status != 0 || self.signaled || self.oomed)
    }
}

/// Heartbeat from a container process to its agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: String,
    pub state: ContainerProcessState,
}

/// What the agent wants the container to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WantState {
    /// Keep running.
    Up,
    /// Shut down gracefully.
    Down,
    /// Kill yourself immediately; the agent does not know you.
    ForceDown,
}

/// Reply to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub want: WantState,
}

/// Commands the agent pushes down the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    /// Graceful terminate.
    Stop,
    /// Forceful kill after the shutdown grace elapsed.
    Kill,
    /// Release resources and go away; only sent when down.
    Exit,
}

impl ControlCommand {
    /// Event name on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Kill => "kill",
            Self::Exit => "exit",
        }
    }
}

/// Event name for container -> agent state frames.
pub const STATE_EVENT: &str = "state";
