//! Shared data model for the convoy orchestration platform.
//!
//! Everything that crosses a process boundary lives here: job and
//! container configurations, observed container instances, host
//! resources, the agent/container heartbeat and control protocol, and
//! the content-hash identity scheme.
//!
//! ## Identity
//!
//! Jobs are content-addressed: the [`JobHash`] of a [`JobConfig`] is its
//! identity, and task ids are derived as `<job-hash>-<ordinal>`. Any edit
//! to a job config yields a new hash and therefore a new job.
//!
//! ## Modules
//!
//! - `job`: declared unit of desire ([`JobConfig`])
//! - `container`: declared unit of execution ([`ContainerConfig`])
//! - `instance`: observed unit of execution ([`ContainerInstance`])
//! - `resources`: per-host capacity accounting ([`HostResources`])
//! - `protocol`: heartbeat and control-socket message types
//! - `frame`: event-stream framing shared by SSE and the control socket
//! - `hash`: canonical-JSON content hashing
//! - `fault`: invariant-violation policy (panic in debug, fatal in release)

pub mod container;
pub mod fault;
pub mod frame;
pub mod hash;
pub mod instance;
pub mod job;
pub mod protocol;
pub mod resources;

pub use container::{Command, ContainerConfig, RestartPolicy, ResourceLimits, Storage, TmpfsSize};
pub use frame::{Frame, FrameDecoder};
pub use hash::{task_id, JobHash};
pub use instance::{ContainerInstance, ContainerMetrics, ContainerStatus, ExitInfo, StateEvent};
pub use job::JobConfig;
pub use protocol::{
    ContainerProcessState, ControlCommand, Heartbeat, HeartbeatReply, WantState, STATE_EVENT,
};
pub use resources::HostResources;

/// Validation errors for configs arriving at an API boundary.
///
/// These are rejected before the config enters the system; nothing
/// downstream ever sees an invalid config.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("job name must not be empty")]
    EmptyJobName,

    #[error("scale {0} out of range (1..=1000)")]
    ScaleOutOfRange(u32),

    #[error("artifact url {0:?} is not a supported http(s) archive url")]
    BadArtifactUrl(String),

    #[error("command argv must not be empty")]
    EmptyArgv,

    #[error("memory limit must be greater than zero")]
    ZeroMemory,

    #[error("cpu limit must be greater than zero")]
    ZeroCpus,

    #[error("{which} grace {secs}s out of range (1..=30)")]
    GraceOutOfRange { which: &'static str, secs: u64 },
}
