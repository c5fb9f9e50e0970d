//! Observed unit of execution on one agent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::container::ContainerConfig;
use crate::resources::HostResources;

/// Lifecycle status of a container, agent-side authoritative.
///
/// `Created` is left exactly once and never re-entered; `Running` may be
/// re-entered after a restart. `Deleted` is a meta-status emitted exactly
/// once when the container is destroyed and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Reserved and artifact fetched, not yet running.
    Created,
    /// Supervisor reports the process up.
    Running,
    /// Exited with zero, no restart pending.
    Finished,
    /// Exited non-zero, killed, or OOMed, no restart pending.
    Failed,
    /// Destroyed. Emitted once, never stored.
    Deleted,
}

impl ContainerStatus {
    /// Whether this status means the container is under supervision and
    /// counts toward a job's target scale.
    pub fn is_supervised(&self) -> bool {
        matches!(self, Self::Running | Self::Finished | Self::Failed)
    }
}

/// How the last process attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitInfo {
    pub exit_status: i32,
    pub signaled: bool,
    pub signal: i32,
    pub oomed: bool,
}

impl ExitInfo {
    /// Zero exit, not signaled, not OOMed.
    pub fn is_clean(&self) -> bool {
        self.exit_status == 0 && !self.signaled && !self.oomed
    }
}

/// Runtime metrics accumulated across restarts of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub restarts: u64,
    pub oom_kills: u64,
    pub force_kills: u64,
    pub cpu_ns: u64,
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
}

/// One observed container on one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInstance {
    /// Globally unique, client-assigned id. The scheduler uses
    /// `<job-hash>-<ordinal>`, but the agent treats it as opaque.
    pub id: String,
    pub config: ContainerConfig,
    pub status: ContainerStatus,
    #[serde(default)]
    pub metrics: ContainerMetrics,
}

impl ContainerInstance {
    pub fn new(id: impl Into<String>, config: ContainerConfig) -> Self {
        let memory_limit_bytes = config.resources.memory_mb * 1024 * 1024;
        Self {
            id: id.into(),
            config,
            status: ContainerStatus::Created,
            metrics: ContainerMetrics {
                memory_limit_bytes,
                ..Default::default()
            },
        }
    }
}

/// One agent's full observable state: resources plus its instances.
///
/// This is the snapshot broadcast by agent representations and merged by
/// the proxy; it is also the initial frame of the agent's event stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateEvent {
    pub resources: HostResources,
    pub instances: BTreeMap<String, ContainerInstance>,
}
