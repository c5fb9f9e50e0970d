//! Declared unit of container execution.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Archive suffixes the artifact fetcher understands.
pub const ARTIFACT_SUFFIXES: &[&str] = &[".tar.gz", ".tar.bz2", ".tgz", ".tar"];

/// What to run and how, declared by the operator and carried unchanged
/// from the scheduler down to the agent supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Where to fetch the rootfs archive from.
    pub artifact_url: String,

    /// Named ports: name -> requested port, 0 means auto-assign.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,

    /// Environment variables handed to the container process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Entry point.
    pub command: Command,

    /// Resource limits enforced per container.
    pub resources: ResourceLimits,

    /// Volume and tmpfs mounts.
    #[serde(default)]
    pub storage: Storage,

    /// Time the container gets to come up before it counts as stuck.
    pub startup_grace_secs: u64,

    /// Time between graceful terminate and force kill on stop.
    pub shutdown_grace_secs: u64,

    /// What to do when the container process exits.
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl ContainerConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Validate ranges. Rejected configs never enter the system.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !artifact_url_supported(&self.artifact_url) {
            return Err(ValidationError::BadArtifactUrl(self.artifact_url.clone()));
        }
        if self.command.argv.is_empty() {
            return Err(ValidationError::EmptyArgv);
        }
        if self.resources.memory_mb == 0 {
            return Err(ValidationError::ZeroMemory);
        }
        if self.resources.cpus <= 0.0 {
            return Err(ValidationError::ZeroCpus);
        }
        for (which, secs) in [
            ("startup", self.startup_grace_secs),
            ("shutdown", self.shutdown_grace_secs),
        ] {
            if !(1..=30).contains(&secs) {
                return Err(ValidationError::GraceOutOfRange { which, secs });
            }
        }
        Ok(())
    }
}

fn artifact_url_supported(url: &str) -> bool {
    (url.starts_with("http://") || url.starts_with("https://"))
        && ARTIFACT_SUFFIXES.iter().any(|s| url.ends_with(s))
}

/// Working directory and argv of the container entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub work_dir: String,
    pub argv: Vec<String>,
}

/// Per-container resource limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    /// Fractional CPUs, e.g. 0.5.
    pub cpus: f64,
    #[serde(default)]
    pub fd_limit: u64,
}

/// Volume and tmpfs mounts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Storage {
    /// Named host volume -> mount path inside the container.
    ///
    /// Names must come from the host-configured volume set; the
    /// scheduler only places onto agents that offer them.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,

    /// Mount path -> tmpfs size.
    #[serde(default)]
    pub tmpfs: BTreeMap<String, TmpfsSize>,
}

/// Tmpfs size. Only unlimited mounts are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TmpfsSize {
    Unlimited,
}

/// Restart policy for a container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart on exit.
    #[default]
    No,
    /// Restart only on non-zero exit, signal, or OOM.
    OnFailure,
    /// Restart on any exit.
    Always,
}
