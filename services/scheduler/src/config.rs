//! Configuration for the scheduler.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::placement::PlacementPolicy;

/// Scheduler configuration, loaded from `CONVOY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API listen address.
    pub listen_addr: SocketAddr,

    /// Path of the job registry file.
    pub registry_path: String,

    /// Agent endpoints (`host:port`), the static discovery source.
    pub agents: Vec<String>,

    /// Delay between event-stream reconnect attempts.
    pub reconnect_interval: Duration,

    /// Disconnection time after which an agent's containers are declared
    /// lost.
    pub abandon_timeout: Duration,

    /// Per-command timeout in the outstanding-op tracker.
    pub pending_op_timeout: Duration,

    /// Deadline after which a reconciler pending op may be re-issued.
    pub tolerance: Duration,

    /// Periodic transform tick.
    pub transform_interval: Duration,

    /// Startup deadline for the proxy baseline and reconciler seeds.
    pub init_timeout: Duration,

    /// Placement policy, system-wide.
    pub placement_policy: PlacementPolicy,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CONVOY_SCHED_LISTEN")
            .unwrap_or_else(|_| "127.0.0.1:7000".to_string())
            .parse()
            .context("CONVOY_SCHED_LISTEN is not a socket address")?;

        let registry_path = std::env::var("CONVOY_REGISTRY_PATH")
            .unwrap_or_else(|_| "/var/lib/convoy/registry.json".to_string());

        let agents: Vec<String> = std::env::var("CONVOY_AGENTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if agents.is_empty() {
            bail!("CONVOY_AGENTS must list at least one agent endpoint");
        }

        let placement_policy = std::env::var("CONVOY_PLACEMENT_POLICY")
            .unwrap_or_else(|_| "random-fit".to_string())
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        Ok(Self {
            listen_addr,
            registry_path,
            agents,
            reconnect_interval: env_secs("CONVOY_RECONNECT_INTERVAL", 2),
            abandon_timeout: env_secs("CONVOY_ABANDON_TIMEOUT", 60),
            pending_op_timeout: env_secs("CONVOY_PENDING_OP_TIMEOUT", 15),
            tolerance: env_secs("CONVOY_TOLERANCE", 30),
            transform_interval: env_secs("CONVOY_TRANSFORM_INTERVAL", 5),
            init_timeout: env_secs("CONVOY_INIT_TIMEOUT", 30),
            placement_policy,
            log_level: std::env::var("CONVOY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}
