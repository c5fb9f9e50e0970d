//! Configuration for the agent.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Agent configuration, loaded from `CONVOY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API listen address.
    pub listen_addr: SocketAddr,

    /// Root for per-container rundirs.
    pub run_root: String,

    /// Root of the artifact cache.
    pub artifact_root: String,

    /// Named host volumes offered to containers: name -> host path.
    pub volumes: BTreeMap<String, String>,

    /// Port range handed out for auto-assigned container ports.
    pub port_range: (u16, u16),

    /// Heartbeat/control silence after which a running container counts
    /// as failed.
    pub no_update_timeout: Duration,

    /// Base delay of the restart back-off.
    pub restart_backoff_base: Duration,

    /// Cap of the restart back-off.
    pub restart_backoff_max: Duration,

    /// Override for total memory visible to the scheduler, in MB.
    pub memory_total_mb: Option<u64>,

    /// Override for total fractional CPUs visible to the scheduler.
    pub cpus_total: Option<f64>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CONVOY_AGENT_LISTEN")
            .unwrap_or_else(|_| "127.0.0.1:7070".to_string())
            .parse()
            .context("CONVOY_AGENT_LISTEN is not a socket address")?;

        let run_root =
            std::env::var("CONVOY_RUN_ROOT").unwrap_or_else(|_| "/var/lib/convoy/run".to_string());

        let artifact_root = std::env::var("CONVOY_ARTIFACT_ROOT")
            .unwrap_or_else(|_| "/var/lib/convoy/artifacts".to_string());

        let volumes = match std::env::var("CONVOY_VOLUMES") {
            Ok(raw) => parse_volumes(&raw)?,
            Err(_) => BTreeMap::new(),
        };

        let port_range = match std::env::var("CONVOY_PORT_RANGE") {
            Ok(raw) => parse_port_range(&raw)?,
            Err(_) => (20000, 25000),
        };

        let no_update_timeout = Duration::from_secs(env_u64("CONVOY_NO_UPDATE_TIMEOUT", 30));
        let restart_backoff_base =
            Duration::from_millis(env_u64("CONVOY_RESTART_BACKOFF_BASE_MS", 500));
        let restart_backoff_max =
            Duration::from_millis(env_u64("CONVOY_RESTART_BACKOFF_MAX_MS", 30_000));

        let memory_total_mb = std::env::var("CONVOY_MEMORY_TOTAL_MB")
            .ok()
            .and_then(|s| s.parse().ok());
        let cpus_total = std::env::var("CONVOY_CPUS_TOTAL")
            .ok()
            .and_then(|s| s.parse().ok());

        let log_level = std::env::var("CONVOY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            run_root,
            artifact_root,
            volumes,
            port_range,
            no_update_timeout,
            restart_backoff_base,
            restart_backoff_max,
            memory_total_mb,
            cpus_total,
            log_level,
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse `name=path,name=path` volume declarations.
fn parse_volumes(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut volumes = BTreeMap::new();
    for entry in raw.split(',').filter(|e| !e.is_empty()) {
        let Some((name, path)) = entry.split_once('=') else {
            bail!("volume entry {entry:?} is not name=path");
        };
        volumes.insert(name.to_string(), path.to_string());
    }
    Ok(volumes)
}

/// Parse `low-high` port ranges.
fn parse_port_range(raw: &str) -> Result<(u16, u16)> {
    let Some((low, high)) = raw.split_once('-') else {
        bail!("port range {raw:?} is not low-high");
    };
    let low: u16 = low.trim().parse().context("port range low")?;
    let high: u16 = high.trim().parse().context("port range high")?;
    if low > high {
        bail!("port range {raw:?} is inverted");
    }
    Ok((low, high))
}
