//! convoy agent.
//!
//! Per-host daemon supervising local container processes. Receives
//! container CRUD from the scheduler over HTTP and reports observed
//! state back on the container event stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use convoy_agent::api::{self, AppState};
use convoy_agent::artifact::ArtifactStore;
use convoy_agent::config::Config;
use convoy_agent::logring::LogRouter;
use convoy_agent::ports::PortAllocator;
use convoy_agent::registry::RegistryHandle;
use convoy_agent::runtime::HostRuntime;
use convoy_agent::supervisor::{BackoffPolicy, SupervisorSettings};
use convoy_agent::{resources, rundir};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    info!(
        listen = %config.listen_addr,
        run_root = %config.run_root,
        artifact_root = %config.artifact_root,
        volumes = config.volumes.len(),
        "starting convoy agent"
    );

    tokio::fs::create_dir_all(&config.run_root).await?;
    tokio::fs::create_dir_all(&config.artifact_root).await?;

    let logs = LogRouter::spawn();
    let ports = PortAllocator::spawn(config.port_range);
    let artifacts = ArtifactStore::new(&config.artifact_root);
    let runtime = Arc::new(HostRuntime::new(&config.run_root, artifacts, ports, logs));

    let settings = SupervisorSettings {
        no_update_timeout: config.no_update_timeout,
        backoff: BackoffPolicy {
            base: config.restart_backoff_base,
            max: config.restart_backoff_max,
            ..Default::default()
        },
    };

    let base_resources = resources::measure(&config);
    info!(
        memory_total_mb = base_resources.memory_total_mb,
        cpus_total = base_resources.cpus_total,
        "host resources measured"
    );

    let registry = RegistryHandle::spawn(runtime, settings, base_resources);

    // Re-admit containers that survived in the run root. Their processes
    // are assumed dead; survivors reap themselves via the heartbeat
    // FORCEDOWN path or get restarted by the scheduler.
    let records = rundir::load_all(std::path::Path::new(&config.run_root)).await;
    if !records.is_empty() {
        info!(count = records.len(), "recovering containers from run root");
        for record in records {
            registry.recover(record).await;
        }
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let state = AppState { registry };

    tokio::select! {
        result = api::serve(listener, state) => {
            result.context("api server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    info!("agent shutdown complete");
    Ok(())
}
