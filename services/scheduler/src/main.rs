//! convoy scheduler.
//!
//! Central service: accepts job declarations over HTTP, keeps one
//! representation per discovered agent, and runs the reconciliation loop
//! that converges the cluster onto the declared jobs.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use convoy_scheduler::api::{self, AppState};
use convoy_scheduler::client::HttpAgentClient;
use convoy_scheduler::config::Config;
use convoy_scheduler::discovery::StaticDiscovery;
use convoy_scheduler::metrics::SchedulerCounters;
use convoy_scheduler::proxy::ProxyHandle;
use convoy_scheduler::reconciler::{Reconciler, ReconcilerSettings};
use convoy_scheduler::registry::JobRegistryHandle;
use convoy_scheduler::representation::RepresentationSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    info!(
        listen = %config.listen_addr,
        agents = config.agents.len(),
        registry = %config.registry_path,
        policy = ?config.placement_policy,
        "starting convoy scheduler"
    );

    let counters = Arc::new(SchedulerCounters::default());
    let registry = JobRegistryHandle::open(&config.registry_path)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("opening job registry")?;

    let discovery = Arc::new(StaticDiscovery::new(config.agents.clone()));
    let client = Arc::new(HttpAgentClient::new());
    let proxy = ProxyHandle::spawn(
        discovery,
        client,
        RepresentationSettings {
            reconnect_interval: config.reconnect_interval,
            abandon_timeout: config.abandon_timeout,
            pending_op_timeout: config.pending_op_timeout,
        },
        Arc::clone(&counters),
    );

    // The reconciler's first iteration must see a complete baseline.
    proxy
        .ready(config.init_timeout)
        .await
        .context("waiting for the agent baseline")?;
    info!("agent baseline complete");

    let (quit_tx, quit_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        Arc::new(proxy.clone()),
        ReconcilerSettings {
            tolerance: config.tolerance,
            interval: config.transform_interval,
            seed_timeout: config.init_timeout,
            policy: config.placement_policy,
        },
        Arc::clone(&counters),
    );
    let reconciler_handle = tokio::spawn({
        let registry = registry.clone();
        let proxy = proxy.clone();
        async move {
            reconciler
                .run(Arc::new(registry), Arc::new(proxy), quit_rx)
                .await
        }
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let state = AppState {
        registry,
        proxy: proxy.clone(),
    };

    tokio::select! {
        result = api::serve(listener, state) => {
            result.context("api server exited")?;
        }
        result = reconciler_handle => {
            match result {
                Ok(Ok(())) => info!("reconciler exited"),
                Ok(Err(e)) => {
                    error!(error = %e, "reconciler failed");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "reconciler task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    let _ = quit_tx.send(true);
    proxy.quit();
    info!("scheduler shutdown complete");
    Ok(())
}
