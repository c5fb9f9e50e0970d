//! Proxy: the aggregator over all agent representations.
//!
//! The proxy translates the discovery stream into a live set of
//! representations, merges their snapshots into one cluster state, and
//! routes schedule/unschedule commands to the right representation. It
//! is the single read/write surface the reconciler uses.
//!
//! On startup the proxy blocks until every discovered representation has
//! emitted its first remote snapshot, bounded by a global timeout; the
//! reconciler's first iteration therefore sees a complete baseline.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use convoy_broadcast::{Broadcast, SinkSet};
use convoy_types::{ContainerConfig, StateEvent};

use crate::client::AgentApi;
use crate::discovery::Discovery;
use crate::metrics::SchedulerCounters;
use crate::reconciler::{SchedulerTarget, TargetError};
use crate::representation::{RepresentationError, RepresentationHandle, RepresentationSettings};

/// The merged view: endpoint -> that agent's state.
pub type ClusterState = BTreeMap<String, StateEvent>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("unknown agent endpoint")]
    UnknownEndpoint,

    #[error(transparent)]
    Representation(#[from] RepresentationError),

    #[error("proxy is gone")]
    Gone,
}

enum ProxyMessage {
    Discovered(Vec<String>),
    Schedule {
        endpoint: String,
        id: String,
        config: ContainerConfig,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
    Unschedule {
        endpoint: String,
        id: String,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
    Subscribe {
        sink: mpsc::Sender<ClusterState>,
    },
    Unsubscribe {
        sink: mpsc::Sender<ClusterState>,
    },
    Snapshot {
        reply: oneshot::Sender<ClusterState>,
    },
    AwaitReady {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the proxy worker.
#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::Sender<ProxyMessage>,
    quit: watch::Sender<bool>,
}

impl ProxyHandle {
    /// Spawn the proxy and subscribe it to discovery.
    pub fn spawn(
        discovery: Arc<dyn Discovery>,
        client: Arc<dyn AgentApi>,
        settings: RepresentationSettings,
        counters: Arc<SchedulerCounters>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(128);
        let (quit, quit_rx) = watch::channel(false);
        let (updates_tx, updates_rx) = mpsc::channel(128);

        let worker = Worker {
            client,
            settings,
            counters,
            reps: BTreeMap::new(),
            discovered: BTreeSet::new(),
            merged: ClusterState::new(),
            sinks: SinkSet::new("proxy"),
            ready_waiters: Vec::new(),
            updates_tx,
            mailbox: rx,
            updates: updates_rx,
            quit: quit_rx,
        };
        tokio::spawn(worker.run());

        // Bridge discovery into the mailbox.
        let bridge_tx = tx.clone();
        tokio::spawn(async move {
            let (sink, mut rx) = mpsc::channel(8);
            discovery.subscribe(sink).await;
            while let Some(endpoints) = rx.recv().await {
                if bridge_tx
                    .send(ProxyMessage::Discovered(endpoints))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Self { tx, quit }
    }

    /// Block until every discovered agent delivered its baseline.
    /// Exceeding `timeout` is fatal for the caller.
    pub async fn ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ProxyMessage::AwaitReady { reply })
            .await
            .map_err(|_| anyhow::anyhow!("proxy is gone"))?;
        tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| anyhow::anyhow!("agents failed to deliver a baseline within {timeout:?}"))?
            .map_err(|_| anyhow::anyhow!("proxy dropped the readiness request"))?;
        Ok(())
    }

    pub fn quit(&self) {
        let _ = self.quit.send(true);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ProxyMessage,
    ) -> Result<T, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ProxyError::Gone)?;
        rx.await.map_err(|_| ProxyError::Gone)
    }
}

#[async_trait]
impl Broadcast<ClusterState> for ProxyHandle {
    async fn subscribe(&self, sink: mpsc::Sender<ClusterState>) {
        let _ = self.tx.send(ProxyMessage::Subscribe { sink }).await;
    }

    async fn unsubscribe(&self, sink: mpsc::Sender<ClusterState>) {
        let _ = self.tx.send(ProxyMessage::Unsubscribe { sink }).await;
    }

    async fn snapshot(&self) -> ClusterState {
        self.request(|reply| ProxyMessage::Snapshot { reply })
            .await
            .unwrap_or_default()
    }
}

#[async_trait]
impl SchedulerTarget for ProxyHandle {
    async fn schedule(
        &self,
        endpoint: &str,
        id: &str,
        config: ContainerConfig,
    ) -> Result<(), TargetError> {
        self.request(|reply| ProxyMessage::Schedule {
            endpoint: endpoint.to_string(),
            id: id.to_string(),
            config,
            reply,
        })
        .await?
        .map_err(TargetError::from)
    }

    async fn unschedule(&self, endpoint: &str, id: &str) -> Result<(), TargetError> {
        self.request(|reply| ProxyMessage::Unschedule {
            endpoint: endpoint.to_string(),
            id: id.to_string(),
            reply,
        })
        .await?
        .map_err(TargetError::from)
    }
}

impl From<ProxyError> for TargetError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::UnknownEndpoint => TargetError::UnknownEndpoint,
            ProxyError::Representation(RepresentationError::ConnectionInterrupted) => {
                TargetError::Interrupted
            }
            ProxyError::Representation(RepresentationError::TransactionPending) => {
                TargetError::Pending
            }
            ProxyError::Representation(RepresentationError::Gone) | ProxyError::Gone => {
                TargetError::Other("proxy or representation gone".to_string())
            }
        }
    }
}

struct Worker {
    client: Arc<dyn AgentApi>,
    settings: RepresentationSettings,
    counters: Arc<SchedulerCounters>,

    reps: BTreeMap<String, RepresentationHandle>,
    discovered: BTreeSet<String>,
    merged: ClusterState,
    sinks: SinkSet<ClusterState>,
    ready_waiters: Vec<oneshot::Sender<()>>,

    updates_tx: mpsc::Sender<(String, StateEvent)>,
    mailbox: mpsc::Receiver<ProxyMessage>,
    updates: mpsc::Receiver<(String, StateEvent)>,
    quit: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!("proxy started");

        loop {
            tokio::select! {
                biased;

                _ = self.quit.changed() => {
                    if *self.quit.borrow() {
                        break;
                    }
                }

                update = self.updates.recv() => {
                    match update {
                        Some((endpoint, state)) => self.handle_rep_update(endpoint, state).await,
                        None => break,
                    }
                }

                msg = self.mailbox.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => break,
                    }
                }
            }
        }

        for rep in self.reps.values() {
            rep.quit();
        }
        debug!("proxy stopped");
    }

    fn is_ready(&self) -> bool {
        self.discovered
            .iter()
            .all(|endpoint| self.merged.contains_key(endpoint))
    }

    fn drain_ready_waiters(&mut self) {
        if self.is_ready() {
            for waiter in self.ready_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    async fn handle_rep_update(&mut self, endpoint: String, state: StateEvent) {
        if !self.reps.contains_key(&endpoint) {
            return; // straggler from a discarded representation
        }
        self.merged.insert(endpoint, state);
        self.sinks.publish(self.merged.clone()).await;
        self.drain_ready_waiters();
    }

    async fn handle_message(&mut self, msg: ProxyMessage) {
        match msg {
            ProxyMessage::Discovered(endpoints) => {
                self.handle_discovered(endpoints).await;
            }
            ProxyMessage::Schedule {
                endpoint,
                id,
                config,
                reply,
            } => match self.reps.get(&endpoint) {
                Some(rep) => {
                    let rep = rep.clone();
                    tokio::spawn(async move {
                        let result = rep
                            .schedule(&id, config)
                            .await
                            .map_err(ProxyError::Representation);
                        let _ = reply.send(result);
                    });
                }
                None => {
                    let _ = reply.send(Err(ProxyError::UnknownEndpoint));
                }
            },
            ProxyMessage::Unschedule {
                endpoint,
                id,
                reply,
            } => match self.reps.get(&endpoint) {
                Some(rep) => {
                    let rep = rep.clone();
                    tokio::spawn(async move {
                        let result = rep
                            .unschedule(&id)
                            .await
                            .map_err(ProxyError::Representation);
                        let _ = reply.send(result);
                    });
                }
                None => {
                    let _ = reply.send(Err(ProxyError::UnknownEndpoint));
                }
            },
            ProxyMessage::Subscribe { sink } => {
                let _ = sink.send(self.merged.clone()).await;
                self.sinks.add(sink);
            }
            ProxyMessage::Unsubscribe { sink } => {
                self.sinks.remove(&sink);
            }
            ProxyMessage::Snapshot { reply } => {
                let _ = reply.send(self.merged.clone());
            }
            ProxyMessage::AwaitReady { reply } => {
                if self.is_ready() {
                    let _ = reply.send(());
                } else {
                    self.ready_waiters.push(reply);
                }
            }
        }
    }

    async fn handle_discovered(&mut self, endpoints: Vec<String>) {
        let next: BTreeSet<String> = endpoints.into_iter().collect();

        // Quit representations for endpoints no longer present.
        let gone: Vec<String> = self
            .reps
            .keys()
            .filter(|e| !next.contains(*e))
            .cloned()
            .collect();
        for endpoint in gone {
            info!(endpoint = %endpoint, "agent left discovery");
            if let Some(rep) = self.reps.remove(&endpoint) {
                rep.quit();
            }
            self.merged.remove(&endpoint);
            self.sinks.publish(self.merged.clone()).await;
        }

        // Create representations for new endpoints.
        for endpoint in &next {
            if self.reps.contains_key(endpoint) {
                continue;
            }
            info!(endpoint = %endpoint, "agent appeared in discovery");
            let rep = RepresentationHandle::spawn(
                endpoint.clone(),
                Arc::clone(&self.client),
                self.settings.clone(),
                Arc::clone(&self.counters),
            );

            // Forwarder: tag this representation's updates with its
            // endpoint and feed them into our loop.
            let (sink, mut rx) = mpsc::channel::<StateEvent>(32);
            rep.subscribe(sink).await;
            let updates_tx = self.updates_tx.clone();
            let tagged = endpoint.clone();
            tokio::spawn(async move {
                while let Some(state) = rx.recv().await {
                    if updates_tx.send((tagged.clone(), state)).await.is_err() {
                        break;
                    }
                }
            });

            self.reps.insert(endpoint.clone(), rep);
        }

        self.discovered = next;
        if self.discovered.is_empty() {
            warn!("discovery delivered an empty agent set");
        }
        self.drain_ready_waiters();
    }
}
