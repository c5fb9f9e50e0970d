//! Job registry: the desired state.
//!
//! Owns the map of job-config hash to [`JobConfig`] and its backing
//! file. Every mutation is persisted before it is visible: the full map
//! is serialized to a temp file in the target's directory, fsynced, and
//! atomically renamed over the target. An I/O failure aborts the
//! mutation and leaves the in-memory map unchanged. The full desired set
//! is broadcast after every mutation.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use convoy_broadcast::{Broadcast, SinkSet};
use convoy_types::{JobConfig, JobHash};

/// The desired set: hash -> job.
pub type DesiredSet = BTreeMap<JobHash, JobConfig>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job is already scheduled")]
    AlreadyScheduled,

    #[error("job is not scheduled")]
    NotScheduled,

    #[error("registry persistence failed: {0}")]
    Io(String),

    #[error("registry is gone")]
    Gone,
}

enum RegistryMessage {
    Schedule {
        config: JobConfig,
        reply: oneshot::Sender<Result<JobHash, RegistryError>>,
    },
    Unschedule {
        hash: JobHash,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Subscribe {
        sink: mpsc::Sender<DesiredSet>,
    },
    Unsubscribe {
        sink: mpsc::Sender<DesiredSet>,
    },
    Snapshot {
        reply: oneshot::Sender<DesiredSet>,
    },
}

/// Handle to the job registry worker.
#[derive(Clone)]
pub struct JobRegistryHandle {
    tx: mpsc::Sender<RegistryMessage>,
}

impl JobRegistryHandle {
    /// Load the registry file (if present) and spawn the worker.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let jobs = load(&path).await?;
        if !jobs.is_empty() {
            info!(path = %path.display(), jobs = jobs.len(), "loaded job registry");
        }

        let (tx, rx) = mpsc::channel(32);
        let worker = Worker {
            path,
            jobs,
            sinks: SinkSet::new("job-registry"),
            mailbox: rx,
        };
        tokio::spawn(worker.run());

        Ok(Self { tx })
    }

    /// Add a job. Fails with `AlreadyScheduled` when its hash is present.
    pub async fn schedule(&self, config: JobConfig) -> Result<JobHash, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryMessage::Schedule { config, reply })
            .await
            .map_err(|_| RegistryError::Gone)?;
        rx.await.map_err(|_| RegistryError::Gone)?
    }

    /// Remove a job by hash.
    pub async fn unschedule(&self, hash: JobHash) -> Result<(), RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryMessage::Unschedule { hash, reply })
            .await
            .map_err(|_| RegistryError::Gone)?;
        rx.await.map_err(|_| RegistryError::Gone)?
    }
}

#[async_trait]
impl Broadcast<DesiredSet> for JobRegistryHandle {
    async fn subscribe(&self, sink: mpsc::Sender<DesiredSet>) {
        let _ = self.tx.send(RegistryMessage::Subscribe { sink }).await;
    }

    async fn unsubscribe(&self, sink: mpsc::Sender<DesiredSet>) {
        let _ = self.tx.send(RegistryMessage::Unsubscribe { sink }).await;
    }

    async fn snapshot(&self) -> DesiredSet {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RegistryMessage::Snapshot { reply })
            .await
            .is_err()
        {
            return DesiredSet::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct Worker {
    path: PathBuf,
    jobs: DesiredSet,
    sinks: SinkSet<DesiredSet>,
    mailbox: mpsc::Receiver<RegistryMessage>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                RegistryMessage::Schedule { config, reply } => {
                    let _ = reply.send(self.handle_schedule(config).await);
                    self.sinks.publish(self.jobs.clone()).await;
                }
                RegistryMessage::Unschedule { hash, reply } => {
                    let _ = reply.send(self.handle_unschedule(hash).await);
                    self.sinks.publish(self.jobs.clone()).await;
                }
                RegistryMessage::Subscribe { sink } => {
                    let _ = sink.send(self.jobs.clone()).await;
                    self.sinks.add(sink);
                }
                RegistryMessage::Unsubscribe { sink } => {
                    self.sinks.remove(&sink);
                }
                RegistryMessage::Snapshot { reply } => {
                    let _ = reply.send(self.jobs.clone());
                }
            }
        }
    }

    async fn handle_schedule(&mut self, config: JobConfig) -> Result<JobHash, RegistryError> {
        let hash = config.hash();
        if self.jobs.contains_key(&hash) {
            return Err(RegistryError::AlreadyScheduled);
        }

        let mut next = self.jobs.clone();
        next.insert(hash.clone(), config.clone());
        persist(&self.path, &next).await?;

        info!(job = %config.job, job_hash = %hash, scale = config.scale, "job scheduled");
        self.jobs = next;
        Ok(hash)
    }

    async fn handle_unschedule(&mut self, hash: JobHash) -> Result<(), RegistryError> {
        if !self.jobs.contains_key(&hash) {
            return Err(RegistryError::NotScheduled);
        }

        let mut next = self.jobs.clone();
        next.remove(&hash);
        persist(&self.path, &next).await?;

        info!(job_hash = %hash, "job unscheduled");
        self.jobs = next;
        Ok(())
    }
}

async fn load(path: &Path) -> Result<DesiredSet, RegistryError> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map_err(|e| RegistryError::Io(format!("corrupt registry file: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DesiredSet::new()),
        Err(e) => Err(RegistryError::Io(e.to_string())),
    }
}

/// Temp file in the target's directory, write, fsync, atomic rename.
async fn persist(path: &Path, jobs: &DesiredSet) -> Result<(), RegistryError> {
    let path = path.to_path_buf();
    let jobs = jobs.clone();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&jobs)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &path)?;
        Ok(())
    })
    .await;

    match result {
        Ok(Ok(())) => {
            debug!("job registry persisted");
            Ok(())
        }
        Ok(Err(e)) => {
            warn!(error = %e, "job registry persistence failed");
            Err(RegistryError::Io(e.to_string()))
        }
        Err(e) => Err(RegistryError::Io(e.to_string())),
    }
}
