//! Per-container rundir layout and recovery records.
//!
//! Every container gets `<run-root>/<id>/` holding:
//!
//! - `agent.json`  — the instance record, written atomically, read back
//!   on agent restart
//! - `rootfs`      — symlink into the artifact cache
//! - `log/`        — stdout/stderr capture location
//! - `control`     — the unix-domain control socket the container listens on

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use convoy_types::ContainerConfig;

#[derive(Debug, Error)]
pub enum RundirError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt agent.json for {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// What the agent persists per container, for restart survival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub config: ContainerConfig,
    /// Resolved named ports.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    pub created_at: DateTime<Utc>,
}

/// One container's rundir.
#[derive(Debug, Clone)]
pub struct RunDir {
    dir: PathBuf,
}

impl RunDir {
    /// Create the rundir, link the rootfs, and persist the record.
    pub async fn prepare(
        run_root: &Path,
        record: &InstanceRecord,
        rootfs_src: &Path,
    ) -> Result<Self, RundirError> {
        let dir = run_root.join(&record.id);
        tokio::fs::create_dir_all(dir.join("log")).await?;

        let rootfs = dir.join("rootfs");
        let _ = tokio::fs::remove_file(&rootfs).await;
        #[cfg(unix)]
        tokio::fs::symlink(rootfs_src, &rootfs).await?;

        let rundir = Self { dir };
        rundir.write_record(record).await?;
        debug!(container_id = %record.id, dir = %rundir.dir.display(), "rundir prepared");
        Ok(rundir)
    }

    pub fn open(run_root: &Path, id: &str) -> Self {
        Self {
            dir: run_root.join(id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn control_socket(&self) -> PathBuf {
        self.dir.join("control")
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join("agent.json")
    }

    /// Write `agent.json` via temp file + rename.
    async fn write_record(&self, record: &InstanceRecord) -> Result<(), RundirError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| RundirError::Corrupt {
                id: record.id.clone(),
                reason: e.to_string(),
            })?;
        let tmp = self.dir.join("agent.json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, self.record_path()).await?;
        Ok(())
    }

    pub async fn read_record(&self) -> Result<InstanceRecord, RundirError> {
        let id = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let raw = tokio::fs::read(self.record_path()).await?;
        serde_json::from_slice(&raw).map_err(|e| RundirError::Corrupt {
            id,
            reason: e.to_string(),
        })
    }

    /// Remove the whole rundir.
    pub async fn remove(&self) -> Result<(), RundirError> {
        tokio::fs::remove_dir_all(&self.dir).await?;
        Ok(())
    }
}

/// Scan the run root for surviving records after an agent restart.
///
/// Unreadable entries are logged and skipped; a half-written rundir must
/// not keep the agent from starting.
pub async fn load_all(run_root: &Path) -> Vec<InstanceRecord> {
    let mut records = Vec::new();
    let mut entries = match tokio::fs::read_dir(run_root).await {
        Ok(entries) => entries,
        Err(_) => return records,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let id = entry.file_name().to_string_lossy().to_string();
        let rundir = RunDir::open(run_root, &id);
        match rundir.read_record().await {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(container_id = %id, error = %e, "skipping unreadable rundir");
            }
        }
    }

    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::container::{Command, ResourceLimits, RestartPolicy, Storage};

    fn record(id: &str) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            config: ContainerConfig {
                artifact_url: "https://a.example.com/x.tar".to_string(),
                ports: BTreeMap::new(),
                env: BTreeMap::new(),
                command: Command {
                    work_dir: "/".to_string(),
                    argv: vec!["/bin/x".to_string()],
                },
                resources: ResourceLimits {
                    memory_mb: 32,
                    cpus: 0.1,
                    fd_limit: 64,
                },
                storage: Storage::default(),
                startup_grace_secs: 1,
                shutdown_grace_secs: 1,
                restart: RestartPolicy::No,
            },
            ports: BTreeMap::from([("http".to_string(), 21001)]),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_prepare_and_read_back() {
        let root = tempfile::tempdir().unwrap();
        let rootfs_src = root.path().join("artifact");
        std::fs::create_dir_all(&rootfs_src).unwrap();

        let rec = record("c-1");
        let rundir = RunDir::prepare(root.path(), &rec, &rootfs_src)
            .await
            .unwrap();

        assert!(rundir.log_dir().is_dir());
        assert!(rundir.rootfs().exists());
        assert_eq!(rundir.read_record().await.unwrap(), rec);
    }

    #[tokio::test]
    async fn test_load_all_skips_corrupt() {
        let root = tempfile::tempdir().unwrap();
        let rootfs_src = root.path().join("artifact");
        std::fs::create_dir_all(&rootfs_src).unwrap();

        RunDir::prepare(root.path(), &record("c-1"), &rootfs_src)
            .await
            .unwrap();

        // A rundir with a garbage record.
        let bad = root.path().join("c-bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("agent.json"), b"{not json").unwrap();

        let records = load_all(root.path()).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "c-1");
    }

    #[tokio::test]
    async fn test_remove() {
        let root = tempfile::tempdir().unwrap();
        let rootfs_src = root.path().join("artifact");
        std::fs::create_dir_all(&rootfs_src).unwrap();

        let rundir = RunDir::prepare(root.path(), &record("c-2"), &rootfs_src)
            .await
            .unwrap();
        rundir.remove().await.unwrap();
        assert!(!rundir.dir().exists());
        assert!(load_all(root.path()).await.is_empty());
    }
}
