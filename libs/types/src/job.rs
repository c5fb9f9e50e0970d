//! Declared unit of desire.

use serde::{Deserialize, Serialize};

use crate::container::ContainerConfig;
use crate::hash::{task_id, JobHash};
use crate::ValidationError;

/// A declared job: run `scale` identical copies of `container`.
///
/// Identity is content-addressed; see [`JobConfig::hash`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Logical name, for humans and logs only. Part of the hashed content.
    pub job: String,

    /// Target number of task instances (1..=1000).
    pub scale: u32,

    /// The container every task instance runs.
    pub container: ContainerConfig,
}

impl JobConfig {
    /// The job-config hash: unique identifier of this job.
    ///
    /// Computed over the canonical JSON of the whole config, so any edit
    /// produces a distinct hash and therefore a distinct job.
    pub fn hash(&self) -> JobHash {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        JobHash::of_value(&value)
    }

    /// Deterministic ids of this job's task instances:
    /// `<hash>-0` through `<hash>-(scale-1)`.
    pub fn task_ids(&self) -> Vec<String> {
        let hash = self.hash();
        (0..self.scale).map(|i| task_id(&hash, i)).collect()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.job.is_empty() {
            return Err(ValidationError::EmptyJobName);
        }
        if !(1..=1000).contains(&self.scale) {
            return Err(ValidationError::ScaleOutOfRange(self.scale));
        }
        self.container.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Command, ResourceLimits, RestartPolicy, Storage};
    use std::collections::BTreeMap;

    fn test_job(scale: u32) -> JobConfig {
        JobConfig {
            job: "web".to_string(),
            scale,
            container: ContainerConfig {
                artifact_url: "https://artifacts.example.com/web.tar.gz".to_string(),
                ports: BTreeMap::new(),
                env: BTreeMap::new(),
                command: Command {
                    work_dir: "/".to_string(),
                    argv: vec!["/bin/web".to_string()],
                },
                resources: ResourceLimits {
                    memory_mb: 64,
                    cpus: 0.25,
                    fd_limit: 256,
                },
                storage: Storage::default(),
                startup_grace_secs: 3,
                shutdown_grace_secs: 3,
                restart: RestartPolicy::No,
            },
        }
    }

    #[test]
    fn test_hash_stable_across_clones() {
        let job = test_job(2);
        assert_eq!(job.hash(), job.clone().hash());
    }

    #[test]
    fn test_any_edit_changes_identity() {
        let a = test_job(2);
        let mut b = a.clone();
        b.container.env.insert("K".to_string(), "V".to_string());
        assert_ne!(a.hash(), b.hash());

        let mut c = a.clone();
        c.scale = 3;
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_task_ids_cover_scale() {
        let job = test_job(3);
        let hash = job.hash();
        let ids = job.task_ids();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], format!("{hash}-0"));
        assert_eq!(ids[2], format!("{hash}-2"));
    }

    #[test]
    fn test_scale_bounds() {
        assert_eq!(
            test_job(0).validate(),
            Err(ValidationError::ScaleOutOfRange(0))
        );
        assert_eq!(
            test_job(1001).validate(),
            Err(ValidationError::ScaleOutOfRange(1001))
        );
        assert_eq!(test_job(1000).validate(), Ok(()));
    }

    #[test]
    fn test_empty_job_name_rejected() {
        let mut job = test_job(1);
        job.job.clear();
        assert_eq!(job.validate(), Err(ValidationError::EmptyJobName));
    }
}
