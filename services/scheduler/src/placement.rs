//! Scheduling algorithm.
//!
//! First-fit-with-constraints over the cluster view: filter agents by
//! free cpu, free memory, and required named volumes, then pick one by
//! the configured policy. Pending schedules are booked against the
//! cloned resource views first so in-flight capacity is never handed out
//! twice; each placement made during one run is booked the same way so
//! the next id sees it.

use std::collections::BTreeMap;
use std::str::FromStr;

use rand::seq::IteratorRandom;
use tracing::debug;

use convoy_types::{ContainerConfig, HostResources};

use crate::proxy::ClusterState;
use crate::reconciler::{OpKind, PendingMap};

/// System-wide placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    /// Uniformly random over the qualified agents.
    #[default]
    RandomFit,
    /// Fewest placed containers, ties broken by endpoint identity.
    LeastUsed,
}

impl FromStr for PlacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random-fit" => Ok(Self::RandomFit),
            "least-used" => Ok(Self::LeastUsed),
            other => Err(format!("unknown placement policy {other:?}")),
        }
    }
}

/// Output of one placement run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Placement {
    /// endpoint -> id -> config.
    pub placements: BTreeMap<String, BTreeMap<String, ContainerConfig>>,
    /// Tasks no agent can take right now.
    pub failed: BTreeMap<String, ContainerConfig>,
}

struct AgentView {
    resources: HostResources,
    placed: usize,
}

/// Place every task in `to_schedule` onto a qualified agent, or report it
/// failed.
pub fn place(
    to_schedule: &BTreeMap<String, ContainerConfig>,
    cluster: &ClusterState,
    pending: &PendingMap,
    policy: PlacementPolicy,
) -> Placement {
    let mut views: BTreeMap<&str, AgentView> = cluster
        .iter()
        .map(|(endpoint, state)| {
            (
                endpoint.as_str(),
                AgentView {
                    resources: state.resources.clone(),
                    placed: state.instances.len(),
                },
            )
        })
        .collect();

    // Book in-flight schedules so pending capacity is not double-booked.
    for op in pending.values() {
        if op.kind != OpKind::Schedule {
            continue;
        }
        if let Some(view) = views.get_mut(op.endpoint.as_str()) {
            view.resources.reserve(&op.config);
            view.placed += 1;
        }
    }

    let mut result = Placement::default();

    for (id, config) in to_schedule {
        let qualified = views
            .iter()
            .filter(|(_, view)| view.resources.fits(config))
            .map(|(endpoint, view)| (*endpoint, view.placed));

        let chosen: Option<String> = match policy {
            PlacementPolicy::RandomFit => qualified
                .choose(&mut rand::rng())
                .map(|(endpoint, _)| endpoint.to_string()),
            PlacementPolicy::LeastUsed => qualified
                .min_by_key(|(endpoint, placed)| (*placed, endpoint.to_string()))
                .map(|(endpoint, _)| endpoint.to_string()),
        };

        match chosen {
            Some(endpoint) => {
                debug!(container_id = %id, endpoint = %endpoint, "placed");
                if let Some(view) = views.get_mut(endpoint.as_str()) {
                    view.resources.reserve(config);
                    view.placed += 1;
                }
                result
                    .placements
                    .entry(endpoint)
                    .or_default()
                    .insert(id.clone(), config.clone());
            }
            None => {
                result.failed.insert(id.clone(), config.clone());
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::PendingOp;
    use convoy_types::container::{Command, ResourceLimits, RestartPolicy, Storage};
    use convoy_types::StateEvent;
    use tokio::time::Instant;

    fn config(mem: u64, cpus: f64, volumes: &[&str]) -> ContainerConfig {
        ContainerConfig {
            artifact_url: "https://a.example.com/x.tar".to_string(),
            ports: BTreeMap::new(),
            env: BTreeMap::new(),
            command: Command {
                work_dir: "/".to_string(),
                argv: vec!["/bin/x".to_string()],
            },
            resources: ResourceLimits {
                memory_mb: mem,
                cpus,
                fd_limit: 64,
            },
            storage: Storage {
                volumes: volumes
                    .iter()
                    .map(|v| (v.to_string(), format!("/mnt/{v}")))
                    .collect(),
                tmpfs: BTreeMap::new(),
            },
            startup_grace_secs: 1,
            shutdown_grace_secs: 1,
            restart: RestartPolicy::No,
        }
    }

    fn agent(mem: u64, cpus: f64, volumes: &[&str]) -> StateEvent {
        StateEvent {
            resources: HostResources {
                memory_total_mb: mem,
                cpus_total: cpus,
                memory_reserved_mb: 0,
                cpus_reserved: 0.0,
                volumes: volumes.iter().map(|s| s.to_string()).collect(),
            },
            instances: BTreeMap::new(),
        }
    }

    fn cluster(agents: &[(&str, StateEvent)]) -> ClusterState {
        agents
            .iter()
            .map(|(e, s)| (e.to_string(), s.clone()))
            .collect()
    }

    #[test]
    fn test_respects_memory_and_cpu() {
        let cluster = cluster(&[("a:1", agent(512, 1.0, &[]))]);
        let tasks = BTreeMap::from([
            ("t-0".to_string(), config(256, 0.5, &[])),
            ("t-1".to_string(), config(256, 0.5, &[])),
            ("t-2".to_string(), config(256, 0.5, &[])),
        ]);

        let result = place(&tasks, &cluster, &PendingMap::new(), PlacementPolicy::LeastUsed);

        // Two fit, the third exceeds capacity.
        let placed: usize = result.placements.values().map(|m| m.len()).sum();
        assert_eq!(placed, 2);
        assert_eq!(result.failed.len(), 1);
    }

    #[test]
    fn test_requires_volumes() {
        let cluster = cluster(&[
            ("a:1", agent(1024, 4.0, &[])),
            ("b:2", agent(1024, 4.0, &["data"])),
        ]);
        let tasks = BTreeMap::from([("t-0".to_string(), config(64, 0.1, &["data"]))]);

        let result = place(&tasks, &cluster, &PendingMap::new(), PlacementPolicy::RandomFit);
        assert!(result.failed.is_empty());
        assert!(result.placements.contains_key("b:2"));
        assert!(!result.placements.contains_key("a:1"));
    }

    #[test]
    fn test_pending_schedules_are_booked() {
        let cluster = cluster(&[("a:1", agent(512, 4.0, &[]))]);
        let mut pending = PendingMap::new();
        pending.insert(
            "other-0".to_string(),
            PendingOp {
                kind: OpKind::Schedule,
                endpoint: "a:1".to_string(),
                config: config(512, 0.5, &[]),
                deadline: Instant::now() + std::time::Duration::from_secs(30),
            },
        );

        let tasks = BTreeMap::from([("t-0".to_string(), config(512, 0.5, &[]))]);
        let result = place(&tasks, &cluster, &pending, PlacementPolicy::LeastUsed);

        // All memory is spoken for by the in-flight schedule.
        assert_eq!(result.failed.len(), 1);
        assert!(result.placements.is_empty());
    }

    #[test]
    fn test_least_used_spreads_and_breaks_ties_by_endpoint() {
        let cluster = cluster(&[
            ("a:1", agent(1024, 4.0, &[])),
            ("b:2", agent(1024, 4.0, &[])),
        ]);
        let tasks: BTreeMap<String, ContainerConfig> = (0..4)
            .map(|i| (format!("t-{i}"), config(64, 0.1, &[])))
            .collect();

        let result = place(&tasks, &cluster, &PendingMap::new(), PlacementPolicy::LeastUsed);

        // Even counts: first tie goes to "a:1", then they alternate.
        assert_eq!(result.placements["a:1"].len(), 2);
        assert_eq!(result.placements["b:2"].len(), 2);
    }

    #[test]
    fn test_random_fit_only_uses_qualified() {
        let cluster = cluster(&[
            ("small:1", agent(64, 0.2, &[])),
            ("big:2", agent(4096, 8.0, &[])),
        ]);
        let tasks = BTreeMap::from([("t-0".to_string(), config(1024, 1.0, &[]))]);

        for _ in 0..20 {
            let result = place(&tasks, &cluster, &PendingMap::new(), PlacementPolicy::RandomFit);
            assert!(result.placements.contains_key("big:2"));
        }
    }

    #[test]
    fn test_no_agents_fails_everything() {
        let tasks = BTreeMap::from([("t-0".to_string(), config(64, 0.1, &[]))]);
        let result = place(
            &tasks,
            &ClusterState::new(),
            &PendingMap::new(),
            PlacementPolicy::RandomFit,
        );
        assert_eq!(result.failed.len(), 1);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "random-fit".parse::<PlacementPolicy>().unwrap(),
            PlacementPolicy::RandomFit
        );
        assert_eq!(
            "least-used".parse::<PlacementPolicy>().unwrap(),
            PlacementPolicy::LeastUsed
        );
        assert!("best-fit".parse::<PlacementPolicy>().is_err());
    }
}
