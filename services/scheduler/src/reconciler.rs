//! Reconciler: the desired -> actual transform loop.
//!
//! Runs forever against two streams: the registry's desired set and the
//! proxy's actual cluster state. On every tick of either input, and on a
//! periodic timer, it attempts a transform; the timer exists so stuck
//! pending ops get retried when their deadline passes even if nothing
//! else changes.
//!
//! Transforms run asynchronously under a single-slot semaphore: triggers
//! that arrive while one is running are dropped and counted, because a
//! later trigger or the periodic tick catches the missed work. The
//! pending-op map is the only memory between iterations, and it is
//! advisory: correctness comes from re-issuing commands after
//! `tolerance`, never from trusting a pending entry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use convoy_broadcast::Broadcast;
use convoy_types::hash::task_id;
use convoy_types::invariant;
use convoy_types::{ContainerConfig, ContainerInstance, ContainerStatus};

use crate::metrics::SchedulerCounters;
use crate::placement::{place, PlacementPolicy};
use crate::proxy::ClusterState;
use crate::registry::DesiredSet;

pub use crate::representation::OpKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("unknown agent endpoint")]
    UnknownEndpoint,

    #[error("agent connection interrupted")]
    Interrupted,

    #[error("transaction pending")]
    Pending,

    #[error("{0}")]
    Other(String),
}

/// Where the reconciler sends its commands. The proxy in production;
/// deterministic fakes in tests.
#[async_trait]
pub trait SchedulerTarget: Send + Sync + 'static {
    async fn schedule(
        &self,
        endpoint: &str,
        id: &str,
        config: ContainerConfig,
    ) -> Result<(), TargetError>;

    async fn unschedule(&self, endpoint: &str, id: &str) -> Result<(), TargetError>;
}

/// A command issued but not yet observably resolved.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub kind: OpKind,
    pub endpoint: String,
    pub config: ContainerConfig,
    pub deadline: Instant,
}

/// id -> pending op.
pub type PendingMap = BTreeMap<String, PendingOp>;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Deadline after which a pending op may be re-issued.
    pub tolerance: Duration,
    /// Periodic transform tick.
    pub interval: Duration,
    /// Startup deadline for the want/have seeds. Exceeding it means a
    /// misbehaving broadcaster and is fatal.
    pub seed_timeout: Duration,
    pub policy: PlacementPolicy,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            tolerance: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            seed_timeout: Duration::from_secs(30),
            policy: PlacementPolicy::default(),
        }
    }
}

/// What one transform did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransformStats {
    pub scheduled: u64,
    pub unscheduled: u64,
    /// Lost start signals re-emitted for created instances.
    pub restarted: u64,
    pub unplaceable: u64,
}

impl TransformStats {
    /// No commands were issued.
    pub fn is_noop(&self) -> bool {
        self.scheduled == 0 && self.unscheduled == 0 && self.restarted == 0
    }
}

/// The reconciler loop.
pub struct Reconciler<T: SchedulerTarget> {
    target: Arc<T>,
    settings: ReconcilerSettings,
    counters: Arc<SchedulerCounters>,
}

impl<T: SchedulerTarget> Reconciler<T> {
    pub fn new(
        target: Arc<T>,
        settings: ReconcilerSettings,
        counters: Arc<SchedulerCounters>,
    ) -> Self {
        Self {
            target,
            settings,
            counters,
        }
    }

    /// Run until quit. Seeds `want` and `have` under the seed timeout,
    /// then transforms on every input tick and on the periodic timer.
    pub async fn run(
        self,
        want_source: Arc<dyn Broadcast<DesiredSet>>,
        have_source: Arc<dyn Broadcast<ClusterState>>,
        mut quit: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let (want_tx, mut want_rx) = mpsc::channel(32);
        want_source.subscribe(want_tx).await;
        let (have_tx, mut have_rx) = mpsc::channel(32);
        have_source.subscribe(have_tx).await;

        let mut want = tokio::time::timeout(self.settings.seed_timeout, want_rx.recv())
            .await
            .context("registry never emitted an initial desired set")?
            .context("registry stream closed during seeding")?;
        let mut have = tokio::time::timeout(self.settings.seed_timeout, have_rx.recv())
            .await
            .context("proxy never emitted an initial cluster state")?
            .context("proxy stream closed during seeding")?;

        info!(
            jobs = want.len(),
            agents = have.len(),
            "reconciler seeded"
        );

        let pending = Arc::new(Mutex::new(PendingMap::new()));
        let gate = Arc::new(Semaphore::new(1));
        let mut tick = tokio::time::interval(self.settings.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = quit.changed() => {
                    if *quit.borrow() {
                        break;
                    }
                }

                maybe = want_rx.recv() => {
                    match maybe {
                        Some(next) => want = next,
                        None => bail!("registry stream closed"),
                    }
                    self.trigger(&gate, &pending, &want, &have);
                }

                maybe = have_rx.recv() => {
                    match maybe {
                        Some(next) => have = next,
                        None => bail!("proxy stream closed"),
                    }
                    self.trigger(&gate, &pending, &want, &have);
                }

                _ = tick.tick() => {
                    self.trigger(&gate, &pending, &want, &have);
                }
            }
        }

        info!("reconciler stopped");
        Ok(())
    }

    /// Kick off a transform unless one is already running.
    fn trigger(
        &self,
        gate: &Arc<Semaphore>,
        pending: &Arc<Mutex<PendingMap>>,
        want: &DesiredSet,
        have: &ClusterState,
    ) {
        let Ok(permit) = Arc::clone(gate).try_acquire_owned() else {
            SchedulerCounters::bump(&self.counters.transforms_skipped);
            return;
        };
        SchedulerCounters::bump(&self.counters.transforms_executed);

        let want = want.clone();
        let have = have.clone();
        let pending = Arc::clone(pending);
        let target = Arc::clone(&self.target);
        let policy = self.settings.policy;
        let tolerance = self.settings.tolerance;

        tokio::spawn(async move {
            let mut pending = pending.lock().await;
            let stats =
                transform(&want, &have, &mut pending, target.as_ref(), policy, tolerance).await;
            if !stats.is_noop() {
                info!(
                    scheduled = stats.scheduled,
                    unscheduled = stats.unscheduled,
                    restarted = stats.restarted,
                    unplaceable = stats.unplaceable,
                    "transform complete"
                );
            }
            drop(permit);
        });
    }
}

/// One transform pass: compute the delta between `want` and `have`,
/// respecting pending ops, and issue schedule/unschedule commands.
///
/// Every command returns quickly; effects are observed on later passes.
pub async fn transform(
    want: &DesiredSet,
    have: &ClusterState,
    pending: &mut PendingMap,
    target: &dyn SchedulerTarget,
    policy: PlacementPolicy,
    tolerance: Duration,
) -> TransformStats {
    let now = Instant::now();
    let mut stats = TransformStats::default();

    // 1. Expand every wanted job into wanted task ids.
    let mut wanted: BTreeMap<String, ContainerConfig> = BTreeMap::new();
    for (hash, job) in want {
        for ordinal in 0..job.scale {
            wanted.insert(task_id(hash, ordinal), job.container.clone());
        }
    }

    // 2. Index every observed instance by id across endpoints.
    let mut observed: BTreeMap<String, Vec<(String, ContainerInstance)>> = BTreeMap::new();
    for (endpoint, state) in have {
        for (id, instance) in &state.instances {
            observed
                .entry(id.clone())
                .or_default()
                .push((endpoint.clone(), instance.clone()));
        }
    }

    // 3. Purge pending ops that are satisfied or expired.
    pending.retain(|id, op| {
        let satisfied = match op.kind {
            OpKind::Schedule => observed
                .get(id)
                .is_some_and(|list| list.iter().any(|(_, i)| i.status.is_supervised())),
            OpKind::Unschedule => observed
                .get(id)
                .is_none_or(|list| !list.iter().any(|(e, _)| *e == op.endpoint)),
        };
        let expired = now > op.deadline;
        if satisfied || expired {
            debug!(container_id = %id, kind = ?op.kind, expired, "pending op cleared");
        }
        !(satisfied || expired)
    });

    let mut to_unschedule: Vec<(String, String, ContainerConfig)> = Vec::new();

    // 4. Walk the wanted tasks.
    let mut to_schedule: BTreeMap<String, ContainerConfig> = BTreeMap::new();
    for (id, config) in &wanted {
        match observed.get(id) {
            Some(instances) => {
                if instances.iter().any(|(_, i)| i.status.is_supervised()) {
                    // Under supervision somewhere. Keep the best copy,
                    // unschedule duplicates (survivors of an abandoned
                    // agent reappearing).
                    let keep = best_endpoint(instances);
                    for (endpoint, instance) in instances {
                        if *endpoint != keep && !pending.contains_key(id) {
                            to_unschedule.push((
                                endpoint.clone(),
                                id.clone(),
                                instance.config.clone(),
                            ));
                        }
                    }
                } else {
                    // Only created instances. With a pending schedule we
                    // wait; without one the start signal was lost.
                    if !pending.contains_key(id) {
                        let (endpoint, _) = &instances[0];
                        match target.schedule(endpoint, id, config.clone()).await {
                            Ok(()) => {
                                debug!(container_id = %id, endpoint = %endpoint, "re-emitting lost start");
                                stats.restarted += 1;
                                pending.insert(
                                    id.clone(),
                                    PendingOp {
                                        kind: OpKind::Schedule,
                                        endpoint: endpoint.clone(),
                                        config: config.clone(),
                                        deadline: now + tolerance,
                                    },
                                );
                            }
                            Err(e) => {
                                warn!(container_id = %id, error = %e, "re-emitting start failed");
                            }
                        }
                    }
                }
            }
            None => match pending.get(id) {
                Some(op) if op.kind == OpKind::Unschedule => {
                    invariant!(
                        false,
                        "reconciler",
                        "wanted task {id} is absent while an unschedule is pending"
                    );
                }
                Some(_) => {} // schedule in flight
                None => {
                    to_schedule.insert(id.clone(), config.clone());
                }
            },
        }
    }

    // 5. Observed but unwanted.
    for (id, instances) in &observed {
        if wanted.contains_key(id) {
            continue;
        }
        if pending
            .get(id)
            .is_some_and(|op| op.kind == OpKind::Unschedule)
        {
            continue;
        }
        for (endpoint, instance) in instances {
            to_unschedule.push((endpoint.clone(), id.clone(), instance.config.clone()));
        }
    }

    // 6. Place and schedule.
    let placement = place(&to_schedule, have, pending, policy);
    for (id, _) in &placement.failed {
        warn!(container_id = %id, "failed to place");
        stats.unplaceable += 1;
    }
    for (endpoint, tasks) in placement.placements {
        for (id, config) in tasks {
            match target.schedule(&endpoint, &id, config.clone()).await {
                Ok(()) => {
                    stats.scheduled += 1;
                    pending.insert(
                        id,
                        PendingOp {
                            kind: OpKind::Schedule,
                            endpoint: endpoint.clone(),
                            config,
                            deadline: now + tolerance,
                        },
                    );
                }
                Err(e) => {
                    warn!(container_id = %id, endpoint = %endpoint, error = %e, "schedule failed");
                }
            }
        }
    }

    // 7. Unschedule.
    for (endpoint, id, config) in to_unschedule {
        match target.unschedule(&endpoint, &id).await {
            Ok(()) => {
                stats.unscheduled += 1;
                pending.entry(id).or_insert(PendingOp {
                    kind: OpKind::Unschedule,
                    endpoint,
                    config,
                    deadline: now + tolerance,
                });
            }
            Err(e) => {
                warn!(container_id = %id, endpoint = %endpoint, error = %e, "unschedule failed");
            }
        }
    }

    stats
}

/// Which copy of a duplicated id survives: the healthiest, ties broken
/// by endpoint identity.
fn best_endpoint(instances: &[(String, ContainerInstance)]) -> String {
    instances
        .iter()
        .min_by_key(|(endpoint, instance)| {
            let rank = match instance.status {
                ContainerStatus::Running => 0,
                ContainerStatus::Finished | ContainerStatus::Failed => 1,
                ContainerStatus::Created | ContainerStatus::Deleted => 2,
            };
            (rank, endpoint.clone())
        })
        .map(|(endpoint, _)| endpoint.clone())
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::container::{Command, ResourceLimits, RestartPolicy, Storage};
    use convoy_types::{HostResources, JobConfig, StateEvent};
    use std::sync::Mutex as StdMutex;

    fn container(mem: u64) -> ContainerConfig {
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
                cpus: 0.1,
                fd_limit: 64,
            },
            storage: Storage::default(),
            startup_grace_secs: 1,
            shutdown_grace_secs: 1,
            restart: RestartPolicy::No,
        }
    }

    fn job(name: &str, scale: u32, mem: u64) -> JobConfig {
        JobConfig {
            job: name.to_string(),
            scale,
            container: container(mem),
        }
    }

    fn desired(jobs: &[&JobConfig]) -> DesiredSet {
        jobs.iter().map(|j| (j.hash(), (*j).clone())).collect()
    }

    fn agent_state(mem: u64, instances: &[(&str, ContainerStatus, u64)]) -> StateEvent {
        StateEvent {
            resources: HostResources {
                memory_total_mb: mem,
                cpus_total: 8.0,
                memory_reserved_mb: instances.iter().map(|(_, _, m)| m).sum(),
                cpus_reserved: instances.len() as f64 * 0.1,
                volumes: Default::default(),
            },
            instances: instances
                .iter()
                .map(|(id, status, m)| {
                    let mut inst = ContainerInstance::new(*id, container(*m));
                    inst.status = *status;
                    (id.to_string(), inst)
                })
                .collect(),
        }
    }

    #[derive(Default)]
    struct FakeTarget {
        calls: StdMutex<Vec<String>>,
    }

    impl FakeTarget {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SchedulerTarget for FakeTarget {
        async fn schedule(
            &self,
            endpoint: &str,
            id: &str,
            _config: ContainerConfig,
        ) -> Result<(), TargetError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("schedule {endpoint} {id}"));
            Ok(())
        }

        async fn unschedule(&self, endpoint: &str, id: &str) -> Result<(), TargetError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("unschedule {endpoint} {id}"));
            Ok(())
        }
    }

    const TOL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_schedules_all_ordinals() {
        let job = job("web", 3, 64);
        let hash = job.hash();
        let want = desired(&[&job]);
        let have = ClusterState::from([("a:1".to_string(), agent_state(1024, &[]))]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::new();

        let stats = transform(
            &want,
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;

        assert_eq!(stats.scheduled, 3);
        assert_eq!(pending.len(), 3);
        for ordinal in 0..3 {
            assert!(pending.contains_key(&format!("{hash}-{ordinal}")));
        }
    }

    #[tokio::test]
    async fn test_converged_cluster_is_noop() {
        let job = job("web", 2, 64);
        let hash = job.hash();
        let want = desired(&[&job]);
        let have = ClusterState::from([(
            "a:1".to_string(),
            agent_state(
                1024,
                &[
                    (&format!("{hash}-0"), ContainerStatus::Running, 64),
                    (&format!("{hash}-1"), ContainerStatus::Running, 64),
                ],
            ),
        )]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::new();

        for _ in 0..3 {
            let stats = transform(
                &want,
                &have,
                &mut pending,
                &target,
                PlacementPolicy::LeastUsed,
                TOL,
            )
            .await;
            assert!(stats.is_noop());
        }
        assert!(target.calls().is_empty());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_finished_tasks_are_not_restarted() {
        let job = job("batch", 1, 64);
        let hash = job.hash();
        let want = desired(&[&job]);
        let have = ClusterState::from([(
            "a:1".to_string(),
            agent_state(1024, &[(&format!("{hash}-0"), ContainerStatus::Finished, 64)]),
        )]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::new();

        let stats = transform(
            &want,
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;
        assert!(stats.is_noop());
        assert!(target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_created_without_pending_reemits_start() {
        let job = job("web", 1, 64);
        let hash = job.hash();
        let id = format!("{hash}-0");
        let want = desired(&[&job]);
        let have = ClusterState::from([(
            "a:1".to_string(),
            agent_state(1024, &[(&id, ContainerStatus::Created, 64)]),
        )]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::new();

        let stats = transform(
            &want,
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;

        assert_eq!(stats.restarted, 1);
        assert_eq!(target.calls(), vec![format!("schedule a:1 {id}")]);
        assert!(pending.contains_key(&id));
    }

    #[tokio::test]
    async fn test_created_with_pending_waits() {
        let job = job("web", 1, 64);
        let hash = job.hash();
        let id = format!("{hash}-0");
        let want = desired(&[&job]);
        let have = ClusterState::from([(
            "a:1".to_string(),
            agent_state(1024, &[(&id, ContainerStatus::Created, 64)]),
        )]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::from([(
            id.clone(),
            PendingOp {
                kind: OpKind::Schedule,
                endpoint: "a:1".to_string(),
                config: container(64),
                deadline: Instant::now() + TOL,
            },
        )]);

        let stats = transform(
            &want,
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;
        assert!(stats.is_noop());
        assert!(target.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unwanted_instances_are_unscheduled() {
        let have = ClusterState::from([(
            "a:1".to_string(),
            agent_state(1024, &[("stray-0", ContainerStatus::Running, 64)]),
        )]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::new();

        let stats = transform(
            &DesiredSet::new(),
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;

        assert_eq!(stats.unscheduled, 1);
        assert_eq!(target.calls(), vec!["unschedule a:1 stray-0"]);
        assert!(matches!(
            pending.get("stray-0"),
            Some(PendingOp {
                kind: OpKind::Unschedule,
                ..
            })
        ));

        // Second pass: the pending unschedule suppresses a repeat.
        let stats = transform(
            &DesiredSet::new(),
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;
        assert!(stats.is_noop());
        assert_eq!(target.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_pending_is_reissued() {
        let job = job("web", 1, 64);
        let hash = job.hash();
        let id = format!("{hash}-0");
        let want = desired(&[&job]);
        let have = ClusterState::from([("a:1".to_string(), agent_state(1024, &[]))]);
        let target = FakeTarget::default();

        // A pending schedule whose deadline has passed and whose effect
        // never materialized.
        let mut pending = PendingMap::from([(
            id.clone(),
            PendingOp {
                kind: OpKind::Schedule,
                endpoint: "a:1".to_string(),
                config: container(64),
                deadline: Instant::now() - Duration::from_secs(1),
            },
        )]);

        let stats = transform(
            &want,
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;

        assert_eq!(stats.scheduled, 1);
        assert_eq!(target.calls(), vec![format!("schedule a:1 {id}")]);
        // Re-recorded with a fresh deadline.
        assert!(pending[&id].deadline > Instant::now());
    }

    #[tokio::test]
    async fn test_duplicates_keep_one_copy() {
        let job = job("web", 1, 64);
        let hash = job.hash();
        let id = format!("{hash}-0");
        let want = desired(&[&job]);
        let have = ClusterState::from([
            (
                "a:1".to_string(),
                agent_state(1024, &[(&id, ContainerStatus::Running, 64)]),
            ),
            (
                "b:2".to_string(),
                agent_state(1024, &[(&id, ContainerStatus::Running, 64)]),
            ),
        ]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::new();

        let stats = transform(
            &want,
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;

        // One copy survives (ties break to "a:1"), the other goes.
        assert_eq!(stats.unscheduled, 1);
        assert_eq!(target.calls(), vec![format!("unschedule b:2 {id}")]);
        assert_eq!(stats.scheduled, 0);
    }

    #[tokio::test]
    async fn test_unplaceable_reports_failure_and_keeps_trying() {
        let job = job("big", 1, 100_000);
        let want = desired(&[&job]);
        let have = ClusterState::from([("a:1".to_string(), agent_state(1024, &[]))]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::new();

        for _ in 0..2 {
            let stats = transform(
                &want,
                &have,
                &mut pending,
                &target,
                PlacementPolicy::LeastUsed,
                TOL,
            )
            .await;
            assert_eq!(stats.unplaceable, 1);
            assert_eq!(stats.scheduled, 0);
        }
        assert!(target.calls().is_empty());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    #[should_panic(expected = "unschedule is pending")]
    async fn test_wanted_absent_with_pending_unschedule_panics() {
        let job = job("web", 1, 64);
        let hash = job.hash();
        let id = format!("{hash}-0");
        let want = desired(&[&job]);
        let have = ClusterState::from([("a:1".to_string(), agent_state(1024, &[]))]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::from([(
            id,
            PendingOp {
                kind: OpKind::Unschedule,
                endpoint: "a:1".to_string(),
                config: container(64),
                deadline: Instant::now() + TOL,
            },
        )]);

        let _ = transform(
            &want,
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;
    }

    #[tokio::test]
    async fn test_satisfied_schedule_pending_is_cleared() {
        let job = job("web", 1, 64);
        let hash = job.hash();
        let id = format!("{hash}-0");
        let want = desired(&[&job]);
        let have = ClusterState::from([(
            "a:1".to_string(),
            agent_state(1024, &[(&id, ContainerStatus::Running, 64)]),
        )]);
        let target = FakeTarget::default();
        let mut pending = PendingMap::from([(
            id.clone(),
            PendingOp {
                kind: OpKind::Schedule,
                endpoint: "a:1".to_string(),
                config: container(64),
                deadline: Instant::now() + TOL,
            },
        )]);

        let stats = transform(
            &want,
            &have,
            &mut pending,
            &target,
            PlacementPolicy::LeastUsed,
            TOL,
        )
        .await;
        assert!(stats.is_noop());
        assert!(pending.is_empty());
    }
}
