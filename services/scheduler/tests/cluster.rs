//! End-to-end control-loop scenarios.
//!
//! Real scheduler components (job registry, proxy, representations,
//! reconciler) drive real agents (registry + supervisor + HTTP API) over
//! loopback HTTP; only the container processes are mocked.
//!
//! Each agent runs on its own single-threaded runtime so that killing it
//! tears down every open connection, event stream included, the way a
//! dead host would.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use convoy_agent::api as agent_api;
use convoy_agent::api::AppState as AgentAppState;
use convoy_agent::registry::RegistryHandle;
use convoy_agent::runtime::{MockBehavior, MockRuntime};
use convoy_agent::supervisor::SupervisorSettings;
use convoy_broadcast::Broadcast;
use convoy_scheduler::client::HttpAgentClient;
use convoy_scheduler::discovery::StaticDiscovery;
use convoy_scheduler::metrics::SchedulerCounters;
use convoy_scheduler::placement::PlacementPolicy;
use convoy_scheduler::proxy::{ClusterState, ProxyHandle};
use convoy_scheduler::reconciler::{Reconciler, ReconcilerSettings};
use convoy_scheduler::registry::JobRegistryHandle;
use convoy_scheduler::representation::RepresentationSettings;
use convoy_types::container::{Command, ResourceLimits, RestartPolicy, Storage};
use convoy_types::{ContainerConfig, ContainerStatus, HostResources, JobConfig};

struct TestAgent {
    endpoint: String,
    kill: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestAgent {
    /// Simulate host death: the runtime is torn down and every open
    /// connection drops.
    fn kill(&mut self) {
        self.kill.take();
    }
}

fn start_agent(memory_mb: u64, behavior: MockBehavior) -> TestAgent {
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    let (kill_tx, kill_rx) = tokio::sync::oneshot::channel::<()>();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let runtime = Arc::new(MockRuntime::with_behavior(behavior));
            let registry = RegistryHandle::spawn(
                runtime,
                SupervisorSettings::default(),
                HostResources {
                    memory_total_mb: memory_mb,
                    cpus_total: 8.0,
                    memory_reserved_mb: 0,
                    cpus_reserved: 0.0,
                    volumes: Default::default(),
                },
            );

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx
                .send(listener.local_addr().unwrap().to_string())
                .unwrap();

            tokio::select! {
                _ = agent_api::serve(listener, AgentAppState { registry }) => {}
                _ = kill_rx => {}
            }
        });
    });

    TestAgent {
        endpoint: addr_rx.recv().unwrap(),
        kill: Some(kill_tx),
    }
}

struct TestScheduler {
    registry: JobRegistryHandle,
    proxy: ProxyHandle,
    _quit: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn start_scheduler(agents: &[&TestAgent]) -> TestScheduler {
    let dir = tempfile::tempdir().unwrap();
    let registry = JobRegistryHandle::open(dir.path().join("registry.json"))
        .await
        .unwrap();

    let endpoints: Vec<String> = agents.iter().map(|a| a.endpoint.clone()).collect();
    let counters = Arc::new(SchedulerCounters::default());
    let proxy = ProxyHandle::spawn(
        Arc::new(StaticDiscovery::new(endpoints)),
        Arc::new(HttpAgentClient::new()),
        RepresentationSettings {
            reconnect_interval: Duration::from_millis(100),
            abandon_timeout: Duration::from_secs(1),
            pending_op_timeout: Duration::from_secs(3),
        },
        Arc::clone(&counters),
    );
    proxy.ready(Duration::from_secs(5)).await.unwrap();

    let (quit_tx, quit_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        Arc::new(proxy.clone()),
        ReconcilerSettings {
            tolerance: Duration::from_secs(3),
            interval: Duration::from_millis(200),
            seed_timeout: Duration::from_secs(5),
            policy: PlacementPolicy::LeastUsed,
        },
        counters,
    );
    tokio::spawn({
        let registry = registry.clone();
        let proxy = proxy.clone();
        async move {
            reconciler
                .run(Arc::new(registry), Arc::new(proxy), quit_rx)
                .await
        }
    });

    TestScheduler {
        registry,
        proxy,
        _quit: quit_tx,
        _dir: dir,
    }
}

fn job(name: &str, scale: u32, memory_mb: u64) -> JobConfig {
    JobConfig {
        job: name.to_string(),
        scale,
        container: ContainerConfig {
            artifact_url: "https://artifacts.example.com/app.tar.gz".to_string(),
            ports: BTreeMap::new(),
            env: BTreeMap::new(),
            command: Command {
                work_dir: "/".to_string(),
                argv: vec!["/bin/app".to_string()],
            },
            resources: ResourceLimits {
                memory_mb,
                cpus: 0.1,
                fd_limit: 256,
            },
            storage: Storage::default(),
            startup_grace_secs: 2,
            shutdown_grace_secs: 2,
            restart: RestartPolicy::No,
        },
    }
}

/// All instances with the given id prefix across the cluster.
fn instances_with_prefix(
    cluster: &ClusterState,
    prefix: &str,
) -> Vec<(String, String, ContainerStatus)> {
    let mut found = Vec::new();
    for (endpoint, state) in cluster {
        for (id, instance) in &state.instances {
            if id.starts_with(prefix) {
                found.push((endpoint.clone(), id.clone(), instance.status));
            }
        }
    }
    found
}

async fn wait_for<F>(what: &str, proxy: &ProxyHandle, predicate: F) -> ClusterState
where
    F: Fn(&ClusterState) -> bool,
{
    for _ in 0..400 {
        let cluster = proxy.snapshot().await;
        if predicate(&cluster) {
            return cluster;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn running_count(cluster: &ClusterState, prefix: &str) -> usize {
    instances_with_prefix(cluster, prefix)
        .iter()
        .filter(|(_, _, status)| *status == ContainerStatus::Running)
        .count()
}

#[tokio::test]
async fn test_schedule_run_finish() {
    let agent = start_agent(1024, MockBehavior::ExitWith(0));
    let sched = start_scheduler(&[&agent]).await;

    let hash = sched.registry.schedule(job("oneshot", 1, 32)).await.unwrap();
    let task = format!("{hash}-0");

    // The single task appears and finishes.
    wait_for("task finished", &sched.proxy, |cluster| {
        instances_with_prefix(cluster, &task)
            .iter()
            .any(|(_, _, status)| *status == ContainerStatus::Finished)
    })
    .await;

    // The registry still contains the job and the reconciler does not
    // restart the finished task.
    assert_eq!(sched.registry.snapshot().await.len(), 1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let cluster = sched.proxy.snapshot().await;
    let found = instances_with_prefix(&cluster, &task);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].2, ContainerStatus::Finished);
}

#[tokio::test]
async fn test_unschedule_removes_containers() {
    let agent = start_agent(1024, MockBehavior::Serve);
    let sched = start_scheduler(&[&agent]).await;

    let hash = sched.registry.schedule(job("web", 2, 32)).await.unwrap();
    wait_for("both running", &sched.proxy, |cluster| {
        running_count(cluster, &hash.to_string()) == 2
    })
    .await;

    sched.registry.unschedule(hash.clone()).await.unwrap();
    wait_for("all gone", &sched.proxy, |cluster| {
        instances_with_prefix(cluster, &hash.to_string()).is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_placement_respects_resources() {
    let a = start_agent(1024, MockBehavior::Serve);
    let b = start_agent(1024, MockBehavior::Serve);
    let sched = start_scheduler(&[&a, &b]).await;

    let hash = sched.registry.schedule(job("big", 3, 512)).await.unwrap();
    let cluster = wait_for("three running", &sched.proxy, |cluster| {
        running_count(cluster, &hash.to_string()) == 3
    })
    .await;

    // No agent holds more than two, and reservations never exceed
    // capacity.
    for (endpoint, state) in &cluster {
        let count = state
            .instances
            .keys()
            .filter(|id| id.starts_with(&hash.to_string()))
            .count();
        assert!(count <= 2, "{endpoint} holds {count} instances");
        assert!(state.resources.memory_reserved_mb <= state.resources.memory_total_mb);
    }

    // A second job wanting two more 512 MB tasks: only one fits.
    let second = sched.registry.schedule(job("more", 2, 512)).await.unwrap();
    wait_for("one more running", &sched.proxy, |cluster| {
        running_count(cluster, &second.to_string()) == 1
    })
    .await;

    // The other task stays unplaced; capacity is still respected.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let cluster = sched.proxy.snapshot().await;
    assert_eq!(instances_with_prefix(&cluster, &second.to_string()).len(), 1);
    for state in cluster.values() {
        assert!(state.resources.memory_reserved_mb <= state.resources.memory_total_mb);
    }
}

#[tokio::test]
async fn test_agent_loss_replaces_instances() {
    let a = start_agent(1024, MockBehavior::Serve);
    let mut b = start_agent(1024, MockBehavior::Serve);
    let sched = start_scheduler(&[&a, &b]).await;

    let hash = sched.registry.schedule(job("web", 2, 32)).await.unwrap();
    let cluster = wait_for("both running", &sched.proxy, |cluster| {
        running_count(cluster, &hash.to_string()) == 2
    })
    .await;

    // least-used spread one instance per agent.
    assert_eq!(cluster.len(), 2);
    for state in cluster.values() {
        assert_eq!(state.instances.len(), 1);
    }

    // Kill one agent. Its event stream dies and stays dead; after the
    // abandon timeout its instance is declared lost and re-placed on the
    // survivor.
    b.kill();

    wait_for("replacement on survivor", &sched.proxy, |cluster| {
        cluster.get(&a.endpoint).is_some_and(|state| {
            state
                .instances
                .values()
                .filter(|i| {
                    i.id.starts_with(&hash.to_string()) && i.status == ContainerStatus::Running
                })
                .count()
                == 2
        })
    })
    .await;
}

#[tokio::test]
async fn test_unresponsive_agent_fails_initialization() {
    let mut agent = start_agent(1024, MockBehavior::Serve);
    agent.kill();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let counters = Arc::new(SchedulerCounters::default());
    let proxy = ProxyHandle::spawn(
        Arc::new(StaticDiscovery::new(vec![agent.endpoint.clone()])),
        Arc::new(HttpAgentClient::new()),
        RepresentationSettings {
            reconnect_interval: Duration::from_millis(100),
            abandon_timeout: Duration::from_secs(1),
            pending_op_timeout: Duration::from_secs(3),
        },
        counters,
    );

    let result = proxy.ready(Duration::from_millis(500)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_steady_state_issues_no_commands() {
    let agent = start_agent(1024, MockBehavior::Serve);
    let sched = start_scheduler(&[&agent]).await;

    let hash = sched.registry.schedule(job("web", 1, 32)).await.unwrap();
    wait_for("running", &sched.proxy, |cluster| {
        running_count(cluster, &hash.to_string()) == 1
    })
    .await;

    // Many reconcile ticks later there is still exactly one instance:
    // converged transforms issue nothing.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let cluster = sched.proxy.snapshot().await;
    let found = instances_with_prefix(&cluster, &hash.to_string());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].2, ContainerStatus::Running);
}
