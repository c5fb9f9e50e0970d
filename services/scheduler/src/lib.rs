//! convoy scheduler library.
//!
//! The scheduler accepts job declarations, distributes task instances
//! across agents, and continuously reconciles desired state with
//! observed state.
//!
//! ## Data flow
//!
//! ```text
//! JobRegistry ──(desired set)──┐
//!                              ├──> Reconciler ──commands──> Proxy
//! Proxy ───────(cluster state)─┘                               │
//!   └── Representation(endpoint)  <────────────────────────────┘
//!         ├── connection loop (agent event stream)
//!         └── request loop (FSM map, pending ops, abandon timer)
//! ```
//!
//! Identity is content-addressed: a job is its config hash, and task ids
//! are `<hash>-<ordinal>`.

pub mod api;
pub mod client;
pub mod config;
pub mod discovery;
pub mod fsm;
pub mod metrics;
pub mod placement;
pub mod proxy;
pub mod reconciler;
pub mod registry;
pub mod representation;

pub use client::{AgentApi, HttpAgentClient};
pub use config::Config;
pub use discovery::{ChannelDiscovery, Discovery, StaticDiscovery};
pub use metrics::SchedulerCounters;
pub use placement::PlacementPolicy;
pub use proxy::{ClusterState, ProxyHandle};
pub use reconciler::{Reconciler, ReconcilerSettings, SchedulerTarget};
pub use registry::{DesiredSet, JobRegistryHandle};
pub use representation::{RepresentationHandle, RepresentationSettings};
