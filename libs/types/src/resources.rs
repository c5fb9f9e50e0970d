//! Per-host resource accounting.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::container::ContainerConfig;

/// One agent's capacity, current reservations, and named volumes.
///
/// Reserved sums are derived from currently-allocated containers; the
/// scheduler additionally books pending placements on its own clone
/// before filtering.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HostResources {
    pub memory_total_mb: u64,
    pub cpus_total: f64,
    pub memory_reserved_mb: u64,
    pub cpus_reserved: f64,
    #[serde(default)]
    pub volumes: BTreeSet<String>,
}

impl HostResources {
    pub fn free_memory_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_reserved_mb)
    }

    pub fn free_cpus(&self) -> f64 {
        (self.cpus_total - self.cpus_reserved).max(0.0)
    }

    /// Whether this host can take one more container with `config`:
    /// enough free cpu and memory, and every required named volume present.
    pub fn fits(&self, config: &ContainerConfig) -> bool {
        self.free_memory_mb() >= config.resources.memory_mb
            && self.free_cpus() >= config.resources.cpus
            && config
                .storage
                .volumes
                .keys()
                .all(|name| self.volumes.contains(name))
    }

    /// Book one container's requirements.
    pub fn reserve(&mut self, config: &ContainerConfig) {
        self.memory_reserved_mb += config.resources.memory_mb;
        self.cpus_reserved += config.resources.cpus;
    }

    /// Release one container's requirements.
    pub fn release(&mut self, config: &ContainerConfig) {
        self.memory_reserved_mb = self
            .memory_reserved_mb
            .saturating_sub(config.resources.memory_mb);
        self.cpus_reserved = (self.cpus_reserved - config.resources.cpus).max(0.0);
    }
}
