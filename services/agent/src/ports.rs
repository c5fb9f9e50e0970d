//! Port allocation.
//!
//! One worker owns the configured port range and serializes every
//! allocation. A port is only handed out after a successful test bind,
//! so two containers on one host can never be given the same port and a
//! port already taken by an unrelated process is skipped.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port range exhausted")]
    Exhausted,

    #[error("requested port {0} unavailable")]
    Unavailable(u16),

    #[error("port allocator is gone")]
    Gone,
}

enum PortMessage {
    Allocate {
        /// Port name -> requested port (0 = auto-assign).
        requests: BTreeMap<String, u16>,
        reply: oneshot::Sender<Result<BTreeMap<String, u16>, PortError>>,
    },
    Release {
        ports: Vec<u16>,
    },
}

/// Handle to the port allocator worker.
#[derive(Clone)]
pub struct PortAllocator {
    tx: mpsc::Sender<PortMessage>,
}

impl PortAllocator {
    pub fn spawn(range: (u16, u16)) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run(range, rx));
        Self { tx }
    }

    /// Resolve a container's named port requests to concrete ports.
    ///
    /// All-or-nothing: on failure nothing stays allocated.
    pub async fn allocate(
        &self,
        requests: BTreeMap<String, u16>,
    ) -> Result<BTreeMap<String, u16>, PortError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PortMessage::Allocate { requests, reply })
            .await
            .map_err(|_| PortError::Gone)?;
        rx.await.map_err(|_| PortError::Gone)?
    }

    /// Return ports to the pool.
    pub async fn release(&self, ports: Vec<u16>) {
        let _ = self.tx.send(PortMessage::Release { ports }).await;
    }
}

async fn run((low, high): (u16, u16), mut rx: mpsc::Receiver<PortMessage>) {
    let mut allocated: HashSet<u16> = HashSet::new();
    let mut next = low;

    while let Some(msg) = rx.recv().await {
        match msg {
            PortMessage::Allocate { requests, reply } => {
                let result = allocate_all(&requests, &mut allocated, &mut next, low, high);
                let _ = reply.send(result);
            }
            PortMessage::Release { ports } => {
                for port in ports {
                    allocated.remove(&port);
                }
            }
        }
    }
}

fn allocate_all(
    requests: &BTreeMap<String, u16>,
    allocated: &mut HashSet<u16>,
    next: &mut u16,
    low: u16,
    high: u16,
) -> Result<BTreeMap<String, u16>, PortError> {
    let mut granted = BTreeMap::new();
    let mut taken = Vec::new();

    for (name, requested) in requests {
        let result = if *requested == 0 {
            auto_assign(allocated, next, low, high)
        } else if allocated.contains(requested) || !bindable(*requested) {
            Err(PortError::Unavailable(*requested))
        } else {
            Ok(*requested)
        };

        match result {
            Ok(port) => {
                allocated.insert(port);
                taken.push(port);
                granted.insert(name.clone(), port);
                debug!(port_name = %name, port, "allocated port");
            }
            Err(e) => {
                for port in taken {
                    allocated.remove(&port);
                }
                return Err(e);
            }
        }
    }

    Ok(granted)
}

fn auto_assign(
    allocated: &HashSet<u16>,
    next: &mut u16,
    low: u16,
    high: u16,
) -> Result<u16, PortError> {
    let span = (high - low) as u32 + 1;
    for _ in 0..span {
        let candidate = *next;
        *next = if *next == high { low } else { *next + 1 };
        if !allocated.contains(&candidate) && bindable(candidate) {
            return Ok(candidate);
        }
    }
    Err(PortError::Exhausted)
}

/// Availability check: can we bind it right now?
fn bindable(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_assign_distinct_ports() {
        let alloc = PortAllocator::spawn((21000, 21010));
        let ports = alloc
            .allocate(BTreeMap::from([
                ("http".to_string(), 0),
                ("admin".to_string(), 0),
            ]))
            .await
            .unwrap();
        assert_eq!(ports.len(), 2);
        assert_ne!(ports["http"], ports["admin"]);
        assert!((21000..=21010).contains(&ports["http"]));
    }

    #[tokio::test]
    async fn test_requested_port_granted_once() {
        let alloc = PortAllocator::spawn((21020, 21030));
        let first = alloc
            .allocate(BTreeMap::from([("http".to_string(), 21025)]))
            .await
            .unwrap();
        assert_eq!(first["http"], 21025);

        let second = alloc
            .allocate(BTreeMap::from([("http".to_string(), 21025)]))
            .await;
        assert_eq!(second, Err(PortError::Unavailable(21025)));
    }

    #[tokio::test]
    async fn test_release_returns_port() {
        let alloc = PortAllocator::spawn((21040, 21050));
        let ports = alloc
            .allocate(BTreeMap::from([("http".to_string(), 21044)]))
            .await
            .unwrap();
        alloc.release(vec![ports["http"]]).await;

        let again = alloc
            .allocate(BTreeMap::from([("http".to_string(), 21044)]))
            .await
            .unwrap();
        assert_eq!(again["http"], 21044);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let alloc = PortAllocator::spawn((21060, 21061));
        let requests: BTreeMap<String, u16> =
            (0..3).map(|i| (format!("p{i}"), 0)).collect();
        let result = alloc.allocate(requests).await;
        assert_eq!(result, Err(PortError::Exhausted));
    }

    #[tokio::test]
    async fn test_failed_allocation_rolls_back() {
        let alloc = PortAllocator::spawn((21070, 21080));
        // Second request collides with itself being requested twice.
        let result = alloc
            .allocate(BTreeMap::from([
                ("a".to_string(), 21075),
                ("b".to_string(), 21075),
            ]))
            .await;
        assert_eq!(result, Err(PortError::Unavailable(21075)));

        // The first grant was rolled back.
        let again = alloc
            .allocate(BTreeMap::from([("a".to_string(), 21075)]))
            .await
            .unwrap();
        assert_eq!(again["a"], 21075);
    }
}
