//! Per-container log history and fan-out.
//!
//! Each container gets a bounded ring of recent output lines. Subscribers
//! receive new lines as they arrive; the ring answers tail queries for
//! the recent history. One worker serializes all of it.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use convoy_broadcast::SinkSet;

/// Lines of history kept per container.
pub const RING_CAPACITY: usize = 1024;

/// One log line with its source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

enum RouterMessage {
    Push {
        id: String,
        line: LogLine,
    },
    Tail {
        id: String,
        n: usize,
        reply: oneshot::Sender<Vec<LogLine>>,
    },
    Subscribe {
        id: String,
        sink: mpsc::Sender<LogLine>,
    },
    Unsubscribe {
        id: String,
        sink: mpsc::Sender<LogLine>,
    },
    Remove {
        id: String,
    },
}

struct Ring {
    lines: VecDeque<LogLine>,
    sinks: SinkSet<LogLine>,
}

impl Ring {
    fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            sinks: SinkSet::new("logring"),
        }
    }
}

/// Handle to the log router worker.
#[derive(Clone)]
pub struct LogRouter {
    tx: mpsc::Sender<RouterMessage>,
}

impl LogRouter {
    /// Spawn the router worker.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Append one line to a container's ring.
    pub async fn push(&self, id: &str, stream: LogStream, line: String) {
        let _ = self
            .tx
            .send(RouterMessage::Push {
                id: id.to_string(),
                line: LogLine { stream, line },
            })
            .await;
    }

    /// Last `n` lines of a container's history.
    pub async fn tail(&self, id: &str, n: usize) -> Vec<LogLine> {
        let (reply, rx) = oneshot::channel();
        let msg = RouterMessage::Tail {
            id: id.to_string(),
            n,
            reply,
        };
        if self.tx.send(msg).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn subscribe(&self, id: &str, sink: mpsc::Sender<LogLine>) {
        let _ = self
            .tx
            .send(RouterMessage::Subscribe {
                id: id.to_string(),
                sink,
            })
            .await;
    }

    pub async fn unsubscribe(&self, id: &str, sink: mpsc::Sender<LogLine>) {
        let _ = self
            .tx
            .send(RouterMessage::Unsubscribe {
                id: id.to_string(),
                sink,
            })
            .await;
    }

    /// Drop a container's ring and subscribers.
    pub async fn remove(&self, id: &str) {
        let _ = self
            .tx
            .send(RouterMessage::Remove { id: id.to_string() })
            .await;
    }
}

async fn run(mut rx: mpsc::Receiver<RouterMessage>) {
    let mut rings: HashMap<String, Ring> = HashMap::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            RouterMessage::Push { id, line } => {
                let ring = rings.entry(id).or_insert_with(Ring::new);
                if ring.lines.len() == RING_CAPACITY {
                    ring.lines.pop_front();
                }
                ring.lines.push_back(line.clone());
                ring.sinks.publish(line).await;
            }
            RouterMessage::Tail { id, n, reply } => {
                let lines = rings
                    .get(&id)
                    .map(|r| r.lines.iter().rev().take(n).rev().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(lines);
            }
            RouterMessage::Subscribe { id, sink } => {
                rings.entry(id).or_insert_with(Ring::new).sinks.add(sink);
            }
            RouterMessage::Unsubscribe { id, sink } => {
                if let Some(ring) = rings.get_mut(&id) {
                    ring.sinks.remove(&sink);
                }
            }
            RouterMessage::Remove { id } => {
                debug!(container_id = %id, "dropping log ring");
                rings.remove(&id);
            }
        }
    }
}
