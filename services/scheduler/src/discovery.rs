//! Agent discovery.
//!
//! Discovery is just a subscribable stream of agent endpoint sets. The
//! shipped implementation is a static list from config; the trait seam
//! lets tests (or a future dynamic source) drive endpoint churn.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A subscribable source of agent endpoints.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Push the current endpoint set to `sink`, then every change.
    async fn subscribe(&self, sink: mpsc::Sender<Vec<String>>);
}

/// Fixed endpoint list from configuration.
pub struct StaticDiscovery {
    endpoints: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn subscribe(&self, sink: mpsc::Sender<Vec<String>>) {
        let _ = sink.send(self.endpoints.clone()).await;
    }
}

/// Channel-driven discovery for tests and embedding.
pub struct ChannelDiscovery {
    current: tokio::sync::Mutex<Vec<String>>,
    sinks: tokio::sync::Mutex<Vec<mpsc::Sender<Vec<String>>>>,
}

impl ChannelDiscovery {
    pub fn new(initial: Vec<String>) -> Self {
        Self {
            current: tokio::sync::Mutex::new(initial),
            sinks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Replace the endpoint set and notify subscribers.
    pub async fn update(&self, endpoints: Vec<String>) {
        *self.current.lock().await = endpoints.clone();
        let sinks = self.sinks.lock().await;
        for sink in sinks.iter() {
            let _ = sink.send(endpoints.clone()).await;
        }
    }
}

#[async_trait]
impl Discovery for ChannelDiscovery {
    async fn subscribe(&self, sink: mpsc::Sender<Vec<String>>) {
        let _ = sink.send(self.current.lock().await.clone()).await;
        self.sinks.lock().await.push(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery_pushes_once() {
        let discovery = StaticDiscovery::new(vec!["a:1".to_string(), "b:2".to_string()]);
        let (tx, mut rx) = mpsc::channel(4);
        discovery.subscribe(tx).await;

        assert_eq!(rx.recv().await.unwrap(), vec!["a:1", "b:2"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_discovery_pushes_changes() {
        let discovery = ChannelDiscovery::new(vec!["a:1".to_string()]);
        let (tx, mut rx) = mpsc::channel(4);
        discovery.subscribe(tx).await;
        assert_eq!(rx.recv().await.unwrap(), vec!["a:1"]);

        discovery.update(vec!["a:1".to_string(), "b:2".to_string()]).await;
        assert_eq!(rx.recv().await.unwrap(), vec!["a:1", "b:2"]);
    }
}
