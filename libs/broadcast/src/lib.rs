//! Broadcaster capability.
//!
//! Components that own state (the agent's container registry, the
//! scheduler's job registry, agent representations, the proxy) expose the
//! same three-operation surface: `subscribe`, `unsubscribe`, `snapshot`.
//! Subscriptions are plain mpsc sink channels held by the emitter; there
//! are no back-references, and unsubscribe removes the channel from the
//! set.
//!
//! Sends to a sink are bounded by a millisecond-scale timeout. A
//! subscriber that blocks past it is a programmer error (a slow consumer
//! inside the control plane), not backpressure: every broadcast is a
//! complete snapshot, so a dropped delivery is recoverable by the next
//! one, and keeping the emitter's event loop healthy matters more.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use convoy_types::fault::invariant_violation;

/// How long a sink send may block before the subscriber counts as broken.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(25);

/// The broadcaster capability, parameterized by the carried type.
///
/// Implementations route through their owning worker, so a snapshot
/// observed after a mutation always reflects that mutation.
#[async_trait]
pub trait Broadcast<T: Clone + Send + 'static>: Send + Sync {
    /// Register a sink. Implementations push their current snapshot to
    /// it up front once they have one.
    async fn subscribe(&self, sink: mpsc::Sender<T>);

    /// Remove a sink from the set.
    async fn unsubscribe(&self, sink: mpsc::Sender<T>);

    /// Current state.
    async fn snapshot(&self) -> T;
}

/// The sink set an emitter owns.
///
/// Lives inside the emitter's worker; all mutation happens there.
pub struct SinkSet<T> {
    component: &'static str,
    sinks: Vec<mpsc::Sender<T>>,
    send_timeout: Duration,
}

impl<T: Clone> SinkSet<T> {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            sinks: Vec::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(component: &'static str, send_timeout: Duration) -> Self {
        Self {
            component,
            sinks: Vec::new(),
            send_timeout,
        }
    }

    pub fn add(&mut self, sink: mpsc::Sender<T>) {
        self.sinks.push(sink);
    }

    /// Remove the sink sharing a channel with `sink`.
    pub fn remove(&mut self, sink: &mpsc::Sender<T>) {
        self.sinks.retain(|s| !s.same_channel(sink));
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Deliver `value` to every current subscriber.
    ///
    /// Closed sinks are dropped from the set. A sink that stays full past
    /// the send timeout trips the invariant-violation policy.
    pub async fn publish(&mut self, value: T) {
        let mut closed = Vec::new();
        for (idx, sink) in self.sinks.iter().enumerate() {
            match sink.send_timeout(value.clone(), self.send_timeout).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    closed.push(idx);
                }
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    invariant_violation(
                        self.component,
                        "subscriber blocked past the broadcast send timeout",
                    );
                }
            }
        }
        for idx in closed.into_iter().rev() {
            debug!(component = self.component, "dropping closed subscriber");
            self.sinks.remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_sinks() {
        let mut set = SinkSet::new("test");
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        set.add(tx1);
        set.add(tx2);

        set.publish(7u32).await;
        assert_eq!(rx1.recv().await, Some(7));
        assert_eq!(rx2.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_closed_sinks_are_dropped() {
        let mut set = SinkSet::new("test");
        let (tx, rx) = mpsc::channel::<u32>(4);
        set.add(tx);
        drop(rx);

        set.publish(1).await;
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_by_channel() {
        let mut set = SinkSet::new("test");
        let (tx, mut rx) = mpsc::channel(4);
        set.add(tx.clone());
        assert_eq!(set.len(), 1);

        set.remove(&tx);
        assert!(set.is_empty());

        set.publish(1u32).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    #[should_panic(expected = "blocked past the broadcast send timeout")]
    async fn test_slow_subscriber_is_fatal() {
        let mut set = SinkSet::with_send_timeout("test", Duration::from_millis(5));
        let (tx, _rx) = mpsc::channel(1);
        set.add(tx);

        set.publish(1u32).await; // fills the buffer
        set.publish(2u32).await; // nobody drains: trips the policy
    }
}
