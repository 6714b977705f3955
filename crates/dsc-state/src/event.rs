//! # Event Router
//!
//! Lifecycle events are published onto a broadcast channel after the
//! entity they describe has been persisted. Subscribers consume at their
//! own pace; a slow subscriber lags and loses old events rather than
//! blocking the manager, and publishing with no subscribers is not an
//! error.

use tokio::sync::broadcast;

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;

/// Fan-out of lifecycle events to independent subscribers.
#[derive(Debug, Clone)]
pub struct EventRouter<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> Default for EventRouter<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E: Clone> EventRouter<E> {
    /// A router buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of subscribers it reached.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// A new subscriber receiving events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let router: EventRouter<u32> = EventRouter::default();
        assert_eq!(router.publish(1), 0);
    }

    #[test]
    fn every_subscriber_sees_each_event() {
        let router = EventRouter::new(8);
        let mut a = router.subscribe();
        let mut b = router.subscribe();
        assert_eq!(router.publish("provisioned"), 2);
        assert_eq!(a.try_recv().unwrap(), "provisioned");
        assert_eq!(b.try_recv().unwrap(), "provisioned");
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscriber_receives_asynchronously() {
        let router = EventRouter::new(8);
        let mut rx = router.subscribe();
        let publisher = router.clone();
        tokio::spawn(async move {
            publisher.publish(7u8);
        });
        assert_eq!(rx.recv().await.unwrap(), 7);
    }
}
