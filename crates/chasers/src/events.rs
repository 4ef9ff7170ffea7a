//! The typed publish/subscribe fabric carrying chase notifications.

use rbit_interfaces::events::Chase;
use tokio::sync::broadcast;
use tracing::trace;

/// Multi-producer, multi-subscriber chase event publication.
///
/// Delivery is in publication order per subscriber. Subscribers on other
/// tasks receive through their own queue; a subscriber that falls behind the
/// configured capacity observes a lag and must treat it as a stop.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Chase>,
}

impl EventBus {
    /// Creates a bus with the given queue depth per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Publication without subscribers is not an error: every consumer
    /// re-derives its position from the archive on start, so events dropped
    /// across startup or teardown are recovered.
    pub fn publish(&self, event: Chase) {
        trace!(target: "chasers::events", ?event, "publish");
        let _ = self.sender.send(event);
    }

    /// Subscribes to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<Chase> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(Chase::Header { branch_point: 1 });
        bus.publish(Chase::Checked { height: 2 });
        bus.publish(Chase::Bump);

        assert_eq!(rx.recv().await.unwrap(), Chase::Header { branch_point: 1 });
        assert_eq!(rx.recv().await.unwrap(), Chase::Checked { height: 2 });
        assert_eq!(rx.recv().await.unwrap(), Chase::Bump);
    }

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Chase::Download { added: 7 });

        assert_eq!(a.recv().await.unwrap(), Chase::Download { added: 7 });
        assert_eq!(b.recv().await.unwrap(), Chase::Download { added: 7 });
    }

    #[test]
    fn publish_without_subscribers_is_benign() {
        let bus = EventBus::new(4);
        bus.publish(Chase::Bump);
        assert_eq!(bus.subscribers(), 0);
    }
}
