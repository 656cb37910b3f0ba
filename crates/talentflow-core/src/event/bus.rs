//! Broadcast bus for `WorkflowEvent`.
//!
//! Publishing with no active subscribers is a no-op; the engine never waits
//! on observers.

use talentflow_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for engine and gateway events.
///
/// Cloning the bus clones the sender, so every clone publishes into the
/// same channel.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn suspended(instance_id: Uuid) -> WorkflowEvent {
        WorkflowEvent::InstanceSuspended { instance_id }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.clone().subscribe();
        let id = Uuid::now_v7();

        bus.publish(suspended(id));

        assert_eq!(rx1.recv().await.unwrap().instance_id(), id);
        assert_eq!(rx2.recv().await.unwrap().instance_id(), id);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        for _ in 0..10 {
            bus.publish(suspended(Uuid::now_v7()));
        }
    }

    #[test]
    fn lagged_receiver_reports_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(suspended(Uuid::now_v7()));
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[test]
    fn debug_shows_receiver_count() {
        let bus = EventBus::new(16);
        let _rx = bus.subscribe();
        assert!(format!("{bus:?}").contains("receiver_count: 1"));
    }
}
