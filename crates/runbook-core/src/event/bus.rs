//! Broadcast bus for `RunEvent` notifications.
//!
//! Front ends subscribe to follow a run as it advances. Publishing with no
//! subscribers is a no-op, so the engine never waits on observers.

use runbook_types::event::RunEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for run events.
///
/// Cloning the bus clones the sender; every clone feeds the same channel.
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        tracing::trace!(event = event.name(), "run event");
        let _ = self.sender.send(event);
    }

    pub fn sender(&self) -> &broadcast::Sender<RunEvent> {
        &self.sender
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

    fn completed() -> RunEvent {
        RunEvent::RunCompleted {
            run_id: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(RunEvent::IterationPass {
            run_id: Uuid::now_v7(),
            block: "hosts".to_string(),
            iteration: 2,
        });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, RunEvent::IterationPass { iteration: 2, .. }));
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_a_copy() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(completed());
        assert_eq!(rx1.recv().await.unwrap().name(), "run_completed");
        assert_eq!(rx2.recv().await.unwrap().name(), "run_completed");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(completed());
        bus.publish(completed());
    }

    #[test]
    fn test_lagged_receiver() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(completed());
        }
        match rx.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_clone_shares_channel() {
        let bus = EventBus::new(16);
        let clone = bus.clone();
        let mut rx = bus.subscribe();
        clone.publish(completed());
        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
