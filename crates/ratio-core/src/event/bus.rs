//! Broadcast event bus for `EngineEvent`s.
//!
//! Publishing with no active subscribers is a no-op. Subscribers that fall
//! behind skip the lost events instead of failing.

use ratio_types::event::EngineEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Multi-consumer bus shared by every instance actor of a runtime.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Receive future events of a single instance.
    pub fn subscribe_instance(&self, instance_id: Uuid) -> InstanceEvents {
        InstanceEvents {
            instance_id,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
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

/// A subscription filtered to one instance.
pub struct InstanceEvents {
    instance_id: Uuid,
    receiver: broadcast::Receiver<EngineEvent>,
}

impl InstanceEvents {
    /// Next event for this instance, or `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.instance_id() == self.instance_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        instance_id = %self.instance_id,
                        skipped,
                        "event subscriber lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
