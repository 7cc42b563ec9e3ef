use tokio::sync::broadcast::{Receiver, Sender};
use uuid::Uuid;

/// Fire-and-forget notifications for cache layers. Losing an event is
/// harmless; readers always validate against the vector store before
/// advancing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ChainInvalidated { chain_id: Uuid },
    MemoryInvalidated { memory_uuid: Uuid },
}

pub struct EventBus {
    sender: Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish without caring whether anyone is listening.
    pub fn publish(&self, event: Event) {
        self.sender.send(event).ok();
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_invalidations() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let chain_id = Uuid::new_v4();
        bus.publish(Event::ChainInvalidated { chain_id });
        assert_eq!(rx.recv().await.unwrap(), Event::ChainInvalidated { chain_id });
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(Event::MemoryInvalidated {
            memory_uuid: Uuid::new_v4(),
        });
    }
}
