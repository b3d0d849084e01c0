//! In-memory event bus for tests/dev.

use std::sync::{mpsc, Mutex};

use crate::bus::{EventBus, Subscription};
use crate::message::Message;

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// - No IO / no async
/// - Best-effort fan-out
/// - At-least-once acceptable (subscribers must be idempotent)
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    subscribers: Mutex<Vec<mpsc::Sender<Message>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for InMemoryEventBus {
    type Error = InMemoryBusError;

    fn publish(&self, message: Message) -> Result<(), Self::Error> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();

        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fans_out_to_every_subscriber() {
        let bus = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        let event = Message::event("UserRegistered", json!({"id": "U1"})).unwrap();
        bus.publish(event.clone()).unwrap();

        assert_eq!(a.try_recv().unwrap().id(), event.id());
        assert_eq!(b.try_recv().unwrap().id(), event.id());
    }

    #[test]
    fn prunes_dropped_subscribers() {
        let bus = InMemoryEventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(Message::event("E", json!({})).unwrap()).unwrap();
        assert!(keep.try_recv().is_ok());
    }
}
