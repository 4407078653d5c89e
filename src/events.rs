//! Typed notifications between components
//!
//! Every subscriber owns a bounded queue. Events only tell a consumer that
//! shared state moved; the consumer re-reads that state, so an event dropped
//! on a full queue costs nothing but a redundant wake-up later.

use crate::blockchain::{short_hash, Hash256};
use crate::fetch::ConnectionId;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    BestHeadChanged { hash: Hash256, height: u32 },
    UtxoChanged { hash: Hash256, height: u32 },
    BlockAvailable { hash: Hash256 },
    BlockDownloaded { hash: Hash256, connection: ConnectionId },
}

impl fmt::Display for ChainEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainEvent::BestHeadChanged { hash, height } => {
                write!(f, "best head {} at {}", short_hash(hash), height)
            }
            ChainEvent::UtxoChanged { hash, height } => {
                write!(f, "utxo head {} at {}", short_hash(hash), height)
            }
            ChainEvent::BlockAvailable { hash } => write!(f, "block {} available", short_hash(hash)),
            ChainEvent::BlockDownloaded { hash, connection } => {
                write!(f, "block {} from {}", short_hash(hash), connection)
            }
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ChainEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, capacity: usize) -> Receiver<ChainEvent> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber without blocking. Subscribers whose
    /// receiver is gone are dropped.
    pub fn publish(&self, event: ChainEvent) {
        trace!("event: {}", event);
        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe(4);
        let b = bus.subscribe(4);

        let event = ChainEvent::BlockAvailable { hash: [1; 32] };
        bus.publish(event.clone());
        assert_eq!(a.try_recv().unwrap(), event);
        assert_eq!(b.try_recv().unwrap(), event);
    }

    #[test]
    fn test_full_queue_drops_and_closed_queue_unsubscribes() {
        let bus = EventBus::new();
        let slow = bus.subscribe(1);
        let gone = bus.subscribe(1);
        drop(gone);

        bus.publish(ChainEvent::UtxoChanged { hash: [1; 32], height: 1 });
        bus.publish(ChainEvent::UtxoChanged { hash: [2; 32], height: 2 });

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(
            slow.try_recv().unwrap(),
            ChainEvent::UtxoChanged { hash: [1; 32], height: 1 }
        );
        assert!(slow.try_recv().is_err());
    }
}
