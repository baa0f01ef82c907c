//! In-process event publication (mechanics only).
//!
//! Post-append notification path between the command handler and the
//! dispatcher inboxes. At-least-once delivery; consumers dedupe by event id.

use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use thiserror::Error;

/// A subscription to a published message stream.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Block up to `timeout`; worker loops use this to interleave shutdown
    /// checks with consumption.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("subscriber registry lock poisoned")]
    Poisoned,
}

/// Domain-agnostic pub/sub contract.
///
/// No storage, transport, or threading assumptions. Durability never depends
/// on this path: events are appended before publication, and catch-up
/// polling covers missed notifications.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), PublishError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), PublishError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}

/// In-memory fan-out bus.
///
/// Best-effort: dead subscribers are dropped during publish, and a
/// poisoned registry only mutes notifications (durability is unaffected).
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    fn publish(&self, message: M) -> Result<(), PublishError> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| PublishError::Poisoned)?;

        subs.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(_) => {
                tracing::warn!("event bus registry poisoned; subscription will stay silent");
            }
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_fan_out_to_all_subscribers() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(a.try_recv(), Ok(7));
        assert_eq!(b.try_recv(), Ok(7));
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        drop(bus.subscribe());
        let live = bus.subscribe();

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(live.try_recv(), Ok(1));
        assert_eq!(live.try_recv(), Ok(2));
    }
}
