//! Event bus coupling broker activity back into the proxy.
//!
//! Broker agents never touch the registry.  They publish [`BrokerEvent`]s
//! here, and a single [`Dispatcher`][crate::dispatcher::Dispatcher] task
//! consumes them in order:
//!
//! | Event | Effect |
//! |---|---|
//! | [`BrokerEvent::Subscribed`] | Pending key promoted, deferred callers succeed |
//! | [`BrokerEvent::SubscribeFailed`] | Pending key aborted, deferred callers fail |
//! | [`BrokerEvent::Message`] | Payload fanned out to subscribers |
//!
//! The channel is unbounded: a confirmation must never be dropped for a slow
//! consumer, or its callers would wait forever.

use botmesh_types::{ProxyError, TopicKey};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Something a broker agent observed.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// The broker acknowledged a subscription.
    Subscribed { key: TopicKey },
    /// The broker rejected a subscription or could not be reached.
    SubscribeFailed { key: TopicKey, error: ProxyError },
    /// The broker delivered a message on a subscribed topic.
    Message { key: TopicKey, payload: Bytes },
}

/// Publishing side of the bus.  Clone it cheaply; all clones feed the same
/// [`EventStream`].
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<BrokerEvent>,
}

/// Receiving side of the bus, owned by the dispatcher.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<BrokerEvent>,
}

impl EventBus {
    /// Create a bus and the single stream that drains it.
    pub fn new() -> (Self, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, EventStream { receiver })
    }

    /// Publish an event.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Channel`] once the dispatcher has shut down.
    pub fn publish(&self, event: BrokerEvent) -> Result<(), ProxyError> {
        self.sender
            .send(event)
            .map_err(|e| ProxyError::Channel(format!("event bus send error: {e}")))
    }
}

impl EventStream {
    /// Wait for the next event.  Returns `None` once every [`EventBus`]
    /// handle has been dropped.
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        self.receiver.recv().await
    }
}
