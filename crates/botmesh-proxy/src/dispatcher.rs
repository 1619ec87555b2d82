//! [`Dispatcher`] – the single consumer of the [`EventBus`][crate::bus::EventBus].
//!
//! Applies broker confirmations to the registry and completes every deferred
//! caller for a topic key in one batch.  Broker messages are handed to the
//! [`Notifier`].

use botmesh_types::{ProxyError, TopicKey};
use tracing::{debug, info, warn};

use crate::bus::{BrokerEvent, EventStream};
use crate::notifier::Notifier;
use crate::registry::{Registry, complete_all};

#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    notifier: Notifier,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`, delivering through `notifier`.
    pub fn new(registry: Registry, notifier: Notifier) -> Self {
        Self { registry, notifier }
    }

    /// Consume events until every bus handle is dropped.
    pub async fn run(self, mut stream: EventStream) {
        while let Some(event) = stream.recv().await {
            self.handle(event);
        }
        info!("event bus closed; dispatcher stopping");
    }

    /// Apply one event.  Returns the number of callers completed, or the
    /// number of notifications dispatched for a message.
    pub fn handle(&self, event: BrokerEvent) -> usize {
        match event {
            BrokerEvent::Subscribed { key } => {
                let handles = self.registry.lock().promote(&key);
                if handles.is_empty() {
                    warn!(topic_key = %key, "subscribe confirmation for a key that is not pending");
                    return 0;
                }
                let completed = complete_all(handles, &Ok(()));
                info!(topic_key = %key, callers = completed, "topic active");
                completed
            }
            BrokerEvent::SubscribeFailed { key, error } => {
                let handles = self.registry.lock().abort_pending(&key);
                if handles.is_empty() {
                    warn!(topic_key = %key, error = %error, "subscribe failure for a key that is not pending");
                    return 0;
                }
                let completed = complete_all(handles, &Err(error.clone()));
                warn!(topic_key = %key, error = %error, callers = completed, "subscribe failed");
                completed
            }
            BrokerEvent::Message { key, payload } => {
                let sent = self.notifier.notify(&key, &payload);
                debug!(topic_key = %key, notified = sent, "broker message handled");
                sent
            }
        }
    }
}

/// Abort a pending key locally when its outcome cannot travel over the bus.
pub(crate) fn abort_locally(registry: &Registry, key: &TopicKey, error: ProxyError) {
    let handles = registry.lock().abort_pending(key);
    let completed = complete_all(handles, &Err(error.clone()));
    warn!(topic_key = %key, error = %error, callers = completed, "pending subscribe aborted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Admission;
    use botmesh_types::{BrokerIdentity, SubscriberEndpoint};
    use bytes::Bytes;

    fn setup() -> (Registry, Dispatcher) {
        let registry = Registry::new();
        let notifier = Notifier::new(registry.clone(), reqwest::Client::new());
        let dispatcher = Dispatcher::new(registry.clone(), notifier);
        (registry, dispatcher)
    }

    fn key() -> TopicKey {
        TopicKey::new(BrokerIdentity::new("localhost", 1883), "robots/+/status")
    }

    fn admit(registry: &Registry, port: u16) -> tokio::sync::oneshot::Receiver<Result<(), ProxyError>> {
        match registry.lock().admit(&key(), SubscriberEndpoint::new("127.0.0.1", port)) {
            Admission::Lead(rx) | Admission::Queued(rx) => rx,
            Admission::Registered => panic!("unexpected Registered"),
        }
    }

    #[tokio::test]
    async fn subscribed_completes_every_queued_caller() {
        let (registry, dispatcher) = setup();
        let receivers: Vec<_> = (1..=3).map(|p| admit(&registry, p)).collect();

        assert_eq!(dispatcher.handle(BrokerEvent::Subscribed { key: key() }), 3);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Ok(()));
        }
        assert!(registry.lock().is_active(&key()));
        assert_eq!(registry.lock().subscribers(&key()).len(), 3);
    }

    #[tokio::test]
    async fn subscribe_failed_fails_every_caller_and_clears_pending() {
        let (registry, dispatcher) = setup();
        let a = admit(&registry, 1);
        let b = admit(&registry, 2);
        let error = ProxyError::BrokerSubscribe("refused".into());

        let completed = dispatcher.handle(BrokerEvent::SubscribeFailed {
            key: key(),
            error: error.clone(),
        });
        assert_eq!(completed, 2);
        assert_eq!(a.await.unwrap(), Err(error.clone()));
        assert_eq!(b.await.unwrap(), Err(error));
        assert!(!registry.lock().is_pending(&key()));
        assert!(!registry.lock().is_active(&key()));
    }

    #[test]
    fn confirmation_for_unknown_key_is_ignored() {
        let (registry, dispatcher) = setup();
        assert_eq!(dispatcher.handle(BrokerEvent::Subscribed { key: key() }), 0);
        assert!(!registry.lock().is_active(&key()));
    }

    #[tokio::test]
    async fn message_for_inactive_topic_notifies_nobody() {
        let (_registry, dispatcher) = setup();
        let sent = dispatcher.handle(BrokerEvent::Message {
            key: key(),
            payload: Bytes::from_static(b"x"),
        });
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn abort_locally_fails_callers() {
        let (registry, _dispatcher) = setup();
        let rx = admit(&registry, 1);
        abort_locally(&registry, &key(), ProxyError::Channel("bus closed".into()));
        assert!(matches!(rx.await.unwrap(), Err(ProxyError::Channel(_))));
        assert!(!registry.lock().is_pending(&key()));
    }
}
