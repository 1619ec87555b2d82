//! [`MqttAgent`] – a [`BrokerAgent`] backed by a `rumqttc` connection.
//!
//! Each agent owns one `AsyncClient` and drives its `EventLoop` on a
//! dedicated Tokio task.  The loop:
//!
//! 1. Pairs every outgoing SUBSCRIBE packet id with the topic that was queued
//!    for it, then resolves the waiting caller when the SUBACK arrives.
//! 2. Publishes every inbound PUBLISH as a [`BrokerEvent::Message`].
//! 3. On a connection error, fails every subscribe still in flight and keeps
//!    polling with a capped backoff so `rumqttc` can reconnect.
//! 4. After a reconnect without a stored session, re-issues every
//!    subscription the broker had confirmed.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use botmesh_types::{BrokerIdentity, ProxyError, TopicKey};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerAgent, BrokerConnector};
use crate::bus::{BrokerEvent, EventBus};
use crate::config::MqttSettings;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

type Reply = oneshot::Sender<Result<(), ProxyError>>;

struct InFlight {
    topic: String,
    reply: Reply,
}

// ---------------------------------------------------------------------------
// Subscribe correlation
// ---------------------------------------------------------------------------

/// Correlates subscribe requests with their SUBACKs.
///
/// Requests enter `queued` in the same order they enter the client's request
/// channel, so each `Outgoing::Subscribe(pkid)` belongs to the front entry.
#[derive(Default)]
struct SubscribeTracker {
    queued: VecDeque<InFlight>,
    awaiting_ack: HashMap<u16, InFlight>,
    // Requests already failed locally but still sitting in the client
    // channel; their packet ids must not be paired with newer requests.
    orphaned: usize,
    confirmed: BTreeSet<String>,
    connected_once: bool,
}

impl SubscribeTracker {
    fn on_outgoing_subscribe(&mut self, pkid: u16) {
        if self.orphaned > 0 {
            self.orphaned -= 1;
            return;
        }
        if let Some(request) = self.queued.pop_front() {
            self.awaiting_ack.insert(pkid, request);
        }
    }

    fn on_suback(&mut self, ack: &SubAck) -> Option<(String, Result<(), ProxyError>)> {
        let request = self.awaiting_ack.remove(&ack.pkid)?;
        let outcome = match ack.return_codes.first() {
            Some(SubscribeReasonCode::Success(_)) => Ok(()),
            Some(SubscribeReasonCode::Failure) => Err(ProxyError::BrokerSubscribe(format!(
                "broker refused subscription to '{}'",
                request.topic
            ))),
            None => Err(ProxyError::BrokerSubscribe(format!(
                "empty SUBACK for '{}'",
                request.topic
            ))),
        };
        let topic = request.topic.clone();
        if outcome.is_ok() {
            self.confirmed.insert(topic.clone());
        }
        let _ = request.reply.send(outcome.clone());
        Some((topic, outcome))
    }

    fn fail_all(&mut self, error: &ProxyError) -> usize {
        let queued = std::mem::take(&mut self.queued);
        self.orphaned += queued.len();
        let mut failed = 0;
        for request in queued
            .into_iter()
            .chain(self.awaiting_ack.drain().map(|(_, r)| r))
        {
            let _ = request.reply.send(Err(error.clone()));
            failed += 1;
        }
        failed
    }

    /// Topics to re-issue after a ConnAck.  Empty on the first connection or
    /// when the broker kept the session.
    fn on_connack(&mut self, session_present: bool) -> Vec<String> {
        let reconnect = std::mem::replace(&mut self.connected_once, true);
        if !reconnect || session_present {
            return Vec::new();
        }
        self.confirmed.iter().cloned().collect()
    }
}

/// Queue a subscribe on `client` and register it with `tracker`.  The lock
/// is held across the enqueue so request order matches tracker order.
fn enqueue_subscribe(
    client: &AsyncClient,
    tracker: &mut SubscribeTracker,
    topic: &str,
    reply: Reply,
) -> Result<(), rumqttc::ClientError> {
    client.try_subscribe(topic, QoS::AtMostOnce)?;
    tracker.queued.push_back(InFlight {
        topic: topic.to_string(),
        reply,
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Agent and connector
// ---------------------------------------------------------------------------

/// A live connection to one MQTT broker.
pub struct MqttAgent {
    identity: BrokerIdentity,
    client: AsyncClient,
    tracker: Arc<Mutex<SubscribeTracker>>,
}

impl MqttAgent {
    fn tracker(&self) -> MutexGuard<'_, SubscribeTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BrokerAgent for MqttAgent {
    fn identity(&self) -> &BrokerIdentity {
        &self.identity
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ProxyError> {
        let (reply, outcome) = oneshot::channel();
        enqueue_subscribe(&self.client, &mut self.tracker(), topic, reply)
            .map_err(|e| ProxyError::BrokerUnreachable(format!("{}: {e}", self.identity)))?;
        debug!(broker = %self.identity, topic = %topic, "subscribe sent");
        outcome.await.map_err(|_| {
            ProxyError::BrokerUnreachable(format!("{}: agent stopped", self.identity))
        })?
    }
}

/// Creates [`MqttAgent`]s from [`MqttSettings`].
#[derive(Debug, Clone)]
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    /// Create a connector applying `settings` to every connection.
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self, identity: &BrokerIdentity) -> MqttOptions {
        let client_id = format!("{}-{}", self.settings.client_id_prefix, Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, identity.host.clone(), identity.port);
        options.set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs));
        options
    }
}

impl BrokerConnector for MqttConnector {
    fn connect(
        &self,
        identity: &BrokerIdentity,
        bus: EventBus,
    ) -> Result<Arc<dyn BrokerAgent>, ProxyError> {
        identity.validate()?;
        let (client, eventloop) =
            AsyncClient::new(self.options(identity), self.settings.request_capacity);
        let tracker = Arc::new(Mutex::new(SubscribeTracker::default()));

        tokio::spawn(drive(
            eventloop,
            client.clone(),
            identity.clone(),
            Arc::clone(&tracker),
            bus,
        ));

        Ok(Arc::new(MqttAgent {
            identity: identity.clone(),
            client,
            tracker,
        }))
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    identity: BrokerIdentity,
    tracker: Arc<Mutex<SubscribeTracker>>,
    bus: EventBus,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                backoff = INITIAL_BACKOFF;
                if let Err(e) = handle_event(&client, &identity, &tracker, &bus, event) {
                    warn!(broker = %identity, error = %e, "event bus closed; stopping broker agent");
                    return;
                }
            }
            Err(ConnectionError::RequestsDone) => {
                info!(broker = %identity, "broker agent dropped; stopping event loop");
                return;
            }
            Err(e) => {
                let error = ProxyError::BrokerUnreachable(format!("{identity}: {e}"));
                let failed = tracker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .fail_all(&error);
                warn!(
                    broker = %identity,
                    error = %e,
                    failed_subscribes = failed,
                    backoff_ms = backoff.as_millis() as u64,
                    "MQTT connection error"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn handle_event(
    client: &AsyncClient,
    identity: &BrokerIdentity,
    tracker: &Mutex<SubscribeTracker>,
    bus: &EventBus,
    event: Event,
) -> Result<(), ProxyError> {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) => {
            info!(broker = %identity, "listening to MQTT broker");
            let mut tracker = tracker.lock().unwrap_or_else(PoisonError::into_inner);
            for topic in tracker.on_connack(ack.session_present) {
                // Nobody waits on a resubscribe; its SUBACK is only logged.
                let (reply, _) = oneshot::channel();
                if let Err(e) = enqueue_subscribe(client, &mut tracker, &topic, reply) {
                    warn!(broker = %identity, topic = %topic, error = %e, "resubscribe failed");
                }
            }
        }
        Event::Outgoing(Outgoing::Subscribe(pkid)) => {
            tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_outgoing_subscribe(pkid);
        }
        Event::Incoming(Packet::SubAck(ack)) => {
            let settled = tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_suback(&ack);
            if let Some((topic, outcome)) = settled {
                debug!(broker = %identity, topic = %topic, ok = outcome.is_ok(), "SUBACK received");
            }
        }
        Event::Incoming(Packet::Publish(publish)) => {
            let key = TopicKey::new(identity.clone(), publish.topic.clone());
            debug!(topic_key = %key, bytes = publish.payload.len(), "broker message");
            bus.publish(BrokerEvent::Message {
                key,
                payload: publish.payload,
            })?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_flight(topic: &str) -> (InFlight, oneshot::Receiver<Result<(), ProxyError>>) {
        let (reply, rx) = oneshot::channel();
        (
            InFlight {
                topic: topic.to_string(),
                reply,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn suback_success_resolves_the_matching_request() {
        let mut tracker = SubscribeTracker::default();
        let (a, rx_a) = in_flight("robots/a");
        let (b, rx_b) = in_flight("robots/b");
        tracker.queued.push_back(a);
        tracker.queued.push_back(b);

        tracker.on_outgoing_subscribe(7);
        tracker.on_outgoing_subscribe(8);

        let ack = SubAck::new(8, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        let (topic, outcome) = tracker.on_suback(&ack).unwrap();
        assert_eq!(topic, "robots/b");
        assert!(outcome.is_ok());
        assert_eq!(rx_b.await.unwrap(), Ok(()));

        let ack = SubAck::new(7, vec![SubscribeReasonCode::Failure]);
        tracker.on_suback(&ack);
        assert!(matches!(rx_a.await.unwrap(), Err(ProxyError::BrokerSubscribe(_))));
    }

    #[test]
    fn unknown_suback_is_ignored() {
        let mut tracker = SubscribeTracker::default();
        let ack = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        assert!(tracker.on_suback(&ack).is_none());
    }

    #[tokio::test]
    async fn fail_all_fails_queued_and_unacked_requests() {
        let mut tracker = SubscribeTracker::default();
        let (a, rx_a) = in_flight("a");
        let (b, rx_b) = in_flight("b");
        tracker.queued.push_back(a);
        tracker.on_outgoing_subscribe(1);
        tracker.queued.push_back(b);

        let error = ProxyError::BrokerUnreachable("down".to_string());
        assert_eq!(tracker.fail_all(&error), 2);
        assert_eq!(rx_a.await.unwrap(), Err(error.clone()));
        assert_eq!(rx_b.await.unwrap(), Err(error));
        assert_eq!(tracker.orphaned, 1);
    }

    #[tokio::test]
    async fn orphaned_packet_ids_are_not_paired_with_new_requests() {
        let mut tracker = SubscribeTracker::default();
        let (stale, _rx_stale) = in_flight("stale");
        tracker.queued.push_back(stale);
        tracker.fail_all(&ProxyError::BrokerUnreachable("down".to_string()));

        let (fresh, rx_fresh) = in_flight("fresh");
        tracker.queued.push_back(fresh);

        // The stale request leaves the client channel first.
        tracker.on_outgoing_subscribe(3);
        tracker.on_outgoing_subscribe(4);

        let ack = SubAck::new(3, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        assert!(tracker.on_suback(&ack).is_none());
        let ack = SubAck::new(4, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]);
        assert_eq!(tracker.on_suback(&ack).unwrap().0, "fresh");
        assert_eq!(rx_fresh.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn publish_packets_become_bus_messages() {
        let (bus, mut stream) = EventBus::new();
        let tracker = Mutex::new(SubscribeTracker::default());
        let identity = BrokerIdentity::new("localhost", 1883);

        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);

        let publish = rumqttc::Publish::new("robots/led", QoS::AtMostOnce, "blink");
        handle_event(
            &client,
            &identity,
            &tracker,
            &bus,
            Event::Incoming(Packet::Publish(publish)),
        )
        .unwrap();

        match stream.recv().await {
            Some(BrokerEvent::Message { key, payload }) => {
                assert_eq!(key.to_string(), "localhost:1883|robots/led");
                assert_eq!(&payload[..], b"blink");
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn confirmed_topics_are_reissued_after_a_clean_reconnect() {
        let mut tracker = SubscribeTracker::default();
        let (a, _rx_a) = in_flight("robots/a");
        tracker.queued.push_back(a);
        tracker.on_outgoing_subscribe(1);
        tracker.on_suback(&SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]));

        assert!(tracker.on_connack(false).is_empty());
        assert!(tracker.on_connack(true).is_empty());
        assert_eq!(tracker.on_connack(false), vec!["robots/a".to_string()]);
    }

    #[tokio::test]
    async fn reconnect_queues_resubscribe_requests() {
        let (bus, _stream) = EventBus::new();
        let tracker = Mutex::new(SubscribeTracker::default());
        let identity = BrokerIdentity::new("localhost", 1883);
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        tracker.lock().unwrap().confirmed.insert("robots/a".to_string());
        tracker.lock().unwrap().connected_once = true;

        let connack = rumqttc::ConnAck::new(rumqttc::ConnectReturnCode::Success, false);
        handle_event(&client, &identity, &tracker, &bus, Event::Incoming(Packet::ConnAck(connack)))
            .unwrap();
        assert_eq!(tracker.lock().unwrap().queued.len(), 1);
    }

    #[test]
    fn connector_rejects_incomplete_identity() {
        let connector = MqttConnector::new(MqttSettings::default());
        let (bus, _stream) = EventBus::new();
        let result = connector.connect(&BrokerIdentity::new("", 0), bus);
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
    }
}
