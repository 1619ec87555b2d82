//! Shared fixtures: a scriptable broker connector and an in-process ingress
//! router.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, header};
use botmesh_proxy::{
    AppState, BrokerAgent, BrokerAgentManager, BrokerConnector, Dispatcher, EventBus, Notifier,
    Registry, build_router,
};
use botmesh_types::{BrokerIdentity, ProxyError, SubscribeOutcome, TopicKey};
use tokio::sync::Semaphore;

/// Broker double.  Every subscribe is counted, then held until the test
/// releases it; the released call answers with the next scripted outcome,
/// or success when the script is empty.
#[derive(Clone)]
pub struct ScriptedBroker {
    pub calls: Arc<AtomicUsize>,
    gate: Arc<Semaphore>,
    script: Arc<Mutex<VecDeque<SubscribeOutcome>>>,
    bus: Arc<Mutex<Option<EventBus>>>,
}

impl ScriptedBroker {
    /// Subscribes block until [`release`](Self::release) is called.
    pub fn gated() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Semaphore::new(0)),
            script: Arc::default(),
            bus: Arc::default(),
        }
    }

    /// Subscribes complete as soon as they are issued.
    pub fn immediate() -> Self {
        let broker = Self::gated();
        broker.gate.add_permits(Semaphore::MAX_PERMITS / 2);
        broker
    }

    pub fn push_outcome(&self, outcome: SubscribeOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn subscribe_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The bus handed to the most recently connected agent.
    pub fn bus(&self) -> EventBus {
        self.bus.lock().unwrap().clone().expect("no agent connected yet")
    }
}

struct ScriptedAgent {
    identity: BrokerIdentity,
    broker: ScriptedBroker,
}

#[async_trait]
impl BrokerAgent for ScriptedAgent {
    fn identity(&self) -> &BrokerIdentity {
        &self.identity
    }

    async fn subscribe(&self, _topic: &str) -> Result<(), ProxyError> {
        self.broker.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .broker
            .gate
            .acquire()
            .await
            .map_err(|e| ProxyError::BrokerUnreachable(e.to_string()))?;
        permit.forget();
        self.broker
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

impl BrokerConnector for ScriptedBroker {
    fn connect(
        &self,
        identity: &BrokerIdentity,
        bus: EventBus,
    ) -> Result<Arc<dyn BrokerAgent>, ProxyError> {
        identity.validate()?;
        *self.bus.lock().unwrap() = Some(bus);
        Ok(Arc::new(ScriptedAgent {
            identity: identity.clone(),
            broker: self.clone(),
        }))
    }
}

pub fn default_broker() -> BrokerIdentity {
    BrokerIdentity::new("localhost", 1883)
}

pub fn topic_key(topic: &str) -> TopicKey {
    TopicKey::new(default_broker(), topic)
}

/// Router wired to a running dispatcher.  Every request appears to come
/// from `127.0.0.1`.
pub fn router(broker: &ScriptedBroker) -> (Router, Registry) {
    let registry = Registry::new();
    let (bus, stream) = EventBus::new();
    let http = reqwest::Client::new();
    let brokers = Arc::new(BrokerAgentManager::new(Arc::new(broker.clone()), bus.clone()));
    let dispatcher = Dispatcher::new(registry.clone(), Notifier::new(registry.clone(), http.clone()));
    tokio::spawn(dispatcher.run(stream));

    let state = AppState {
        registry: registry.clone(),
        brokers,
        bus,
        default_broker: default_broker(),
        http,
    };
    let router = build_router(state).layer(MockConnectInfo(SocketAddr::from((
        [127, 0, 0, 1],
        40000,
    ))));
    (router, registry)
}

pub fn form_request(fields: &[(&str, &str)]) -> Request<Body> {
    let body = serde_urlencoded::to_string(fields).unwrap();
    Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

pub fn subscribe_request(topic: &str, port: u16) -> Request<Body> {
    let message = serde_json::json!({ "topic": topic, "port": port }).to_string();
    form_request(&[("protocol", "mqtt"), ("message", &message)])
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
