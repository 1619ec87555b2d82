//! Ingress endpoint: one POST that is either a pass-through RPC call or a
//! topic subscription.
//!
//! The body is URL-form-encoded with three fields:
//!
//! | Field | Meaning |
//! |---|---|
//! | `protocol` | `"http"` selects pass-through; anything else selects subscribe |
//! | `uri` | Pass-through target, without scheme |
//! | `message` | JSON: request parameters, or `{topic, port, broker?}` |
//!
//! Requests are classified once into a [`ProtocolMode`] before any state is
//! touched, so a malformed request never mutates the registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use botmesh_types::{BrokerIdentity, ProxyError, SubscriberEndpoint, TopicKey};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::broker::BrokerAgentManager;
use crate::bus::{BrokerEvent, EventBus};
use crate::dispatcher::abort_locally;
use crate::error::ApiError;
use crate::registry::{Admission, Registry};

// ---------------------------------------------------------------------------
// Request classification
// ---------------------------------------------------------------------------

/// Shared state injected into ingress handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub brokers: Arc<BrokerAgentManager>,
    pub bus: EventBus,
    pub default_broker: BrokerIdentity,
    pub http: reqwest::Client,
}

/// Raw form fields, before classification.
#[derive(Debug, Default, Deserialize)]
pub struct IngressForm {
    pub protocol: Option<String>,
    pub uri: Option<String>,
    pub message: Option<String>,
}

/// What an ingress request asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMode {
    PassThrough {
        uri: String,
        params: Map<String, Value>,
    },
    Subscribe {
        topic: String,
        port: u16,
        broker: Option<BrokerIdentity>,
    },
}

/// Decide the request mode and validate its payload.
///
/// # Errors
///
/// Returns [`ProxyError::MalformedRequest`] for any missing or invalid field.
pub fn classify(form: IngressForm) -> Result<ProtocolMode, ProxyError> {
    if form.protocol.as_deref() == Some("http") {
        let uri = form
            .uri
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| malformed("pass-through request requires 'uri'"))?;
        let params = match form.message.as_deref() {
            None | Some("") => Map::new(),
            Some(raw) => match parse_message(raw)? {
                Value::Object(map) => map,
                _ => return Err(malformed("'message' must be a JSON object")),
            },
        };
        return Ok(ProtocolMode::PassThrough { uri, params });
    }

    let raw = form
        .message
        .ok_or_else(|| malformed("subscribe request requires 'message'"))?;
    let message = parse_message(&raw)?;

    let topic = message
        .get("topic")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| malformed("subscribe request requires a 'topic' string"))?
        .to_string();
    // An invalid filter makes the broker drop the shared connection.
    if !rumqttc::valid_filter(&topic) {
        return Err(ProxyError::MalformedRequest(format!(
            "'{topic}' is not a valid MQTT topic filter"
        )));
    }
    let port = message
        .get("port")
        .and_then(as_port)
        .ok_or_else(|| malformed("subscribe request requires a callback 'port'"))?;
    let broker = match message.get("broker") {
        None | Some(Value::Null) => None,
        Some(value) => Some(parse_broker(value)?),
    };

    Ok(ProtocolMode::Subscribe {
        topic,
        port,
        broker,
    })
}

fn malformed(reason: &str) -> ProxyError {
    ProxyError::MalformedRequest(reason.to_string())
}

fn parse_message(raw: &str) -> Result<Value, ProxyError> {
    serde_json::from_str(raw)
        .map_err(|e| ProxyError::MalformedRequest(format!("'message' is not valid JSON: {e}")))
}

/// Ports arrive as JSON numbers or numeric strings.
fn as_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }?;
    (port != 0).then_some(port)
}

fn parse_broker(value: &Value) -> Result<BrokerIdentity, ProxyError> {
    let host = value.get("host").and_then(Value::as_str).unwrap_or_default();
    let port = value.get("port").and_then(as_port).unwrap_or(0);
    let broker = BrokerIdentity::new(host, port);
    broker.validate()?;
    Ok(broker)
}

/// `http://<uri>/<k1>/<v1>/<k2>/<v2>/...` in parameter order.
pub fn passthrough_url(uri: &str, params: &Map<String, Value>) -> String {
    let mut url = format!("http://{uri}");
    for (key, value) in params {
        url.push('/');
        url.push_str(key);
        url.push('/');
        match value {
            Value::String(s) => url.push_str(s),
            other => url.push_str(&other.to_string()),
        }
    }
    url
}

// ---------------------------------------------------------------------------
// Router and handlers
// ---------------------------------------------------------------------------

/// Routes: `GET /health`, and `POST` on any path for ingress.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health).post(ingress))
        .route("/", post(ingress))
        .route("/*path", post(ingress))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (active, pending) = {
        let registry = state.registry.lock();
        (registry.active_count(), registry.pending_count())
    };
    Json(serde_json::json!({
        "status": "ok",
        "active_topics": active,
        "pending_topics": pending,
        "brokers": state.brokers.len(),
    }))
}

async fn ingress(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let form: IngressForm = match serde_urlencoded::from_bytes(&body) {
        Ok(form) => form,
        Err(e) => {
            return ApiError::from(ProxyError::MalformedRequest(format!("unparsable body: {e}")))
                .into_response();
        }
    };
    let mode = match classify(form) {
        Ok(mode) => mode,
        Err(e) => {
            debug!(peer = %peer, error = %e, "rejected malformed ingress request");
            return ApiError::from(e).into_response();
        }
    };

    match mode {
        ProtocolMode::PassThrough { uri, params } => pass_through(&state, &uri, &params).await,
        ProtocolMode::Subscribe {
            topic,
            port,
            broker,
        } => {
            let broker = broker.unwrap_or_else(|| state.default_broker.clone());
            let key = TopicKey::new(broker, topic);
            let endpoint = SubscriberEndpoint::from_peer(peer.ip(), port);
            subscribe(&state, key, endpoint).await
        }
    }
}

async fn pass_through(state: &AppState, uri: &str, params: &Map<String, Value>) -> Response {
    let target = passthrough_url(uri, params);
    match forward(&state.http, &target).await {
        Ok(body) => {
            debug!(uri = %target, bytes = body.len(), "pass-through relayed");
            (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
        }
        Err(e) => {
            warn!(uri = %target, error = %e, "pass-through failed");
            ApiError::from(e).into_response()
        }
    }
}

/// GET `url`.  A non-2xx answer is a failure whose detail is the target's
/// body, or its status line when the body is empty.
async fn forward(client: &reqwest::Client, url: &str) -> Result<Bytes, ProxyError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ProxyError::Transport(e.to_string()))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| ProxyError::Transport(e.to_string()))?;
    if !status.is_success() {
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            String::from_utf8_lossy(&body).into_owned()
        };
        return Err(ProxyError::Transport(detail));
    }
    Ok(body)
}

async fn subscribe(state: &AppState, key: TopicKey, endpoint: SubscriberEndpoint) -> Response {
    let (admission, waiting) = {
        let mut registry = state.registry.lock();
        let admission = registry.admit(&key, endpoint.clone());
        (admission, registry.waiting(&key))
    };
    let outcome = match admission {
        Admission::Registered => {
            debug!(topic_key = %key, endpoint = %endpoint, "subscriber registered on active topic");
            return StatusCode::NO_CONTENT.into_response();
        }
        Admission::Queued(outcome) => {
            debug!(topic_key = %key, endpoint = %endpoint, waiting, "queued behind pending subscribe");
            outcome
        }
        Admission::Lead(outcome) => {
            info!(topic_key = %key, endpoint = %endpoint, "subscribing at broker");
            start_broker_subscribe(state, key.clone());
            outcome
        }
    };

    match outcome.await {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => ApiError::from(e).into_response(),
        Err(_) => ApiError::from(ProxyError::Channel(format!(
            "subscribe for {key} was abandoned"
        )))
        .into_response(),
    }
}

/// Issue the one broker subscribe for a newly pending key.  Runs on its own
/// task so the key is settled even if the leading caller disconnects.
fn start_broker_subscribe(state: &AppState, key: TopicKey) {
    let agent = match state.brokers.resolve(key.broker()) {
        Ok(agent) => agent,
        Err(e) => {
            abort_locally(&state.registry, &key, e);
            return;
        }
    };
    debug!(broker = %agent.identity(), topic = %key.topic(), "broker subscribe issued");
    let bus = state.bus.clone();
    let registry = state.registry.clone();
    tokio::spawn(async move {
        let event = match agent.subscribe(key.topic()).await {
            Ok(()) => BrokerEvent::Subscribed { key: key.clone() },
            Err(error) => BrokerEvent::SubscribeFailed {
                key: key.clone(),
                error,
            },
        };
        if let Err(e) = bus.publish(event) {
            abort_locally(&registry, &key, e);
        }
    });
}
