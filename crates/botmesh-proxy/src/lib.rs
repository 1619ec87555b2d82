//! `botmesh-proxy` – HTTP to MQTT message proxy.
//!
//! Robots and services talk to the proxy with a single form-encoded POST.
//! The proxy either relays it as a GET to another HTTP service or
//! subscribes to an MQTT topic on the caller's behalf and forwards every
//! message on that topic back to the caller's callback port.
//!
//! # Modules
//!
//! - [`registry`] – Per-topic subscription state (inactive, pending, active)
//!   and the callers waiting on a pending subscribe.
//! - [`broker`] – [`BrokerAgent`] trait and the keyed agent cache.
//! - [`mqtt_agent`] – rumqttc-backed broker agent.
//! - [`bus`] – Channel carrying broker events to the [`Dispatcher`].
//! - [`dispatcher`] – Applies broker events to the registry.
//! - [`notifier`] – Fire-and-forget callbacks to subscribers.
//! - [`ingress`] – axum router for the ingress endpoint.
//! - [`server`] – [`MessageProxy`] lifecycle.

pub mod broker;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ingress;
pub mod mqtt_agent;
pub mod notifier;
pub mod registry;
pub mod server;

pub use broker::{BrokerAgent, BrokerAgentManager, BrokerConnector};
pub use bus::{BrokerEvent, EventBus, EventStream};
pub use config::{BrokerSettings, MqttSettings, ProxyConfig};
pub use dispatcher::Dispatcher;
pub use error::ApiError;
pub use ingress::{AppState, ProtocolMode, build_router};
pub use mqtt_agent::{MqttAgent, MqttConnector};
pub use notifier::Notifier;
pub use registry::{Admission, Registry, SubscriptionRegistry};
pub use server::{DEFAULT_PORT, MessageProxy};
