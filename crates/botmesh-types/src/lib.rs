use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Identity of one MQTT broker.  Exactly one broker agent exists per
/// distinct identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerIdentity {
    pub host: String,
    pub port: u16,
}

impl BrokerIdentity {
    /// Create an identity from a host name or address and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Canonical cache key, `"host:port"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A broker agent can only be created when both host and port are set.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.host.trim().is_empty() || self.port == 0 {
            return Err(ProxyError::MalformedRequest(
                "broker requires both host and port values".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for BrokerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Unique handle for all subscription state: a topic on a specific broker.
///
/// Renders as `"host:port|topic"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    broker: BrokerIdentity,
    topic: String,
}

impl TopicKey {
    /// Create the key for `topic` on `broker`.
    pub fn new(broker: BrokerIdentity, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    /// Broker the topic lives on.
    pub fn broker(&self) -> &BrokerIdentity {
        &self.broker
    }

    /// Plain topic string, as sent in notifications.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.broker, self.topic)
    }
}

/// A remote callback target registered for a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberEndpoint {
    pub host: String,
    pub port: u16,
}

impl SubscriberEndpoint {
    /// Create an endpoint from a callback host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Build an endpoint from the peer address of an inbound connection.
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are reduced to IPv4.
    pub fn from_peer(ip: IpAddr, port: u16) -> Self {
        Self::new(ip.to_canonical().to_string(), port)
    }

    /// Identity used for de-duplication, `"host:port"`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for SubscriberEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Wire bodies
// ---------------------------------------------------------------------------

/// JSON body POSTed to every subscriber when a broker message arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: String,
    pub message: String,
}

/// Structured error body returned to ingress callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// What a deferred subscribe caller is completed with.
pub type SubscribeOutcome = Result<(), ProxyError>;

/// Errors surfaced by the message proxy.
///
/// None of these are retried by the proxy itself; callers retry by
/// reissuing their request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Broker Subscribe Error: {0}")]
    BrokerSubscribe(String),

    #[error("Broker Unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("Malformed Request: {0}")]
    MalformedRequest(String),

    #[error("Startup Error: {0}")]
    Startup(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    /// A subscription state transition that the registry does not allow.
    #[error("Registry Error: {0}")]
    Registry(String),

    #[error("Config Error: {0}")]
    Config(String),
}

impl ProxyError {
    /// The message carried by the error, without the category prefix.
    pub fn detail(&self) -> &str {
        match self {
            ProxyError::Transport(m)
            | ProxyError::BrokerSubscribe(m)
            | ProxyError::BrokerUnreachable(m)
            | ProxyError::MalformedRequest(m)
            | ProxyError::Startup(m)
            | ProxyError::Channel(m)
            | ProxyError::Registry(m)
            | ProxyError::Config(m) => m,
        }
    }
}
