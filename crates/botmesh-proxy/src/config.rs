//! Process-wide proxy settings.  Loaded once at startup; there is no runtime
//! reconfiguration.

use botmesh_types::BrokerIdentity;
use serde::{Deserialize, Serialize};

/// Settings for the message proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// TCP port the ingress endpoint listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Broker used when a subscribe request does not name one.
    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub mqtt: MqttSettings,

    /// Upper bound on a single pass-through GET.
    #[serde(default = "default_passthrough_timeout_secs")]
    pub passthrough_timeout_secs: u64,
}

/// The default broker identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

/// Options applied to every broker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Client ids are `<prefix>-<uuid>`.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Capacity of each client's outgoing request channel.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

fn default_listen_port() -> u16 {
    8800
}
fn default_passthrough_timeout_secs() -> u64 {
    30
}
fn default_broker_host() -> String {
    "localhost".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_client_id_prefix() -> String {
    "botmesh-proxy".to_string()
}
fn default_keep_alive_secs() -> u64 {
    5
}
fn default_request_capacity() -> usize {
    100
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            broker: BrokerSettings::default(),
            mqtt: MqttSettings::default(),
            passthrough_timeout_secs: default_passthrough_timeout_secs(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive_secs(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl BrokerSettings {
    /// Identity of the default broker.
    pub fn identity(&self) -> BrokerIdentity {
        BrokerIdentity::new(self.host.clone(), self.port)
    }
}
