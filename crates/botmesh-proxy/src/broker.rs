//! Broker agents and the keyed cache that owns them.
//!
//! The proxy never speaks MQTT directly.  It asks the
//! [`BrokerAgentManager`] for the agent bound to a broker identity and calls
//! [`BrokerAgent::subscribe`] on it.  Agents publish inbound traffic onto the
//! [`EventBus`].
//!
//! # Overview
//!
//! - [`BrokerAgent`] – one persistent connection to one broker.
//! - [`BrokerConnector`] – creates agents; [`MqttConnector`][crate::mqtt_agent::MqttConnector]
//!   is the production implementation.
//! - [`BrokerAgentManager`] – lazily creates and then reuses exactly one
//!   agent per broker identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use botmesh_types::{BrokerIdentity, ProxyError};
use tracing::info;

use crate::bus::EventBus;

// ---------------------------------------------------------------------------
// Agent seams
// ---------------------------------------------------------------------------

/// A persistent connection to one broker, shared by every topic on it.
///
/// # Contract
///
/// * `subscribe` issues exactly one subscribe request and resolves once the
///   broker has answered it.  A rejection or a lost connection resolves to
///   an error.
/// * Messages delivered for any subscribed topic are published to the
///   [`EventBus`] the agent was created with.
#[async_trait]
pub trait BrokerAgent: Send + Sync {
    fn identity(&self) -> &BrokerIdentity;

    async fn subscribe(&self, topic: &str) -> Result<(), ProxyError>;
}

/// Factory for [`BrokerAgent`]s.
pub trait BrokerConnector: Send + Sync {
    /// Open a connection to `identity`.  Must be called from within a Tokio
    /// runtime.
    fn connect(
        &self,
        identity: &BrokerIdentity,
        bus: EventBus,
    ) -> Result<Arc<dyn BrokerAgent>, ProxyError>;
}

// ---------------------------------------------------------------------------
// BrokerAgentManager
// ---------------------------------------------------------------------------

/// Keyed cache of broker agents.  Agents are created on first reference and
/// live for the rest of the process.
pub struct BrokerAgentManager {
    connector: Arc<dyn BrokerConnector>,
    bus: EventBus,
    agents: Mutex<HashMap<String, Arc<dyn BrokerAgent>>>,
}

impl BrokerAgentManager {
    /// Create an empty cache.  Agents get `bus` when they are connected.
    pub fn new(connector: Arc<dyn BrokerConnector>, bus: EventBus) -> Self {
        Self {
            connector,
            bus,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Return the agent for `identity`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::MalformedRequest`] for an incomplete identity,
    /// or whatever the connector reports when the agent cannot be created.
    pub fn resolve(&self, identity: &BrokerIdentity) -> Result<Arc<dyn BrokerAgent>, ProxyError> {
        identity.validate()?;
        let key = identity.key();
        let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(agent) = agents.get(&key) {
            return Ok(Arc::clone(agent));
        }
        let agent = self.connector.connect(identity, self.bus.clone())?;
        info!(broker = %agent.identity(), "broker agent created");
        agents.insert(key, Arc::clone(&agent));
        Ok(agent)
    }

    /// Number of live broker agents.
    pub fn len(&self) -> usize {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no agent has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullAgent {
        identity: BrokerIdentity,
    }

    #[async_trait]
    impl BrokerAgent for NullAgent {
        fn identity(&self) -> &BrokerIdentity {
            &self.identity
        }

        async fn subscribe(&self, _topic: &str) -> Result<(), ProxyError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
    }

    impl BrokerConnector for CountingConnector {
        fn connect(
            &self,
            identity: &BrokerIdentity,
            _bus: EventBus,
        ) -> Result<Arc<dyn BrokerAgent>, ProxyError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullAgent {
                identity: identity.clone(),
            }))
        }
    }

    struct FailingConnector;

    impl BrokerConnector for FailingConnector {
        fn connect(
            &self,
            identity: &BrokerIdentity,
            _bus: EventBus,
        ) -> Result<Arc<dyn BrokerAgent>, ProxyError> {
            Err(ProxyError::BrokerUnreachable(identity.key()))
        }
    }

    #[test]
    fn resolve_reuses_one_agent_per_identity() {
        let connector = Arc::new(CountingConnector::default());
        let (bus, _stream) = EventBus::new();
        let manager = BrokerAgentManager::new(connector.clone(), bus);

        let a = manager.resolve(&BrokerIdentity::new("localhost", 1883)).unwrap();
        let b = manager.resolve(&BrokerIdentity::new("localhost", 1883)).unwrap();
        let c = manager.resolve(&BrokerIdentity::new("localhost", 1884)).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.identity().port, 1884);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn resolve_rejects_incomplete_identity() {
        let connector = Arc::new(CountingConnector::default());
        let (bus, _stream) = EventBus::new();
        let manager = BrokerAgentManager::new(connector.clone(), bus);

        let result = manager.resolve(&BrokerIdentity::new("", 1883));
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn failed_connect_is_not_cached() {
        let (bus, _stream) = EventBus::new();
        let manager = BrokerAgentManager::new(Arc::new(FailingConnector), bus);
        assert!(manager.resolve(&BrokerIdentity::new("localhost", 1883)).is_err());
        assert!(manager.is_empty());
    }
}
