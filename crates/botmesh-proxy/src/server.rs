//! [`MessageProxy`] – owns the proxy's shared state and its HTTP listener.
//!
//! Listens on `0.0.0.0:8800` by default (see [`ProxyConfig::listen_port`]).
//!
//! * `POST` on any path → ingress endpoint (pass-through or subscribe).
//! * `GET /health` → registry and broker counters.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use botmesh_types::ProxyError;
use tokio::net::TcpListener;
use tracing::info;

use crate::broker::{BrokerAgentManager, BrokerConnector};
use crate::bus::{EventBus, EventStream};
use crate::config::ProxyConfig;
use crate::dispatcher::Dispatcher;
use crate::ingress::{AppState, build_router};
use crate::mqtt_agent::MqttConnector;
use crate::notifier::Notifier;
use crate::registry::Registry;

// ---------------------------------------------------------------------------
// MessageProxy
// ---------------------------------------------------------------------------

/// Default TCP port for the ingress endpoint.
pub const DEFAULT_PORT: u16 = 8800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Listening { addr: SocketAddr },
}

/// The message proxy: registry, broker agents, event bus and ingress server.
///
/// # Example
///
/// ```rust,no_run
/// use botmesh_proxy::{MessageProxy, ProxyConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), botmesh_types::ProxyError> {
///     let mut proxy = MessageProxy::new(ProxyConfig::default())?;
///     proxy.start().await?;
///     proxy.serve_until(async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await
/// }
/// ```
pub struct MessageProxy {
    config: ProxyConfig,
    state: AppState,
    dispatcher: Dispatcher,
    stream: Option<EventStream>,
    listener: Option<TcpListener>,
    lifecycle: Lifecycle,
}

impl MessageProxy {
    /// Build a proxy that talks MQTT through [`MqttConnector`].
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] if the HTTP client cannot be built.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let connector = Arc::new(MqttConnector::new(config.mqtt.clone()));
        Self::with_connector(config, connector)
    }

    /// Build a proxy around an arbitrary [`BrokerConnector`].
    pub fn with_connector(
        config: ProxyConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, ProxyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.passthrough_timeout_secs))
            .build()
            .map_err(|e| ProxyError::Config(format!("http client: {e}")))?;

        let registry = Registry::new();
        let (bus, stream) = EventBus::new();
        let brokers = Arc::new(BrokerAgentManager::new(connector, bus.clone()));
        let notifier = Notifier::new(registry.clone(), http.clone());
        let dispatcher = Dispatcher::new(registry.clone(), notifier);

        let state = AppState {
            registry,
            brokers,
            bus,
            default_broker: config.broker.identity(),
            http,
        };

        Ok(Self {
            config,
            state,
            dispatcher,
            stream: Some(stream),
            listener: None,
            lifecycle: Lifecycle::NotStarted,
        })
    }

    /// Bind the listener, connect the default broker and start dispatching
    /// broker events.  Calling it again returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Startup`] if the port cannot be bound or the
    /// default broker identity is unusable.
    pub async fn start(&mut self) -> Result<SocketAddr, ProxyError> {
        if let Lifecycle::Listening { addr } = self.lifecycle {
            return Ok(addr);
        }

        let bind = SocketAddr::from(([0, 0, 0, 0], self.config.listen_port));
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| ProxyError::Startup(format!("bind error on {bind}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Startup(format!("local address: {e}")))?;

        self.state
            .brokers
            .resolve(&self.state.default_broker)
            .map_err(|e| ProxyError::Startup(format!("default broker: {}", e.detail())))?;

        if let Some(stream) = self.stream.take() {
            tokio::spawn(self.dispatcher.clone().run(stream));
        }

        self.listener = Some(listener);
        self.lifecycle = Lifecycle::Listening { addr };
        info!(addr = %addr, broker = %self.state.default_broker, "message proxy listening");
        Ok(addr)
    }

    /// Serve ingress requests until `shutdown` resolves.  Starts the proxy
    /// first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Startup`] if starting fails, if the proxy is
    /// already being served, or if the server stops with an I/O error.
    pub async fn serve_until<F>(mut self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.start().await?;
        let listener = self
            .listener
            .take()
            .ok_or_else(|| ProxyError::Startup(format!("{addr} is already being served")))?;

        let router = build_router(self.state.clone());
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ProxyError::Startup(format!("server error on {addr}: {e}")))?;

        info!(addr = %addr, "message proxy stopped");
        Ok(())
    }
}
