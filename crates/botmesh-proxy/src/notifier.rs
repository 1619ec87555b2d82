//! Fan-out of broker messages to registered subscriber endpoints.
//!
//! Delivery is at-most-once and best-effort: each callback is a
//! fire-and-forget POST, nothing is retried, and an unreachable endpoint is
//! dropped with a `debug` log line.

use botmesh_types::{Notification, SubscriberEndpoint, TopicKey};
use tracing::{debug, trace};

use crate::registry::Registry;

#[derive(Clone)]
pub struct Notifier {
    registry: Registry,
    client: reqwest::Client,
}

impl Notifier {
    /// Create a notifier reading subscribers from `registry`.
    pub fn new(registry: Registry, client: reqwest::Client) -> Self {
        Self { registry, client }
    }

    /// POST `{topic, message}` to every subscriber of `key`.
    ///
    /// Returns the number of callbacks dispatched.  Must be called from
    /// within a Tokio runtime.
    pub fn notify(&self, key: &TopicKey, payload: &[u8]) -> usize {
        let subscribers = self.registry.lock().subscribers(key);
        if subscribers.is_empty() {
            trace!(topic_key = %key, "no subscribers for broker message");
            return 0;
        }

        let body = Notification {
            topic: key.topic().to_string(),
            message: String::from_utf8_lossy(payload).into_owned(),
        };

        for endpoint in &subscribers {
            let request = self.client.post(callback_url(endpoint)).json(&body);
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                if let Err(e) = request.send().await {
                    debug!(endpoint = %endpoint, error = %e, "notification dropped");
                }
            });
        }
        debug!(topic_key = %key, subscribers = subscribers.len(), "notifications dispatched");
        subscribers.len()
    }
}

/// `http://host:port/`, bracketing IPv6 hosts.
pub fn callback_url(endpoint: &SubscriberEndpoint) -> String {
    if endpoint.host.contains(':') {
        format!("http://[{}]:{}/", endpoint.host, endpoint.port)
    } else {
        format!("http://{}:{}/", endpoint.host, endpoint.port)
    }
}
