//! [`SubscriptionRegistry`] – in-memory bookkeeping of subscription state
//! per topic key.
//!
//! Every topic key moves through a small state machine:
//!
//! ```text
//! INACTIVE ──mark_pending──▶ PENDING ──promote──▶ ACTIVE
//!                               │
//!                               └──abort_pending──▶ INACTIVE
//! ```
//!
//! `ACTIVE` is terminal for the lifetime of the process.  Callers that arrive
//! while a key is `PENDING` are queued in arrival order and completed together
//! when the key leaves that state.
//!
//! The registry itself is plain data.  [`Registry`] wraps it in a mutex so
//! each transition is atomic with respect to concurrent ingress requests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use botmesh_types::{ProxyError, SubscribeOutcome, SubscriberEndpoint, TopicKey};
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// Deferred callers
// ---------------------------------------------------------------------------

/// A caller waiting for a pending topic key to be confirmed or rejected.
pub type Deferred = oneshot::Sender<SubscribeOutcome>;

struct PendingCaller {
    endpoint: SubscriberEndpoint,
    handle: Deferred,
}

/// Result of [`SubscriptionRegistry::admit`].
#[derive(Debug)]
pub enum Admission {
    /// The topic was already active; the endpoint is registered.
    Registered,
    /// The topic is pending; wait on the receiver for the shared outcome.
    Queued(oneshot::Receiver<SubscribeOutcome>),
    /// The topic was inactive and is now pending.  The caller must issue the
    /// broker subscribe, then wait on the receiver like everyone else.
    Lead(oneshot::Receiver<SubscribeOutcome>),
}

// ---------------------------------------------------------------------------
// SubscriptionRegistry
// ---------------------------------------------------------------------------

/// Subscription state for every topic key the proxy has seen.
#[derive(Default)]
pub struct SubscriptionRegistry {
    active: HashSet<TopicKey>,
    subscribers: HashMap<TopicKey, Vec<SubscriberEndpoint>>,
    pending: HashSet<TopicKey>,
    pending_subscribers: HashMap<TopicKey, Vec<PendingCaller>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the broker has confirmed `key`.
    pub fn is_active(&self, key: &TopicKey) -> bool {
        self.active.contains(key)
    }

    /// Whether a broker subscribe for `key` is in flight.
    pub fn is_pending(&self, key: &TopicKey) -> bool {
        self.pending.contains(key)
    }

    /// Register `endpoint` for an active key.  Returns `false` (and changes
    /// nothing) when the key is not active.  Registering an endpoint twice is
    /// a no-op.
    pub fn add_subscriber_if_active(&mut self, key: &TopicKey, endpoint: SubscriberEndpoint) -> bool {
        if !self.active.contains(key) {
            return false;
        }
        let list = self.subscribers.entry(key.clone()).or_default();
        if !list.iter().any(|e| e.key() == endpoint.key()) {
            list.push(endpoint);
        }
        true
    }

    /// Queue a caller behind a pending key.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Registry`] when the key is not pending; the handle
    /// is dropped, which its receiver observes as a closed channel.
    pub fn enqueue_pending(
        &mut self,
        key: &TopicKey,
        endpoint: SubscriberEndpoint,
        handle: Deferred,
    ) -> Result<(), ProxyError> {
        if !self.pending.contains(key) {
            return Err(ProxyError::Registry(format!("topic key {key} is not pending")));
        }
        self.push_pending(key, endpoint, handle);
        Ok(())
    }

    fn push_pending(&mut self, key: &TopicKey, endpoint: SubscriberEndpoint, handle: Deferred) {
        self.pending_subscribers
            .entry(key.clone())
            .or_default()
            .push(PendingCaller { endpoint, handle });
    }

    /// Move `key` from INACTIVE to PENDING.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Registry`] if the key is already pending or active.
    pub fn mark_pending(&mut self, key: &TopicKey) -> Result<(), ProxyError> {
        if self.active.contains(key) {
            return Err(ProxyError::Registry(format!("topic key {key} is already active")));
        }
        if !self.pending.insert(key.clone()) {
            return Err(ProxyError::Registry(format!("topic key {key} is already pending")));
        }
        Ok(())
    }

    /// Move `key` from PENDING to ACTIVE, installing every queued endpoint as
    /// a subscriber.  Returns the handles to complete with success, in
    /// arrival order.  A key that is not pending yields no handles.
    pub fn promote(&mut self, key: &TopicKey) -> Vec<Deferred> {
        if !self.pending.remove(key) {
            return Vec::new();
        }
        let callers = self.pending_subscribers.remove(key).unwrap_or_default();
        self.active.insert(key.clone());

        let list = self.subscribers.entry(key.clone()).or_default();
        let mut handles = Vec::with_capacity(callers.len());
        for caller in callers {
            if !list.iter().any(|e| e.key() == caller.endpoint.key()) {
                list.push(caller.endpoint);
            }
            handles.push(caller.handle);
        }
        handles
    }

    /// Return `key` from PENDING to INACTIVE.  Returns the handles to
    /// complete with failure, in arrival order.
    pub fn abort_pending(&mut self, key: &TopicKey) -> Vec<Deferred> {
        if !self.pending.remove(key) {
            return Vec::new();
        }
        self.pending_subscribers
            .remove(key)
            .unwrap_or_default()
            .into_iter()
            .map(|caller| caller.handle)
            .collect()
    }

    /// Classify and record one subscribe request in a single step.
    pub fn admit(&mut self, key: &TopicKey, endpoint: SubscriberEndpoint) -> Admission {
        if self.add_subscriber_if_active(key, endpoint.clone()) {
            return Admission::Registered;
        }
        let (tx, rx) = oneshot::channel();
        // Not active here: marking fails only when the key is already pending.
        let lead = self.mark_pending(key).is_ok();
        self.push_pending(key, endpoint, tx);
        if lead {
            Admission::Lead(rx)
        } else {
            Admission::Queued(rx)
        }
    }

    /// Snapshot of the endpoints registered for an active key.
    pub fn subscribers(&self, key: &TopicKey) -> Vec<SubscriberEndpoint> {
        self.subscribers.get(key).cloned().unwrap_or_default()
    }

    /// Number of ACTIVE keys.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of PENDING keys.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Callers currently deferred on `key`.
    pub fn waiting(&self, key: &TopicKey) -> usize {
        self.pending_subscribers.get(key).map_or(0, Vec::len)
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Complete every handle with the same outcome.  A caller that has already
/// gone away is skipped.
pub fn complete_all(handles: Vec<Deferred>, outcome: &SubscribeOutcome) -> usize {
    let mut delivered = 0;
    for handle in handles {
        if handle.send(outcome.clone()).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

/// Shared, mutex-guarded [`SubscriptionRegistry`].  Clone it cheaply.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<SubscriptionRegistry>>,
}

impl Registry {
    /// Create an empty shared registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the registry.  A poisoned lock is recovered: every transition
    /// leaves the maps consistent before it can panic.
    pub fn lock(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
