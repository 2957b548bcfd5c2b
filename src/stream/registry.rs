//! Per-flow listener registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::stream::normalize::normalize_record;

/// Callback invoked with each normalized drop pushed for a subscribed flow.
pub type Listener = Arc<dyn Fn(Value) + Send + Sync>;

/// Maps a flow id to exactly one listener.
#[derive(Default)]
pub struct SubscriptionRegistry {
    listeners: HashMap<String, Listener>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `flow_id`, replacing any previous listener.
    ///
    /// Returns `true` when a listener was replaced.
    pub fn insert(&mut self, flow_id: impl Into<String>, listener: Listener) -> bool {
        self.listeners.insert(flow_id.into(), listener).is_some()
    }

    /// Removes the listener for `flow_id`, returning whether one was present.
    pub fn remove(&mut self, flow_id: &str) -> bool {
        self.listeners.remove(flow_id).is_some()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.listeners.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Flow ids with a registered listener, in no particular order.
    pub fn flow_ids(&self) -> Vec<String> {
        self.listeners.keys().cloned().collect()
    }

    /// Delivers a raw pushed drop to the listener for `flow_id`.
    ///
    /// The payload is normalized only when a listener exists. Returns `false`
    /// when nothing is registered for the flow.
    pub fn route(&self, flow_id: &str, raw: &Value) -> bool {
        match self.listeners.get(flow_id) {
            Some(listener) => {
                listener(normalize_record(raw));
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("flow_ids", &self.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}
