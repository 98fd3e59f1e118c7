//! Upstream interest declared on the current connection

use serde::Serialize;
use std::collections::HashSet;

use crate::channel::ChannelKey;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

/// Control message sent upstream, e.g. `{"action":"subscribe","channel":"trade:BTCUSDT"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlMessage {
    pub action: Action,
    pub channel: String,
}

impl ControlMessage {
    pub fn subscribe(key: &ChannelKey) -> Self {
        Self {
            action: Action::Subscribe,
            channel: key.wire_channel(),
        }
    }

    pub fn unsubscribe(key: &ChannelKey) -> Self {
        Self {
            action: Action::Unsubscribe,
            channel: key.wire_channel(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Keys declared upstream on the live connection
///
/// Declare and drop requests reach the connection task asynchronously, so
/// each one is checked against the registry's view at the time it is
/// handled. Replaying a stale request therefore never sends a duplicate or
/// contradictory control message.
#[derive(Debug, Default)]
pub struct LiveInterest {
    declared: HashSet<ChannelKey>,
}

impl LiveInterest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; the connection is gone
    pub fn reset(&mut self) {
        self.declared.clear();
    }

    /// Subscriptions to send on a fresh connection, one per live key
    pub fn redeclare<I>(&mut self, live: I) -> Vec<ControlMessage>
    where
        I: IntoIterator<Item = ChannelKey>,
    {
        self.declared.clear();
        live.into_iter()
            .filter_map(|key| {
                let message = ControlMessage::subscribe(&key);
                self.declared.insert(key).then_some(message)
            })
            .collect()
    }

    /// Handle a declare request for `key`; `wanted` is whether the registry still holds it
    pub fn declare(&mut self, key: &ChannelKey, wanted: bool) -> Option<ControlMessage> {
        if !wanted || self.declared.contains(key) {
            return None;
        }
        self.declared.insert(key.clone());
        Some(ControlMessage::subscribe(key))
    }

    /// Handle a drop request for `key`; `wanted` is whether the registry still holds it
    pub fn release(&mut self, key: &ChannelKey, wanted: bool) -> Option<ControlMessage> {
        if wanted || !self.declared.remove(key) {
            return None;
        }
        Some(ControlMessage::unsubscribe(key))
    }

    pub fn is_declared(&self, key: &ChannelKey) -> bool {
        self.declared.contains(key)
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }
}
