//! Channel registry
//!
//! Authoritative map from [`ChannelKey`] to the ordered set of subscriber
//! callbacks. The registry alone decides when upstream interest in a key
//! must be declared or dropped.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

use crate::channel::ChannelKey;
use crate::metrics::FeedMetrics;
use crate::parser::MarketEvent;
use crate::subscription::Subscription;

/// Callback invoked synchronously for every event on a channel
pub type Callback = Arc<dyn Fn(&MarketEvent) + Send + Sync>;

/// Identifier of a single registration
pub type SubscriberId = u64;

/// Receiver of upstream interest changes
#[cfg_attr(test, mockall::automock)]
pub trait InterestSink: Send + Sync {
    /// Called once when `key` gains its first subscriber
    fn declare_interest(&self, key: &ChannelKey);

    /// Called once when `key` loses its last subscriber
    fn drop_interest(&self, key: &ChannelKey);
}

struct Subscriber {
    id: SubscriberId,
    active: AtomicBool,
    callback: Callback,
}

#[derive(Default)]
struct RegistryState {
    channels: HashMap<ChannelKey, Vec<Arc<Subscriber>>>,
    next_id: SubscriberId,
}

pub struct ChannelRegistry {
    state: Mutex<RegistryState>,
    sink: Arc<dyn InterestSink>,
    metrics: FeedMetrics,
}

impl ChannelRegistry {
    pub fn new(sink: Arc<dyn InterestSink>, metrics: FeedMetrics) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            sink,
            metrics,
        }
    }

    /// Register `callback` under `key`
    ///
    /// Declares upstream interest when this is the key's first subscriber.
    /// Every call creates an independent registration, even for a callback
    /// that is already registered under the same key.
    pub fn register(self: &Arc<Self>, key: ChannelKey, callback: Callback) -> Subscription {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;

        let subscribers = state.channels.entry(key.clone()).or_default();
        subscribers.push(Arc::new(Subscriber {
            id,
            active: AtomicBool::new(true),
            callback,
        }));

        if subscribers.len() == 1 {
            debug!(channel = %key, "First subscriber, declaring interest");
            self.metrics.live_channels.set(state.channels.len() as i64);
            self.sink.declare_interest(&key);
        }
        debug!(channel = %key, subscriber = id, "Subscriber registered");

        Subscription::new(key, id, Arc::clone(self))
    }

    /// Remove one registration; returns false if it was already gone
    ///
    /// Drops upstream interest when the key's last subscriber leaves.
    pub fn release(&self, key: &ChannelKey, id: SubscriberId) -> bool {
        let mut state = self.state();
        let Some(subscribers) = state.channels.get_mut(key) else {
            return false;
        };
        let Some(position) = subscribers.iter().position(|s| s.id == id) else {
            return false;
        };

        let removed = subscribers.remove(position);
        removed.active.store(false, Ordering::Release);
        debug!(channel = %key, subscriber = id, "Subscriber released");

        if subscribers.is_empty() {
            state.channels.remove(key);
            debug!(channel = %key, "Last subscriber gone, dropping interest");
            self.metrics.live_channels.set(state.channels.len() as i64);
            self.sink.drop_interest(key);
        }
        true
    }

    /// Deliver `event` to every active subscriber of `key`, in registration order
    ///
    /// The subscriber list is snapshotted first, so callbacks may subscribe or
    /// unsubscribe re-entrantly. A panicking callback is logged and skipped.
    /// Returns the number of callbacks that completed.
    pub fn dispatch(&self, key: &ChannelKey, event: &MarketEvent) -> usize {
        let snapshot = match self.state().channels.get(key) {
            Some(subscribers) => subscribers.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for subscriber in snapshot {
            // Released mid-dispatch
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    self.metrics.callback_panics.inc();
                    error!(
                        channel = %key,
                        subscriber = subscriber.id,
                        panic = %panic_message(panic.as_ref()),
                        "Subscriber callback panicked"
                    );
                }
            }
        }

        self.metrics.dispatched.inc_by(delivered as u64);
        delivered
    }

    /// Keys with at least one subscriber (the live interest set)
    pub fn keys(&self) -> BTreeSet<ChannelKey> {
        self.state().channels.keys().cloned().collect()
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.state().channels.contains_key(key)
    }

    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.state().channels.get(key).map_or(0, Vec::len)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.state().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().channels.is_empty()
    }

    // Callbacks never run under the lock, so poisoning cannot leave the map
    // half-updated.
    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
