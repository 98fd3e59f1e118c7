//! Subscription handles

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::ChannelKey;
use crate::registry::{ChannelRegistry, SubscriberId};

/// Capability to cancel exactly one registration
///
/// Dropping the handle leaves the callback registered.
#[must_use = "the callback stays registered until unsubscribe() is called"]
pub struct Subscription {
    key: ChannelKey,
    id: SubscriberId,
    registry: Arc<ChannelRegistry>,
    released: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(key: ChannelKey, id: SubscriberId, registry: Arc<ChannelRegistry>) -> Self {
        Self {
            key,
            id,
            registry,
            released: AtomicBool::new(false),
        }
    }

    /// Remove the callback; later calls do nothing
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.release(&self.key, self.id);
    }

    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::Acquire)
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Turn the handle into a plain unsubscribe function
    pub fn into_unsubscriber(self) -> impl Fn() + Send + Sync + 'static {
        move || self.unsubscribe()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::metrics::FeedMetrics;
    use crate::parser::MarketEvent;
    use crate::registry::MockInterestSink;

    #[test]
    fn test_unsubscriber_is_idempotent() {
        let key = ChannelKey::new(ChannelKind::Cvd, "BTCUSDT").unwrap();
        let mut sink = MockInterestSink::new();
        sink.expect_declare_interest().times(1).return_const(());
        sink.expect_drop_interest().times(1).return_const(());
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(sink),
            FeedMetrics::new().unwrap(),
        ));

        let subscription = registry.register(key.clone(), Arc::new(|_: &MarketEvent| {}));
        assert!(subscription.is_active());
        assert_eq!(subscription.key(), &key);

        let unsubscribe = subscription.into_unsubscriber();
        unsubscribe();
        unsubscribe();
        assert!(!registry.contains(&key));
    }
}
