//! Market feed service
//!
//! [`MarketFeed`] wires the channel registry, the connection manager and the
//! status publisher together and exposes the subscriber-facing API.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelKey, ChannelKind};
use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;
use crate::parser::{
    CvdPayload, DepthPayload, FundingPayload, LiquidationPayload, MarketEvent, TradePayload,
    VwapPayload,
};
use crate::registry::ChannelRegistry;
use crate::status::{ConnectionState, ConnectionStatusPublisher};
use crate::subscription::Subscription;
use crate::websocket::{Command, CommandSink, ConnectionManager};

/// Handle to a running market feed; clones share the same connection
///
/// Dropping the last handle stops the connection task without waiting for it.
#[derive(Clone)]
pub struct MarketFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    registry: Arc<ChannelRegistry>,
    status: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    metrics: FeedMetrics,
    task: Mutex<Option<JoinHandle<()>>>,
}

// The manager and every subscription hold the registry, whose sink keeps the
// command channel open, so the last feed handle must stop the task itself.
impl Drop for FeedInner {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            debug!("Last feed handle dropped, stopping connection task");
            if self.commands.send(Command::Shutdown).is_err() {
                task.abort();
            }
        }
    }
}

macro_rules! typed_subscribe {
    ($(#[$doc:meta])* $name:ident, $kind:ident, $payload:ty) => {
        $(#[$doc])*
        pub fn $name<F>(&self, symbol: &str, callback: F) -> Result<Subscription>
        where
            F: Fn(&$payload) + Send + Sync + 'static,
        {
            self.subscribe(ChannelKind::$kind, symbol, move |event: &MarketEvent| {
                if let MarketEvent::$kind(payload) = event {
                    callback(payload);
                }
            })
        }
    };
}

impl MarketFeed {
    /// Validate `config` and start the connection task on the current runtime
    pub fn create(config: FeedConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| FeedError::RuntimeUnavailable)?;

        let metrics = FeedMetrics::new()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(CommandSink::new(tx.clone())),
            metrics.clone(),
        ));
        let (publisher, status) = ConnectionStatusPublisher::new(metrics.clone());

        let manager =
            ConnectionManager::new(config, Arc::clone(&registry), rx, publisher, metrics.clone());
        let task = runtime.spawn(manager.run());

        Ok(Self {
            inner: Arc::new(FeedInner {
                registry,
                status,
                commands: tx,
                metrics,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// Stop the connection task and wait for it to close the socket
    ///
    /// Subscriptions stay registered but receive nothing further. Calling
    /// this more than once is harmless.
    pub async fn shutdown(&self) {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        info!("Shutting down market feed");
        let _ = self.inner.commands.send(Command::Shutdown);
        if let Err(e) = task.await {
            warn!(error = %e, "Connection task ended abnormally");
        }
    }

    /// Register an untyped callback for `(kind, symbol)`
    pub fn subscribe<F>(&self, kind: ChannelKind, symbol: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&MarketEvent) + Send + Sync + 'static,
    {
        let key = ChannelKey::new(kind, symbol)?;
        Ok(self.inner.registry.register(key, Arc::new(callback)))
    }

    typed_subscribe!(
        /// Executed trades for `symbol`
        subscribe_to_trades, Trade, TradePayload
    );
    typed_subscribe!(
        /// Order book updates for `symbol`
        subscribe_to_depth, Depth, DepthPayload
    );
    typed_subscribe!(
        /// Volume-weighted average price for `symbol`
        subscribe_to_vwap, Vwap, VwapPayload
    );
    typed_subscribe!(
        /// Cumulative volume delta for `symbol`
        subscribe_to_cvd, Cvd, CvdPayload
    );
    typed_subscribe!(
        /// Forced liquidations for `symbol`
        subscribe_to_liquidations, Liquidation, LiquidationPayload
    );
    typed_subscribe!(
        /// Funding rate updates for `symbol`
        subscribe_to_funding, Funding, FundingPayload
    );

    pub fn connection_status(&self) -> ConnectionState {
        *self.inner.status.borrow()
    }

    /// Receiver notified on every connection state transition
    pub fn watch_connection_status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.status.clone()
    }

    /// Keys with at least one subscriber
    pub fn live_channels(&self) -> BTreeSet<ChannelKey> {
        self.inner.registry.keys()
    }

    pub fn metrics(&self) -> &FeedMetrics {
        &self.inner.metrics
    }
}
