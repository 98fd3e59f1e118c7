//! Connection status publishing

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::info;

use crate::metrics::FeedMetrics;

/// Tri-state upstream connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single writer of the connection state
pub struct ConnectionStatusPublisher {
    tx: watch::Sender<ConnectionState>,
    metrics: FeedMetrics,
}

impl ConnectionStatusPublisher {
    /// Create a publisher in the initial `Connecting` state
    pub fn new(metrics: FeedMetrics) -> (Self, watch::Receiver<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        metrics
            .connection_state
            .set(ConnectionState::Connecting.gauge_value());
        (Self { tx, metrics }, rx)
    }

    /// Publish `state`; returns false if it was already current
    pub fn publish(&self, state: ConnectionState) -> bool {
        let mut previous = state;
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            previous = *current;
            *current = state;
            true
        });

        if changed {
            self.metrics.connection_state.set(state.gauge_value());
            info!(from = %previous, to = %state, "Connection state changed");
        }
        changed
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[test]
    fn test_starts_connecting() {
        let metrics = FeedMetrics::new().unwrap();
        let (publisher, rx) = ConnectionStatusPublisher::new(metrics.clone());

        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
        assert_eq!(publisher.current(), ConnectionState::Connecting);
        assert_eq!(metrics.connection_state.get(), 1);
    }

    #[test]
    fn test_only_transitions_notify() {
        let metrics = FeedMetrics::new().unwrap();
        let (publisher, mut rx) = ConnectionStatusPublisher::new(metrics.clone());

        assert!(!publisher.publish(ConnectionState::Connecting));

        {
            let mut changed = task::spawn(rx.changed());
            assert_pending!(changed.poll());

            assert!(publisher.publish(ConnectionState::Connected));
            assert!(changed.is_woken());
            assert_ready_ok!(changed.poll());
        }

        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connected);
        assert_eq!(metrics.connection_state.get(), 2);

        assert!(!publisher.publish(ConnectionState::Connected));
        assert!(!rx.has_changed().unwrap());

        assert!(publisher.publish(ConnectionState::Disconnected));
        assert_eq!(*publisher.subscribe().borrow(), ConnectionState::Disconnected);
        assert_eq!(metrics.connection_state.get(), 0);
    }

    #[test]
    fn test_display_matches_wire_names() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Disconnected).unwrap(),
            "\"disconnected\""
        );
    }
}
