//! WebSocket connection manager
//!
//! Handles reconnection logic, interest declaration, and message dispatch.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::{ControlMessage, Frame, LiveInterest, WebSocketClient};
use crate::channel::ChannelKey;
use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::metrics::FeedMetrics;
use crate::registry::{ChannelRegistry, InterestSink};
use crate::router::MessageRouter;
use crate::status::{ConnectionState, ConnectionStatusPublisher};

/// Largest power of two applied to the base reconnect delay
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Requests handled by the connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Declare(ChannelKey),
    Drop(ChannelKey),
    Shutdown,
}

/// Forwards registry interest changes to the connection task
pub struct CommandSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }
}

impl InterestSink for CommandSink {
    fn declare_interest(&self, key: &ChannelKey) {
        if self.tx.send(Command::Declare(key.clone())).is_err() {
            debug!(channel = %key, "Connection task stopped, declare not forwarded");
        }
    }

    fn drop_interest(&self, key: &ChannelKey) {
        if self.tx.send(Command::Drop(key.clone())).is_err() {
            debug!(channel = %key, "Connection task stopped, drop not forwarded");
        }
    }
}

/// Why a connection session ended
enum SessionEnd {
    Shutdown,
    Lost(FeedError),
}

/// Reconnect delay for the given attempt (1-based)
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Owns the upstream connection with automatic reconnection
pub struct ConnectionManager {
    client: WebSocketClient,
    config: FeedConfig,
    registry: Arc<ChannelRegistry>,
    router: MessageRouter,
    commands: mpsc::UnboundedReceiver<Command>,
    status: ConnectionStatusPublisher,
    interest: LiveInterest,
    metrics: FeedMetrics,
    reconnect_attempts: u32,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: FeedConfig,
        registry: Arc<ChannelRegistry>,
        commands: mpsc::UnboundedReceiver<Command>,
        status: ConnectionStatusPublisher,
        metrics: FeedMetrics,
    ) -> Self {
        let client = WebSocketClient::new(&config.ws_endpoint);
        let router = MessageRouter::new(Arc::clone(&registry), metrics.clone());

        Self {
            client,
            config,
            registry,
            router,
            commands,
            status,
            interest: LiveInterest::new(),
            metrics,
            reconnect_attempts: 0,
        }
    }

    /// Run until shutdown, reconnecting after every failure
    pub async fn run(mut self) {
        info!(endpoint = %self.config.ws_endpoint, "Starting connection manager");

        loop {
            self.status.publish(ConnectionState::Connecting);

            let end = match self.connect().await {
                Ok(()) => match self.on_connected().await {
                    Ok(()) => self.process().await,
                    Err(e) => SessionEnd::Lost(e),
                },
                Err(end) => end,
            };

            self.interest.reset();
            if self.client.is_connected() {
                self.client.close().await;
            }
            self.status.publish(ConnectionState::Disconnected);

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(e) => {
                    self.reconnect_attempts += 1;
                    self.metrics.reconnects.inc();

                    let delay = backoff_delay(
                        self.config.reconnect_delay(),
                        self.config.max_backoff(),
                        self.reconnect_attempts,
                    );
                    warn!(
                        error = %e,
                        attempt = self.reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting after error..."
                    );

                    if !self.wait(delay).await {
                        break;
                    }
                }
            }
        }

        info!("Connection manager stopped");
    }

    /// Perform the handshake; a shutdown request aborts it
    async fn connect(&mut self) -> std::result::Result<(), SessionEnd> {
        let handshake = timeout(self.config.connect_timeout(), self.client.connect());
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                result = &mut handshake => {
                    return match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(SessionEnd::Lost(e)),
                        Err(_) => Err(SessionEnd::Lost(FeedError::ConnectionTimeout)),
                    };
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return Err(SessionEnd::Shutdown),
                    // Covered by the re-declaration after the handshake
                    Some(_) => {}
                },
            }
        }
    }

    /// Re-declare every live key on a fresh connection
    async fn on_connected(&mut self) -> Result<()> {
        self.reconnect_attempts = 0;
        self.status.publish(ConnectionState::Connected);

        let messages = self.interest.redeclare(self.registry.keys());
        info!(channels = messages.len(), "Declaring live channels");
        for message in messages {
            self.send_control(Some(message)).await?;
        }
        Ok(())
    }

    /// Pump frames and interest changes until the connection is lost
    async fn process(&mut self) -> SessionEnd {
        let stale_timeout = self.config.stale_timeout();
        let mut last_message = Instant::now();
        let mut probed = false;

        loop {
            tokio::select! {
                frame = self.client.recv() => match frame {
                    Ok(Some(frame)) => {
                        last_message = Instant::now();
                        probed = false;
                        match frame {
                            Frame::Text(text) => self.router.on_frame(&text),
                            Frame::Binary(data) => self.router.on_binary(&data),
                        };
                    }
                    Ok(None) => {
                        last_message = Instant::now();
                        probed = false;
                    }
                    Err(e) => return SessionEnd::Lost(e),
                },
                command = self.commands.recv() => {
                    let message = match command {
                        None | Some(Command::Shutdown) => return SessionEnd::Shutdown,
                        Some(Command::Declare(key)) => {
                            let wanted = self.registry.contains(&key);
                            self.interest.declare(&key, wanted)
                        }
                        Some(Command::Drop(key)) => {
                            let wanted = self.registry.contains(&key);
                            self.interest.release(&key, wanted)
                        }
                    };
                    if let Err(e) = self.send_control(message).await {
                        return SessionEnd::Lost(e);
                    }
                },
                _ = sleep_until(last_message + stale_timeout) => {
                    if probed {
                        warn!("Keepalive ping went unanswered, reconnecting");
                        return SessionEnd::Lost(FeedError::ConnectionTimeout);
                    }
                    warn!(
                        silent_ms = stale_timeout.as_millis() as u64,
                        "No message received within timeout, sending keepalive"
                    );
                    if let Err(e) = self.client.ping().await {
                        warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                        return SessionEnd::Lost(FeedError::ConnectionTimeout);
                    }
                    probed = true;
                    last_message = Instant::now();
                },
            }
        }
    }

    async fn send_control(&mut self, message: Option<ControlMessage>) -> Result<()> {
        let Some(message) = message else {
            return Ok(());
        };
        debug!(action = ?message.action, channel = %message.channel, "Sending control message");
        self.client.send(message.to_json()?).await
    }

    /// Sleep through the backoff; returns false if shutdown was requested
    async fn wait(&mut self, delay: Duration) -> bool {
        let backoff = sleep(delay);
        tokio::pin!(backoff);

        loop {
            tokio::select! {
                _ = &mut backoff => return true,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return false,
                    // Covered by the re-declaration after the next handshake
                    Some(_) => {}
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::parser::MarketEvent;
    use futures_util::StreamExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    /// Spawn a manager that already holds one live trade subscription
    fn spawn_manager(
        config: FeedConfig,
    ) -> (
        mpsc::UnboundedSender<Command>,
        FeedMetrics,
        tokio::task::JoinHandle<()>,
        crate::subscription::Subscription,
    ) {
        let metrics = FeedMetrics::new().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(CommandSink::new(tx.clone())),
            metrics.clone(),
        ));
        let subscription = registry.register(
            ChannelKey::new(ChannelKind::Trade, "BTCUSDT").unwrap(),
            Arc::new(|_: &MarketEvent| {}),
        );
        let (status, _) = ConnectionStatusPublisher::new(metrics.clone());

        let manager = ConnectionManager::new(config, registry, rx, status, metrics.clone());
        (tx, metrics, tokio::spawn(manager.run()), subscription)
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
                Message::Text(text) => return text,
                _ => continue,
            }
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);

        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, max, 7), Duration::from_millis(5000));
        assert_eq!(backoff_delay(base, Duration::from_secs(60), 50), Duration::from_millis(6400));
    }

    #[test]
    fn test_command_sink_forwards_interest() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = CommandSink::new(tx);
        let key = ChannelKey::new(crate::channel::ChannelKind::Trade, "BTCUSDT").unwrap();

        sink.declare_interest(&key);
        sink.drop_interest(&key);

        assert_eq!(rx.try_recv().unwrap(), Command::Declare(key.clone()));
        assert_eq!(rx.try_recv().unwrap(), Command::Drop(key.clone()));
        drop(rx);

        // A stopped task is not an error for the caller
        sink.declare_interest(&key);
    }

    #[tokio::test]
    async fn test_refused_connection_backs_off_until_shutdown() {
        let metrics = FeedMetrics::new().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(CommandSink::new(tx.clone())),
            metrics.clone(),
        ));
        let (status, mut status_rx) = ConnectionStatusPublisher::new(metrics.clone());
        let config = FeedConfig::new("ws://127.0.0.1:1")
            .with_reconnect_delay(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(20));

        let manager = ConnectionManager::new(config, registry, rx, status, metrics.clone());
        let task = tokio::spawn(manager.run());

        timeout(Duration::from_secs(5), async {
            while metrics.reconnects.get() < 2 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_ne!(*status_rx.borrow_and_update(), ConnectionState::Connected);

        tx.send(Command::Shutdown).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(*status_rx.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_silent_connection_is_probed_then_replaced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = FeedConfig::new(format!("ws://{addr}"))
            .with_reconnect_delay(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(20))
            .with_stale_timeout(Duration::from_millis(150));
        let (tx, metrics, task, _subscription) = spawn_manager(config);

        // Complete the handshake, read the declare, then stop reading so
        // pings are never answered
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut silent = accept_async(stream).await.unwrap();
        let declare = r#"{"action":"subscribe","channel":"trade:BTCUSDT"}"#;
        assert_eq!(next_text(&mut silent).await, declare);

        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut fresh = accept_async(stream).await.unwrap();
        assert_eq!(next_text(&mut fresh).await, declare);
        assert_eq!(metrics.reconnects.get(), 1);

        // The abandoned socket saw a keepalive ping before it was closed
        let first = timeout(WAIT, silent.next()).await.unwrap().unwrap().unwrap();
        assert!(matches!(first, Message::Ping(_)), "expected ping, got {first:?}");

        tx.send(Command::Shutdown).unwrap();
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out_and_backs_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect_timeout = Duration::from_millis(150);
        let reconnect_delay = Duration::from_millis(50);
        let config = FeedConfig::new(format!("ws://{addr}"))
            .with_reconnect_delay(reconnect_delay)
            .with_max_backoff(Duration::from_millis(100))
            .with_connect_timeout(connect_timeout);
        let (tx, metrics, task, _subscription) = spawn_manager(config);

        // Accept TCP but never answer the upgrade request
        let (_stalled, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let started = Instant::now();
        let (_retry, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        // The client's timer starts just before our accept returns
        assert!(started.elapsed() >= connect_timeout);
        assert!(metrics.reconnects.get() >= 1);
        assert_eq!(metrics.connection_state.get(), 1);

        tx.send(Command::Shutdown).unwrap();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(metrics.connection_state.get(), 0);
    }
}
