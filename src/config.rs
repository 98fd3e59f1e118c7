//! Configuration module for the market feed

use std::env;
use std::time::Duration;

use crate::error::{FeedError, Result};

/// Feed configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Upstream WebSocket endpoint (e.g., "ws://localhost:8000")
    pub ws_endpoint: String,

    /// Symbols the demo binary subscribes to (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,

    /// Address of the health check server
    pub http_addr: String,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_backoff_ms: u64,

    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Silence after which the connection is probed with a ping
    pub stale_timeout_ms: u64,
}

impl FeedConfig {
    /// Create a configuration for `endpoint` with default timings
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            ws_endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            ws_endpoint: env::var("WS_ENDPOINT")
                .unwrap_or_else(|_| "ws://localhost:8000".to_string()),
            symbols,
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_string()),
            reconnect_delay_ms: env_or("RECONNECT_DELAY_MS", 1000)?,
            max_backoff_ms: env_or("MAX_BACKOFF_MS", 30_000)?,
            connect_timeout_ms: env_or("CONNECT_TIMEOUT_SECS", 10)?.saturating_mul(1000),
            stale_timeout_ms: env_or("STALE_TIMEOUT_SECS", 45)?.saturating_mul(1000),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that the endpoint is a WebSocket URL and timings are usable
    pub fn validate(&self) -> Result<()> {
        if !(self.ws_endpoint.starts_with("ws://") || self.ws_endpoint.starts_with("wss://")) {
            return Err(FeedError::ConfigError(format!(
                "WS_ENDPOINT must be a ws:// or wss:// URL, got {:?}",
                self.ws_endpoint
            )));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(FeedError::ConfigError(
                "RECONNECT_DELAY_MS must be greater than zero".to_string(),
            ));
        }
        if self.max_backoff_ms < self.reconnect_delay_ms {
            return Err(FeedError::ConfigError(format!(
                "MAX_BACKOFF_MS ({}) is below RECONNECT_DELAY_MS ({})",
                self.max_backoff_ms, self.reconnect_delay_ms
            )));
        }
        if self.connect_timeout_ms == 0 || self.stale_timeout_ms == 0 {
            return Err(FeedError::ConfigError(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_endpoint: "ws://localhost:8000".to_string(),
            symbols: vec!["BTCUSDT".to_string()],
            http_addr: "0.0.0.0:9090".to_string(),
            reconnect_delay_ms: 1000,
            max_backoff_ms: 30_000,
            connect_timeout_ms: 10_000,
            stale_timeout_ms: 45_000,
        }
    }
}

fn env_or(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| FeedError::ConfigError(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}
