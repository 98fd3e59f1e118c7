//! Error types for the market feed

use thiserror::Error;

/// Market feed errors
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("Unknown channel kind: {0}")]
    UnknownChannel(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Market feed must be created inside a Tokio runtime")]
    RuntimeUnavailable,

    #[error("Connection timeout")]
    ConnectionTimeout,
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::ParseError(err.to_string())
    }
}

impl From<prometheus::Error> for FeedError {
    fn from(err: prometheus::Error) -> Self {
        FeedError::MetricsError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
