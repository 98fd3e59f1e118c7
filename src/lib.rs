//! Market feed - real-time market data subscription multiplexer
//!
//! This crate multiplexes many independent subscribers onto one upstream
//! WebSocket connection. Data is keyed by (channel kind, symbol); interest is
//! declared upstream when a key gains its first subscriber, dropped when it
//! loses its last one, and re-declared after every reconnect.
//!
//! ```no_run
//! use market_feed::{FeedConfig, MarketFeed};
//!
//! # async fn run() -> market_feed::Result<()> {
//! let feed = MarketFeed::create(FeedConfig::new("ws://localhost:8000"))?;
//! let trades = feed.subscribe_to_trades("BTCUSDT", |trade| {
//!     println!("{} @ {}", trade.quantity, trade.price);
//! })?;
//!
//! // ...
//! trades.unsubscribe();
//! feed.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod parser;
pub mod registry;
pub mod router;
pub mod status;
pub mod subscription;
pub mod websocket;

pub use channel::{ChannelKey, ChannelKind};
pub use config::FeedConfig;
pub use error::{FeedError, Result};
pub use feed::MarketFeed;
pub use metrics::FeedMetrics;
pub use parser::{
    CvdPayload, DepthPayload, FundingPayload, Level, LiquidationPayload, MarketEvent,
    ParsedFrame, TradePayload, TradeSide, VwapPayload,
};
pub use registry::{ChannelRegistry, InterestSink};
pub use router::MessageRouter;
pub use status::ConnectionState;
pub use subscription::Subscription;
