//! Market feed monitor
//!
//! Connects to the upstream market data feed, subscribes to the configured
//! symbols on every core channel, logs the updates, and serves health and
//! metrics endpoints.

use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use market_feed::{ConnectionState, FeedConfig, MarketFeed, Subscription};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting market feed monitor");

    let config = FeedConfig::load()?;
    info!(endpoint = %config.ws_endpoint, symbols = ?config.symbols, "Configuration loaded");

    let addr: SocketAddr = config.http_addr.parse()?;
    let feed = MarketFeed::create(config.clone())?;
    let subscriptions = subscribe_all(&feed, &config.symbols)?;

    let health_feed = feed.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_feed, addr).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    feed.shutdown().await;

    Ok(())
}

fn subscribe_all(feed: &MarketFeed, symbols: &[String]) -> market_feed::Result<Vec<Subscription>> {
    let mut subscriptions = Vec::with_capacity(symbols.len() * 4);

    for symbol in symbols {
        subscriptions.push(feed.subscribe_to_trades(symbol, |trade| {
            trace!(price = %trade.price, qty = %trade.quantity, side = ?trade.side, "Trade received");
        })?);

        let sym = symbol.clone();
        subscriptions.push(feed.subscribe_to_depth(symbol, move |depth| {
            debug!(
                symbol = %sym,
                mid_price = ?depth.mid_price(),
                spread_bps = ?depth.spread_bps(),
                imbalance = ?depth.imbalance(5),
                "Order book update"
            );
        })?);

        let sym = symbol.clone();
        subscriptions.push(feed.subscribe_to_vwap(symbol, move |vwap| {
            info!(symbol = %sym, vwap = %vwap.vwap, "VWAP update");
        })?);

        let sym = symbol.clone();
        subscriptions.push(feed.subscribe_to_cvd(symbol, move |cvd| {
            info!(symbol = %sym, cvd = %cvd.cvd, "CVD update");
        })?);
    }

    Ok(subscriptions)
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(feed: MarketFeed, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(feed);

    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(feed): State<MarketFeed>) -> Json<serde_json::Value> {
    let connection = feed.connection_status();
    let status = if connection == ConnectionState::Connected {
        "healthy"
    } else {
        "degraded"
    };

    Json(serde_json::json!({
        "status": status,
        "component": "market-feed",
        "connection": connection,
        "live_channels": feed.live_channels().len(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(feed): State<MarketFeed>) -> Result<String, (StatusCode, String)> {
    feed.metrics()
        .encode()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
