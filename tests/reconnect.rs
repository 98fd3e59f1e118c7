//! End-to-end tests against a local WebSocket server

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use market_feed::{ConnectionState, FeedConfig, MarketFeed};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

/// Next control message sent by the client
async fn next_control(ws: &mut ServerSocket) -> Value {
    loop {
        let message = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn assert_no_control(ws: &mut ServerSocket) {
    if let Ok(Some(Ok(Message::Text(text)))) =
        timeout(Duration::from_millis(200), ws.next()).await
    {
        panic!("unexpected control message {text}");
    }
}

async fn wait_for_state(feed: &MarketFeed, state: ConnectionState) {
    let mut rx = feed.watch_connection_status();
    timeout(WAIT, rx.wait_for(|current| *current == state))
        .await
        .unwrap()
        .unwrap();
}

fn feed_for(listener: &TcpListener) -> MarketFeed {
    let addr = listener.local_addr().unwrap();
    let config = FeedConfig::new(format!("ws://{addr}"))
        .with_reconnect_delay(Duration::from_millis(20))
        .with_max_backoff(Duration::from_millis(50));
    MarketFeed::create(config).unwrap()
}

#[tokio::test]
async fn test_subscribe_receive_and_redeclare_after_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let feed = feed_for(&listener);

    let (tx, mut prices) = mpsc::unbounded_channel();
    let trades = feed
        .subscribe_to_trades("BTCUSDT", move |trade| {
            let _ = tx.send(trade.price);
        })
        .unwrap();

    let mut ws = accept(&listener).await;
    assert_eq!(
        next_control(&mut ws).await,
        json!({"action": "subscribe", "channel": "trade:BTCUSDT"})
    );
    assert_no_control(&mut ws).await;
    wait_for_state(&feed, ConnectionState::Connected).await;

    ws.send(Message::Text(
        r#"{"type":"trade","symbol":"ETHUSDT","price":3000,"quantity":1}"#.to_string(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        r#"{"type":"trade","symbol":"BTCUSDT","price":50000,"quantity":0.1,"side":"buy"}"#
            .to_string(),
    ))
    .await
    .unwrap();
    assert_eq!(timeout(WAIT, prices.recv()).await.unwrap(), Some(dec!(50000)));

    // Drop the connection; the client must come back and re-declare once
    drop(ws);
    let mut ws = accept(&listener).await;
    assert_eq!(
        next_control(&mut ws).await,
        json!({"action": "subscribe", "channel": "trade:BTCUSDT"})
    );
    assert_no_control(&mut ws).await;
    wait_for_state(&feed, ConnectionState::Connected).await;
    assert!(feed.metrics().reconnects.get() >= 1);

    trades.unsubscribe();
    assert_eq!(
        next_control(&mut ws).await,
        json!({"action": "unsubscribe", "channel": "trade:BTCUSDT"})
    );

    feed.shutdown().await;
    assert_eq!(feed.connection_status(), ConnectionState::Disconnected);
    assert!(prices.try_recv().is_err());
}

#[tokio::test]
async fn test_released_channels_are_not_redeclared() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let feed = feed_for(&listener);

    let vwap = feed.subscribe_to_vwap("BTCUSDT", |_| {}).unwrap();
    let _cvd = feed.subscribe_to_cvd("BTCUSDT", |_| {}).unwrap();

    let mut ws = accept(&listener).await;
    let mut declared = vec![next_control(&mut ws).await, next_control(&mut ws).await];
    declared.sort_by_key(|message| message["channel"].as_str().unwrap_or_default().to_string());
    assert_eq!(
        declared,
        vec![
            json!({"action": "subscribe", "channel": "cvd:BTCUSDT"}),
            json!({"action": "subscribe", "channel": "vwap:BTCUSDT"}),
        ]
    );

    // The next handshake stalls until the server accepts, so the release
    // lands while the client is between connections
    drop(ws);
    timeout(WAIT, async {
        while feed.metrics().reconnects.get() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    vwap.unsubscribe();

    let mut ws = accept(&listener).await;
    assert_eq!(
        next_control(&mut ws).await,
        json!({"action": "subscribe", "channel": "cvd:BTCUSDT"})
    );
    assert_no_control(&mut ws).await;

    feed.shutdown().await;
}

#[tokio::test]
async fn test_dropping_feed_stops_connection_task() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let feed = feed_for(&listener);
    let trades = feed.subscribe_to_trades("BTCUSDT", |_| {}).unwrap();

    let mut ws = accept(&listener).await;
    next_control(&mut ws).await;
    wait_for_state(&feed, ConnectionState::Connected).await;

    // The live subscription must not keep the task running
    drop(feed);
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap();
    drop(ws);

    assert!(
        timeout(Duration::from_millis(500), listener.accept())
            .await
            .is_err(),
        "client reconnected after the feed was dropped"
    );
    assert!(trades.is_active());
}
