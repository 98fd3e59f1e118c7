//! Parser module for upstream feed frames
//!
//! Decodes JSON frames into a [`ParsedFrame`] and validates per-channel
//! payloads before they reach any subscriber.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::channel::{ChannelKey, ChannelKind};
use crate::error::FeedError;

/// Epoch values at or above this are treated as milliseconds
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Aggressor side of a trade or liquidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl FromStr for TradeSide {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, FeedError> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "b" => Ok(TradeSide::Buy),
            "sell" | "s" => Ok(TradeSide::Sell),
            other => Err(FeedError::ParseError(format!("invalid side {other:?}"))),
        }
    }
}

impl<'de> Deserialize<'de> for TradeSide {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Executed trade
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TradePayload {
    pub price: Decimal,

    #[serde(alias = "qty")]
    pub quantity: Decimal,

    #[serde(default)]
    pub side: Option<TradeSide>,

    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default, deserialize_with = "deserialize_string_or_number")]
    pub trade_id: Option<String>,

    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Price level (price, quantity pair)
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order book update; a zero quantity removes the level
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DepthPayload {
    #[serde(default, deserialize_with = "deserialize_levels")]
    pub bids: Vec<Level>,

    #[serde(default, deserialize_with = "deserialize_levels")]
    pub asks: Vec<Level>,

    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl DepthPayload {
    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        live_levels(&self.bids).map(|l| l.price).max()
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        live_levels(&self.asks).map(|l| l.price).min()
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Volume imbalance over the best `levels` of each side, in [-1, 1]
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let mut bids: Vec<&Level> = live_levels(&self.bids).collect();
        let mut asks: Vec<&Level> = live_levels(&self.asks).collect();
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        let bid_volume: Decimal = bids.iter().take(levels).map(|l| l.quantity).sum();
        let ask_volume: Decimal = asks.iter().take(levels).map(|l| l.quantity).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }
}

fn live_levels(levels: &[Level]) -> impl Iterator<Item = &Level> {
    levels.iter().filter(|l| l.quantity > Decimal::ZERO)
}

/// Volume-weighted average price
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VwapPayload {
    pub vwap: Decimal,

    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Cumulative volume delta
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CvdPayload {
    pub cvd: Decimal,

    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Forced liquidation
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LiquidationPayload {
    pub price: Decimal,

    #[serde(alias = "qty")]
    pub quantity: Decimal,

    #[serde(default)]
    pub side: Option<TradeSide>,

    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Perpetual funding rate
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FundingPayload {
    pub rate: Decimal,

    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub next_funding: Option<DateTime<Utc>>,

    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Decoded payload, tagged by channel kind
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Trade(TradePayload),
    Depth(DepthPayload),
    Vwap(VwapPayload),
    Cvd(CvdPayload),
    Liquidation(LiquidationPayload),
    Funding(FundingPayload),
}

impl MarketEvent {
    pub fn kind(&self) -> ChannelKind {
        match self {
            MarketEvent::Trade(_) => ChannelKind::Trade,
            MarketEvent::Depth(_) => ChannelKind::Depth,
            MarketEvent::Vwap(_) => ChannelKind::Vwap,
            MarketEvent::Cvd(_) => ChannelKind::Cvd,
            MarketEvent::Liquidation(_) => ChannelKind::Liquidation,
            MarketEvent::Funding(_) => ChannelKind::Funding,
        }
    }

    /// Decode and validate the payload of a frame already known to be `kind`
    pub fn decode(kind: ChannelKind, value: Value) -> Result<Self, FeedError> {
        let event = match kind {
            ChannelKind::Trade => MarketEvent::Trade(payload(kind, value)?),
            ChannelKind::Depth => MarketEvent::Depth(payload(kind, value)?),
            ChannelKind::Vwap => MarketEvent::Vwap(payload(kind, value)?),
            ChannelKind::Cvd => MarketEvent::Cvd(payload(kind, value)?),
            ChannelKind::Liquidation => MarketEvent::Liquidation(payload(kind, value)?),
            ChannelKind::Funding => MarketEvent::Funding(payload(kind, value)?),
        };
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), FeedError> {
        match self {
            MarketEvent::Trade(trade) => check_fill(trade.price, trade.quantity),
            MarketEvent::Liquidation(liq) => check_fill(liq.price, liq.quantity),
            MarketEvent::Depth(depth) => depth
                .bids
                .iter()
                .chain(&depth.asks)
                .try_for_each(|level| check_fill(level.price, level.quantity)),
            MarketEvent::Vwap(_) | MarketEvent::Cvd(_) | MarketEvent::Funding(_) => Ok(()),
        }
    }
}

fn payload<T: DeserializeOwned>(kind: ChannelKind, value: Value) -> Result<T, FeedError> {
    serde_json::from_value(value)
        .map_err(|e| FeedError::ParseError(format!("invalid {kind} payload: {e}")))
}

fn check_fill(price: Decimal, quantity: Decimal) -> Result<(), FeedError> {
    if price <= Decimal::ZERO {
        return Err(FeedError::ParseError(format!("non-positive price {price}")));
    }
    if quantity < Decimal::ZERO {
        return Err(FeedError::ParseError(format!("negative quantity {quantity}")));
    }
    Ok(())
}

/// Parsed upstream frame
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    /// Market data addressed to one channel key
    Event { key: ChannelKey, event: MarketEvent },
    /// Several frames delivered together, in order
    Batch(Vec<Value>),
    /// Acknowledgement of a control message
    Ack(String),
    /// Error reply from the server
    Rejected(String),
    /// Frame for a channel kind this client does not know
    Unrouted(String),
}

impl ParsedFrame {
    /// Parse a raw WebSocket text frame
    pub fn parse(raw: &str) -> Result<Self, FeedError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    /// Parse an already decoded JSON value (e.g., an item of a batch)
    pub fn from_value(value: Value) -> Result<Self, FeedError> {
        let Value::Object(mut map) = value else {
            return Err(FeedError::ParseError("frame is not a JSON object".to_string()));
        };

        if let Some(error) = map.get("error") {
            return Ok(ParsedFrame::Rejected(text_of(error)));
        }

        let Some(kind) = string_field(&map, "type").or_else(|| string_field(&map, "channel"))
        else {
            if map.contains_key("status") {
                let message = map.get("message").map(text_of).unwrap_or_default();
                return Ok(ParsedFrame::Ack(message));
            }
            return Err(FeedError::ParseError("frame has no channel type".to_string()));
        };

        if kind == "batch" {
            return match map.remove("batch") {
                Some(Value::Array(items)) => Ok(ParsedFrame::Batch(items)),
                _ => Err(FeedError::ParseError("batch frame without items".to_string())),
            };
        }

        // "channel" may carry the combined "<kind>:<symbol>" form
        let (kind, symbol) = match string_field(&map, "symbol") {
            Some(symbol) => (kind, symbol),
            None => match kind.split_once(':') {
                Some((kind, symbol)) => (kind.to_string(), symbol.to_string()),
                None => {
                    return Err(FeedError::ParseError(format!("{kind} frame has no symbol")));
                }
            },
        };

        let Some(kind) = ChannelKind::from_wire(&kind) else {
            return Ok(ParsedFrame::Unrouted(kind));
        };

        let key = ChannelKey::new(kind, symbol)?;
        let event = MarketEvent::decode(kind, Value::Object(map))?;
        Ok(ParsedFrame::Event { key, event })
    }
}

fn string_field(map: &Map<String, Value>, name: &str) -> Option<String> {
    map.get(name).and_then(Value::as_str).map(str::to_string)
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Accepts RFC 3339 strings, epoch seconds, or epoch milliseconds
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Text(String),
        Epoch(f64),
    }

    match Option::<RawTimestamp>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawTimestamp::Text(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(de::Error::custom),
        Some(RawTimestamp::Epoch(value)) => {
            if !value.is_finite() || value < 0.0 {
                return Err(de::Error::custom(format!("invalid epoch timestamp {value}")));
            }
            let millis = if value >= EPOCH_MILLIS_THRESHOLD {
                value
            } else {
                value * 1000.0
            };
            DateTime::from_timestamp_millis(millis as i64)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {value}")))
        }
    }
}

fn deserialize_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

/// Price levels as `{price, quantity}` objects or `[price, quantity]` pairs
fn deserialize_levels<'de, D>(deserializer: D) -> Result<Vec<Level>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawLevel {
        Object {
            price: Decimal,
            #[serde(alias = "qty")]
            quantity: Decimal,
        },
        Pair([Decimal; 2]),
    }

    let raw: Option<Vec<RawLevel>> = Deserialize::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|level| match level {
            RawLevel::Object { price, quantity } => Level { price, quantity },
            RawLevel::Pair([price, quantity]) => Level { price, quantity },
        })
        .collect())
}
