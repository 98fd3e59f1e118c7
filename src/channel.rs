//! Channel addressing
//!
//! A [`ChannelKey`] pairs a [`ChannelKind`] with an instrument symbol and is
//! the only unit used for routing frames and tracking subscribers.

use std::fmt;
use std::str::FromStr;

use crate::error::{FeedError, Result};

const MAX_SYMBOL_LEN: usize = 64;

/// Category of market data carried by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Trade,
    Depth,
    Vwap,
    Cvd,
    Liquidation,
    Funding,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::Trade,
        ChannelKind::Depth,
        ChannelKind::Vwap,
        ChannelKind::Cvd,
        ChannelKind::Liquidation,
        ChannelKind::Funding,
    ];

    /// Name used for this kind in upstream control messages
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Trade => "trade",
            ChannelKind::Depth => "orderbook",
            ChannelKind::Vwap => "vwap",
            ChannelKind::Cvd => "cvd",
            ChannelKind::Liquidation => "liquidation",
            ChannelKind::Funding => "funding",
        }
    }

    /// Resolve a wire name, including accepted aliases
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "trade" => Some(ChannelKind::Trade),
            "orderbook" | "depth" => Some(ChannelKind::Depth),
            "vwap" => Some(ChannelKind::Vwap),
            "cvd" => Some(ChannelKind::Cvd),
            "liquidation" => Some(ChannelKind::Liquidation),
            "funding" => Some(ChannelKind::Funding),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_wire(s).ok_or_else(|| FeedError::UnknownChannel(s.to_string()))
    }
}

/// (channel kind, symbol) address of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    kind: ChannelKind,
    symbol: String,
}

impl ChannelKey {
    /// Create a key, rejecting symbols that cannot be carried on the wire
    pub fn new(kind: ChannelKind, symbol: impl Into<String>) -> Result<Self> {
        let symbol = symbol.into();
        validate_symbol(&symbol)?;
        Ok(Self { kind, symbol })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Upstream channel name, e.g. "trade:BTCUSDT"
    pub fn wire_channel(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.symbol)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.symbol)
    }
}

impl FromStr for ChannelKey {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, symbol) = s
            .split_once(':')
            .ok_or_else(|| FeedError::UnknownChannel(s.to_string()))?;
        ChannelKey::new(kind.parse()?, symbol)
    }
}

/// Symbols are case-sensitive; ':' is reserved as the wire separator
fn validate_symbol(symbol: &str) -> Result<()> {
    let valid = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'));

    if valid {
        Ok(())
    } else {
        Err(FeedError::InvalidSymbol(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_is_case_sensitive() {
        let upper = ChannelKey::new(ChannelKind::Trade, "BTCUSDT").unwrap();
        let lower = ChannelKey::new(ChannelKind::Trade, "btcusdt").unwrap();
        let depth = ChannelKey::new(ChannelKind::Depth, "BTCUSDT").unwrap();

        assert_ne!(upper, lower);
        assert_ne!(upper, depth);
        assert_eq!(upper, ChannelKey::new(ChannelKind::Trade, "BTCUSDT").unwrap());
    }

    #[test]
    fn test_invalid_symbols_rejected() {
        for symbol in ["", "BTC USDT", "trade:BTCUSDT", "BTC\n", &"X".repeat(65)] {
            assert!(
                matches!(
                    ChannelKey::new(ChannelKind::Trade, symbol),
                    Err(FeedError::InvalidSymbol(_))
                ),
                "{symbol:?} should be rejected"
            );
        }
        assert!(ChannelKey::new(ChannelKind::Trade, "BTC/USD").is_ok());
        assert!(ChannelKey::new(ChannelKind::Trade, "BTC-PERP").is_ok());
    }

    #[test]
    fn test_wire_names() {
        let key = ChannelKey::new(ChannelKind::Depth, "ETHUSDT").unwrap();
        assert_eq!(key.wire_channel(), "orderbook:ETHUSDT");
        assert_eq!(ChannelKind::from_wire("depth"), Some(ChannelKind::Depth));
        assert_eq!(ChannelKind::from_wire("news"), None);
        assert_eq!(ChannelKind::from_wire("TRADE"), None);

        let parsed: ChannelKey = "vwap:SOLUSDT".parse().unwrap();
        assert_eq!(parsed.kind(), ChannelKind::Vwap);
        assert_eq!(parsed.symbol(), "SOLUSDT");
        assert!("news:BTCUSDT".parse::<ChannelKey>().is_err());
    }

    #[test]
    fn test_parsed_keys_validate_symbol() {
        for raw in ["trade:BTC USDT", "trade:BTC:USDT", "trade:"] {
            assert!(
                matches!(raw.parse::<ChannelKey>(), Err(FeedError::InvalidSymbol(_))),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_every_kind_round_trips_through_wire_name() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_wire(kind.as_str()), Some(kind));
        }
    }
}
