//! Channel identifiers.
//!
//! A channel is one event kind for one canonical symbol; it is the unit of
//! subscription on every exchange.

use std::fmt;
use std::str::FromStr;

use marketfeed_sdk::Symbol;
use serde::{Deserialize, Serialize};

/// Kind of market event a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Order book snapshots and deltas.
    #[serde(rename = "orderbook")]
    OrderBook,
    /// Executed trades.
    Trade,
}

impl EventKind {
    /// All event kinds.
    pub const ALL: [Self; 2] = [Self::OrderBook, Self::Trade];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OrderBook => write!(f, "orderbook"),
            Self::Trade => write!(f, "trade"),
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orderbook" | "ob" => Ok(Self::OrderBook),
            "trade" | "trades" => Ok(Self::Trade),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Event kind plus canonical symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Event kind.
    pub kind: EventKind,
    /// Canonical symbol.
    pub symbol: Symbol,
}

impl ChannelKey {
    /// Creates a new channel key.
    #[must_use]
    pub const fn new(kind: EventKind, symbol: Symbol) -> Self {
        Self { kind, symbol }
    }

    /// Creates an order book channel key.
    #[must_use]
    pub const fn order_book(symbol: Symbol) -> Self {
        Self::new(EventKind::OrderBook, symbol)
    }

    /// Creates a trade channel key.
    #[must_use]
    pub const fn trades(symbol: Symbol) -> Self {
        Self::new(EventKind::Trade, symbol)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::OrderBook.to_string(), "orderbook");
        assert_eq!(EventKind::Trade.to_string(), "trade");
    }

    #[test]
    fn test_event_kind_from_str() {
        assert_eq!("orderbook".parse::<EventKind>(), Ok(EventKind::OrderBook));
        assert_eq!("trades".parse::<EventKind>(), Ok(EventKind::Trade));
        assert!("ticker".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_kind_serde() {
        let json = serde_json::to_string(&EventKind::OrderBook).expect("serialize");
        assert_eq!(json, "\"orderbook\"");
        let kind: EventKind = serde_json::from_str("\"trade\"").expect("deserialize");
        assert_eq!(kind, EventKind::Trade);
    }

    #[test]
    fn test_channel_key_display() {
        let key = ChannelKey::order_book("ETH/EUR".parse().expect("symbol"));
        assert_eq!(key.to_string(), "orderbook:ETH/EUR");
        assert_eq!(key.kind, EventKind::OrderBook);

        let key = ChannelKey::trades("ETH/EUR".parse().expect("symbol"));
        assert_eq!(key.to_string(), "trade:ETH/EUR");
    }
}
