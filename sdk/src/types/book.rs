//! Order book types for the Marketfeed SDK.
//!
//! Provides the price level, the decoded wire update, and the immutable
//! depth-limited view handed to listeners.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::primitives::{decimal_from_json, Side};
use super::symbol::{ExchangeId, Symbol};
use crate::error::SdkError;

/// A price level in the order book.
///
/// Serialized as a `[price, size]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Decimal, Decimal)", into = "(Decimal, Decimal)")]
pub struct PriceLevel {
    /// Price.
    pub price: Decimal,

    /// Size resting at this price. Zero in a delta means "remove".
    pub size: Decimal,
}

impl PriceLevel {
    /// Creates a new price level.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Returns true if this level removes the price from the book.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.size.is_zero()
    }

    /// Parses a `[price, size, ...]` JSON array, ignoring trailing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an array of at least two
    /// numeric entries.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, SdkError> {
        let pair = value
            .as_array()
            .filter(|a| a.len() >= 2)
            .ok_or_else(|| SdkError::Deserialization(format!("not a price level: {value}")))?;

        let price = pair
            .first()
            .map(decimal_from_json)
            .transpose()?
            .ok_or_else(|| SdkError::InvalidPrice(value.to_string()))?;
        let size = pair
            .get(1)
            .map(decimal_from_json)
            .transpose()?
            .ok_or_else(|| SdkError::InvalidSize(value.to_string()))?;

        if price.is_sign_negative() {
            return Err(SdkError::InvalidPrice(price.to_string()));
        }
        if size.is_sign_negative() {
            return Err(SdkError::InvalidSize(size.to_string()));
        }

        Ok(Self { price, size })
    }

    /// Parses a JSON array of `[price, size]` pairs. A missing value is an
    /// empty side.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry is malformed.
    pub fn list_from_json(value: Option<&serde_json::Value>) -> Result<Vec<Self>, SdkError> {
        match value {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(serde_json::Value::Array(levels)) => levels.iter().map(Self::from_json).collect(),
            Some(other) => Err(SdkError::Deserialization(format!(
                "expected level list, got {other}"
            ))),
        }
    }
}

impl From<(Decimal, Decimal)> for PriceLevel {
    fn from((price, size): (Decimal, Decimal)) -> Self {
        Self { price, size }
    }
}

impl From<PriceLevel> for (Decimal, Decimal) {
    fn from(level: PriceLevel) -> Self {
        (level.price, level.size)
    }
}

impl fmt::Display for PriceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.size, self.price)
    }
}

/// An order book snapshot or delta as decoded from the wire.
///
/// Whether it replaces or merges into the replica is decided by the frame
/// it arrived in, not by the type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookUpdate {
    /// Bid levels.
    pub bids: Vec<PriceLevel>,

    /// Ask levels.
    pub asks: Vec<PriceLevel>,

    /// Exchange sequence number, for protocols that provide one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,

    /// Exchange timestamp in milliseconds since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl BookUpdate {
    /// Creates an update from both sides.
    #[must_use]
    pub fn new(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self {
            bids,
            asks,
            sequence: None,
            timestamp: None,
        }
    }

    /// Sets the sequence number.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Returns true if the update touches no level.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Immutable, depth-limited copy of an order book replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookView {
    /// Exchange the book belongs to.
    pub exchange: ExchangeId,

    /// Canonical symbol.
    pub symbol: Symbol,

    /// Bid levels (sorted by price descending).
    pub bids: Vec<PriceLevel>,

    /// Ask levels (sorted by price ascending).
    pub asks: Vec<PriceLevel>,

    /// Timestamp of the last applied update, in milliseconds since epoch.
    pub timestamp: i64,

    /// Sequence of the last applied update, if the protocol has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl OrderBookView {
    /// Returns the best bid price.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Returns the best ask price.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Returns the spread.
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Returns the midpoint price.
    #[must_use]
    pub fn midpoint(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Returns true if the book is crossed (bid >= ask).
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Returns the total size on one side up to a given depth.
    #[must_use]
    pub fn total_size(&self, side: Side, depth: usize) -> Decimal {
        self.levels(side).iter().take(depth).map(|l| l.size).sum()
    }

    /// Returns the level at a specific price on the given side.
    #[must_use]
    pub fn level_at(&self, side: Side, price: Decimal) -> Option<&PriceLevel> {
        self.levels(side).iter().find(|l| l.price == price)
    }

    /// Returns true if the book is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    fn levels(&self, side: Side) -> &[PriceLevel] {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }
}

impl fmt::Display for OrderBookView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "OrderBook {} on {}", self.symbol, self.exchange)?;
        writeln!(f, "  Asks:")?;
        for level in self.asks.iter().take(5).rev() {
            writeln!(f, "    {}", level)?;
        }
        writeln!(f, "  ---")?;
        writeln!(f, "  Bids:")?;
        for level in self.bids.iter().take(5) {
            writeln!(f, "    {}", level)?;
        }
        Ok(())
    }
}
