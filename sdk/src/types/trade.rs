//! Trade types for the Marketfeed SDK.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::primitives::Side;
use super::symbol::{ExchangeId, Symbol};

/// An executed trade, normalized across exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Exchange the trade happened on.
    pub exchange: ExchangeId,

    /// Canonical symbol.
    pub symbol: Symbol,

    /// Exchange trade ID, when the feed carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Taker side.
    pub side: Side,

    /// Trade price.
    pub price: Decimal,

    /// Traded amount in base currency.
    pub amount: Decimal,

    /// Timestamp in milliseconds since epoch.
    pub timestamp: i64,
}

impl Trade {
    /// Returns the notional value (price * amount).
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price * self.amount
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trade {} {} {} @ {} ({})",
            self.symbol, self.side, self.amount, self.price, self.exchange
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn create_test_trade() -> Trade {
        Trade {
            exchange: ExchangeId::new("bitstamp"),
            symbol: "BTC/EUR".parse().expect("symbol"),
            id: Some("83631877".to_string()),
            side: Side::Buy,
            price: dec!(3407.43),
            amount: dec!(0.5),
            timestamp: 1_551_914_592_860,
        }
    }

    #[test]
    fn test_trade_notional() {
        let trade = create_test_trade();
        assert_eq!(trade.notional(), dec!(1703.715));
    }

    #[test]
    fn test_trade_display() {
        let trade = create_test_trade();
        assert_eq!(trade.to_string(), "Trade BTC/EUR buy 0.5 @ 3407.43 (bitstamp)");
    }

    #[test]
    fn test_trade_serde() {
        let trade = create_test_trade();
        let json = serde_json::to_string(&trade).expect("serialize");
        assert!(json.contains(r#""side":"buy""#));
        assert!(json.contains(r#""symbol":"BTC/EUR""#));

        let parsed: Trade = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, trade);
    }
}
