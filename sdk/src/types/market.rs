//! Market directory types for the Marketfeed SDK.
//!
//! The directory is supplied by the REST side of each exchange integration
//! and maps exchange-native instrument identifiers to canonical symbols.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::symbol::Symbol;

/// One tradable instrument as listed by an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    /// Exchange-native identifier (e.g., "btceur").
    pub id: String,

    /// Canonical symbol (e.g., "BTC/EUR").
    pub symbol: Symbol,
}

impl Market {
    /// Creates a new market entry.
    #[must_use]
    pub fn new(id: impl Into<String>, symbol: Symbol) -> Self {
        Self {
            id: id.into(),
            symbol,
        }
    }

    /// Returns the base currency.
    #[must_use]
    pub fn base(&self) -> &str {
        self.symbol.base()
    }

    /// Returns the quote currency.
    #[must_use]
    pub fn quote(&self) -> &str {
        self.symbol.quote()
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.symbol, self.id)
    }
}

/// Bidirectional lookup between exchange ids and canonical symbols.
///
/// Id lookups are case-insensitive since several exchanges echo ids back in
/// a different case than they list them.
#[derive(Debug, Clone, Default)]
pub struct MarketDirectory {
    by_id: HashMap<String, Symbol>,
    by_symbol: HashMap<Symbol, String>,
}

impl MarketDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a directory from a list of markets.
    ///
    /// Later entries win when ids or symbols repeat.
    #[must_use]
    pub fn from_markets(markets: impl IntoIterator<Item = Market>) -> Self {
        let mut directory = Self::new();
        for market in markets {
            directory.insert(market);
        }
        directory
    }

    /// Adds or replaces a market.
    pub fn insert(&mut self, market: Market) {
        self.by_id
            .insert(market.id.to_ascii_lowercase(), market.symbol.clone());
        self.by_symbol.insert(market.symbol, market.id);
    }

    /// Returns the canonical symbol for an exchange id.
    #[must_use]
    pub fn symbol(&self, id: &str) -> Option<&Symbol> {
        self.by_id.get(&id.to_ascii_lowercase())
    }

    /// Returns the exchange id for a canonical symbol.
    #[must_use]
    pub fn id(&self, symbol: &Symbol) -> Option<&str> {
        self.by_symbol.get(symbol).map(String::as_str)
    }

    /// Returns the number of markets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    /// Returns true if the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        s.parse().expect("symbol")
    }

    #[test]
    fn test_market_legs() {
        let market = Market::new("btceur", sym("BTC/EUR"));
        assert_eq!(market.base(), "BTC");
        assert_eq!(market.quote(), "EUR");
        assert_eq!(market.to_string(), "BTC/EUR (btceur)");
    }

    #[test]
    fn test_directory_lookup() {
        let directory = MarketDirectory::from_markets(vec![
            Market::new("btceur", sym("BTC/EUR")),
            Market::new("ethusd", sym("ETH/USD")),
        ]);

        assert_eq!(directory.len(), 2);
        assert_eq!(directory.symbol("btceur"), Some(&sym("BTC/EUR")));
        assert_eq!(directory.symbol("BTCEUR"), Some(&sym("BTC/EUR")));
        assert_eq!(directory.id(&sym("ETH/USD")), Some("ethusd"));
        assert!(directory.symbol("xrpusd").is_none());
    }

    #[test]
    fn test_directory_empty() {
        let directory = MarketDirectory::new();
        assert!(directory.is_empty());
        assert!(directory.id(&sym("BTC/EUR")).is_none());
    }

    #[test]
    fn test_market_serde() {
        let json = r#"{"id":"btceur","symbol":"BTC/EUR"}"#;
        let market: Market = serde_json::from_str(json).expect("deserialize");
        assert_eq!(market.symbol, sym("BTC/EUR"));
    }
}
