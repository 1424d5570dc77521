//! Marketfeed SDK - exchange-agnostic market-data types.
//!
//! This crate provides the normalized schema that every exchange feed is
//! translated into, plus the symbol mapping used by the protocol adapters.
//!
//! # Core Types
//!
//! - [`Symbol`] — Canonical `BASE/QUOTE` instrument symbol
//! - [`ExchangeId`] — Exchange identifier
//! - [`Side`] — Trade side (Buy/Sell)
//!
//! # Entity Types
//!
//! - [`PriceLevel`] — A `(price, size)` pair
//! - [`BookUpdate`] — Snapshot or delta as decoded from the wire
//! - [`OrderBookView`] — Depth-limited, immutable order book copy
//! - [`Trade`] — Executed trade
//! - [`Market`], [`MarketDirectory`] — Exchange instrument directory
//! - [`SymbolCodec`] — Canonical/wire symbol translation
//!
//! # Example
//!
//! ```rust
//! use marketfeed_sdk::{Symbol, SymbolCodec, WireStyle, Case};
//!
//! let symbol: Symbol = "BTC/EUR".parse().unwrap();
//! let codec = SymbolCodec::new(WireStyle::Delimited { separator: '-', case: Case::Lower });
//! assert_eq!(codec.encode(&symbol), "btc-eur");
//! assert_eq!(codec.decode("btc-eur"), Some(symbol));
//! ```

pub mod error;
pub mod types;

pub use error::SdkError;
pub use types::{
    decimal_from_json, BookUpdate, Case, ExchangeId, Market, MarketDirectory, OrderBookView,
    PriceLevel, Side, Symbol, SymbolCodec, Trade, WireStyle,
};
