//! Core types for the Marketfeed SDK.

pub mod book;
pub mod codec;
pub mod market;
pub mod primitives;
pub mod symbol;
pub mod trade;

pub use book::{BookUpdate, OrderBookView, PriceLevel};
pub use codec::{Case, SymbolCodec, WireStyle};
pub use market::{Market, MarketDirectory};
pub use primitives::{decimal_from_json, millis_from_rfc3339, Side};
pub use symbol::{ExchangeId, Symbol};
pub use trade::Trade;
