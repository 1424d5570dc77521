//! Marketfeed - multi-exchange market-data client.
//!
//! Re-exports the value types from [`marketfeed_sdk`] and the real-time
//! synchronization core from [`marketfeed_feed`].
//!
//! # Example
//!
//! ```rust,ignore
//! use marketfeed::feed::{EventKind, FeedConfig, MarketFeed, SubscribeOptions, WsTransport};
//!
//! let feed = MarketFeed::new(FeedConfig::from_json(&json)?, WsTransport::new())?;
//! feed.on_event(EventKind::OrderBook, |symbol, event| {
//!     println!("{symbol}: {event:?}");
//!     Ok(())
//! });
//! feed.subscribe(&"cex".into(), EventKind::OrderBook, "BTC/USD", SubscribeOptions::default())
//!     .await?;
//! ```

pub use marketfeed_feed as feed;
pub use marketfeed_sdk as sdk;

pub use marketfeed_feed::{EventKind, FeedConfig, FeedError, MarketFeed, SubscribeOptions};
pub use marketfeed_sdk::{ExchangeId, OrderBookView, Symbol, Trade};
