//! Marketfeed Feed - real-time synchronization core.
//!
//! Keeps one push session per exchange, tracks which channels callers want,
//! maintains order book replicas from snapshots and deltas, and fans
//! normalized events out to listeners.
//!
//! # Components
//!
//! - [`ConnectionSupervisor`] — Session lifecycle and inbound frame routing
//! - [`SubscriptionRegistry`] — Nonce correlation, ack timeouts, channel refcounts
//! - [`OrderBookStore`] — Order book replicas with sequence checking
//! - [`ProtocolAdapter`] — Per-exchange wire dialect
//! - [`EventDispatcher`] — Listener fan-out and side-channel notices
//! - [`MarketFeed`] — Multi-exchange entry point
//!
//! # Example
//!
//! ```rust,no_run
//! use marketfeed_feed::{EventKind, ExchangeConfig, FeedConfig, MarketFeed, ProtocolKind, SubscribeOptions, WsTransport};
//!
//! # async fn run() -> Result<(), marketfeed_feed::FeedError> {
//! let config = FeedConfig::new().with_exchange(ExchangeConfig::new("cex", ProtocolKind::Cex));
//! let feed = MarketFeed::new(config, WsTransport::new())?;
//!
//! feed.on_event(EventKind::OrderBook, |symbol, event| {
//!     println!("{symbol}: {event:?}");
//!     Ok(())
//! });
//! feed.subscribe(&"cex".into(), EventKind::OrderBook, "BTC/USD", SubscribeOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use adapter::{AckMode, BookFraming, Correlation, Frame, HandshakeStep, ProtocolAdapter};
pub use channel::{ChannelKey, EventKind};
pub use client::{MarketFeed, SubscribeOptions};
pub use config::{Credentials, ExchangeConfig, FeedConfig, ProtocolKind};
pub use dispatcher::{EventDispatcher, Listener, MarketEvent, Notice};
pub use error::{ErrorTable, ExchangeError, ExchangeErrorKind, FeedError};
pub use metrics::{FeedMetrics, FeedMetricsSnapshot};
pub use registry::{RequestKind, SubscriptionRegistry, Ticket};
pub use store::{BookKey, OrderBookStore};
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use transport::{MemoryTransport, Transport, TransportEvent, WsTransport};
