//! Protocol adapters.
//!
//! Each exchange supplies one [`ProtocolAdapter`] translating its wire
//! dialect to the generic frame model. [`build`] is the only place that
//! selects behavior by exchange.

pub mod bitstamp;
pub mod cex;
pub mod hollaex;

pub use bitstamp::BitstampAdapter;
pub use cex::CexAdapter;
pub use hollaex::HollaexAdapter;

use std::fmt;
use std::sync::Arc;

use marketfeed_sdk::{BookUpdate, ExchangeId, MarketDirectory, Symbol, SymbolCodec, Trade};

use crate::channel::{ChannelKey, EventKind};
use crate::config::{ExchangeConfig, ProtocolKind};
use crate::error::{ExchangeError, FeedError};

/// How subscription requests are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The ack echoes the request nonce.
    Nonce,
    /// The ack echoes the channel name.
    Channel,
    /// No ack; subscription is local bookkeeping only.
    None,
}

/// How order book frames relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookFraming {
    /// Snapshots and deltas are distinct; a delta before a snapshot is rejected.
    Explicit,
    /// The first book frame after subscribing is the snapshot.
    FirstIsSnapshot,
}

/// Links an ack or error frame to a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Request nonce.
    Nonce(u64),
    /// Channel the request was for.
    Channel(ChannelKey),
}

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nonce(nonce) => write!(f, "nonce {nonce}"),
            Self::Channel(key) => write!(f, "channel {key}"),
        }
    }
}

/// A step of the session handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Send this frame and keep waiting.
    Send(String),
    /// The session is open.
    Ready,
    /// The server refused the session.
    Rejected(ExchangeError),
}

/// Classification of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Handshake progress.
    Handshake(HandshakeStep),
    /// Protocol keep-alive; send the frame back.
    Reply(String),
    /// Subscription acknowledged or refused.
    SubscribeAck {
        /// Request the ack answers.
        correlation: Correlation,
        /// Outcome.
        result: Result<(), ExchangeError>,
        /// Initial book carried by the ack.
        snapshot: Option<(Symbol, BookUpdate)>,
    },
    /// Unsubscription acknowledged or refused.
    UnsubscribeAck {
        /// Request the ack answers.
        correlation: Correlation,
        /// Outcome.
        result: Result<(), ExchangeError>,
    },
    /// Full order book.
    Snapshot {
        /// Canonical symbol.
        symbol: Symbol,
        /// Book contents.
        book: BookUpdate,
    },
    /// Order book change.
    Delta {
        /// Canonical symbol.
        symbol: Symbol,
        /// Changed levels.
        update: BookUpdate,
    },
    /// Executed trades.
    Trades {
        /// Canonical symbol.
        symbol: Symbol,
        /// Trades, oldest first.
        trades: Vec<Trade>,
    },
    /// Server-reported error.
    Error {
        /// Request the error answers, if any.
        correlation: Option<Correlation>,
        /// Classified error.
        error: ExchangeError,
    },
    /// Server asked the client to reconnect.
    ReconnectRequested,
    /// Anything else.
    Unrecognized,
}

/// Wire dialect of one exchange.
pub trait ProtocolAdapter: Send + Sync + fmt::Debug {
    /// Returns the exchange identifier.
    fn exchange(&self) -> &ExchangeId;

    /// Returns the endpoint to connect to.
    fn endpoint(&self) -> &str;

    /// Returns the event kinds the exchange offers.
    fn supported_events(&self) -> &[EventKind];

    /// Returns true if the exchange offers the event kind.
    fn supports(&self, kind: EventKind) -> bool {
        self.supported_events().contains(&kind)
    }

    /// Returns the acknowledgment mode.
    fn ack_mode(&self) -> AckMode;

    /// Returns the order book framing.
    fn book_framing(&self) -> BookFraming;

    /// Returns true if the session is only open after a handshake.
    fn requires_handshake(&self) -> bool;

    /// Returns the symbol codec.
    fn codec(&self) -> &SymbolCodec;

    /// Classifies a raw inbound frame.
    fn classify(&self, raw: &str) -> Frame;

    /// Builds the subscribe frame. `None` means nothing goes on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be built.
    fn encode_subscribe(&self, key: &ChannelKey, nonce: u64) -> Result<Option<String>, FeedError>;

    /// Builds the unsubscribe frame. `None` means nothing goes on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be built.
    fn encode_unsubscribe(&self, key: &ChannelKey, nonce: u64)
        -> Result<Option<String>, FeedError>;
}

/// Builds the adapter for a configured exchange.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn build(config: &ExchangeConfig) -> Result<Arc<dyn ProtocolAdapter>, FeedError> {
    config.validate()?;
    let directory = Arc::new(MarketDirectory::from_markets(config.markets.iter().cloned()));

    let adapter: Arc<dyn ProtocolAdapter> = match config.protocol {
        ProtocolKind::Cex => Arc::new(CexAdapter::new(config, directory)),
        ProtocolKind::Hollaex => Arc::new(HollaexAdapter::new(config, directory)),
        ProtocolKind::Bitstamp => Arc::new(BitstampAdapter::new(config, directory)),
    };
    Ok(adapter)
}

/// Reads an optional string or number field as text.
pub(crate) fn text_field(value: &serde_json::Value, field: &str) -> Option<String> {
    match value.get(field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads an optional unsigned integer given as a string or number.
pub(crate) fn u64_field(value: &serde_json::Value, field: &str) -> Option<u64> {
    match value.get(field)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
