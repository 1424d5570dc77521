//! Feed error types.
//!
//! Provides the error taxonomy of the synchronization core and the
//! per-exchange tables used to classify server-reported errors.

use std::fmt;

use marketfeed_sdk::{ExchangeId, SdkError};

use crate::channel::{ChannelKey, EventKind};

/// Errors raised by the synchronization core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Handshake or transport failure while connecting.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Connection dropped mid-session.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No acknowledgment within the deadline.
    #[error("subscription to {key} timed out after {timeout_ms}ms")]
    SubscriptionTimeout {
        /// Channel the request was for.
        key: ChannelKey,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// Event kind not offered by the exchange.
    #[error("{kind} events are not supported by {exchange}")]
    UnsupportedEvent {
        /// Exchange.
        exchange: ExchangeId,
        /// Requested event kind.
        kind: EventKind,
    },

    /// Delta sequence discontinuity.
    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap {
        /// Sequence the replica expected next.
        expected: u64,
        /// Sequence carried by the rejected delta.
        received: u64,
    },

    /// Delta without a sequence on a sequenced book.
    #[error("delta without sequence: expected {expected}")]
    MissingSequence {
        /// Sequence the replica expected next.
        expected: u64,
    },

    /// Delta arrived before any snapshot.
    #[error("order book {0} not initialized")]
    OrderBookNotInitialized(String),

    /// Server-reported error.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Send attempted without an open session.
    #[error("not connected")]
    NotConnected,

    /// Exchange not configured.
    #[error("unknown exchange: {0}")]
    UnknownExchange(ExchangeId),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Frame could not be built.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid symbol or value.
    #[error(transparent)]
    Sdk(#[from] SdkError),
}

impl FeedError {
    /// Returns true if the error means the replica lost continuity.
    #[must_use]
    pub const fn is_sequence_fault(&self) -> bool {
        matches!(self, Self::SequenceGap { .. } | Self::MissingSequence { .. })
    }

    /// Returns true if the error means the session is gone.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectionLost(_) | Self::NotConnected
        )
    }
}

/// Category of a server-reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeErrorKind {
    /// Credentials rejected.
    Authentication,
    /// Too many requests.
    RateLimit,
    /// Unknown instrument or channel.
    NotFound,
    /// Malformed request.
    BadRequest,
    /// Exchange-side failure.
    Server,
    /// Not in the exchange's table.
    Generic,
}

impl fmt::Display for ExchangeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::RateLimit => write!(f, "rate limit"),
            Self::NotFound => write!(f, "not found"),
            Self::BadRequest => write!(f, "bad request"),
            Self::Server => write!(f, "server"),
            Self::Generic => write!(f, "exchange"),
        }
    }
}

/// A server-reported error after classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{exchange} {kind} error{}: {message}", code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default())]
pub struct ExchangeError {
    /// Exchange that reported the error.
    pub exchange: ExchangeId,
    /// Category.
    pub kind: ExchangeErrorKind,
    /// Server error code, if any.
    pub code: Option<String>,
    /// Server error message.
    pub message: String,
}

/// Static mapping from server error codes/messages to categories.
///
/// `exact` entries are matched against the code and then the full message;
/// `broad` entries match when the message contains them.
#[derive(Debug, Clone, Copy)]
pub struct ErrorTable {
    /// Exact code or message matches.
    pub exact: &'static [(&'static str, ExchangeErrorKind)],
    /// Substring matches against the message.
    pub broad: &'static [(&'static str, ExchangeErrorKind)],
}

impl ErrorTable {
    /// An empty table; everything maps to `Generic`.
    pub const EMPTY: Self = Self {
        exact: &[],
        broad: &[],
    };

    /// Classifies a server error.
    #[must_use]
    pub fn translate(
        &self,
        exchange: &ExchangeId,
        code: Option<&str>,
        message: &str,
    ) -> ExchangeError {
        let kind = self
            .lookup_exact(code)
            .or_else(|| self.lookup_exact(Some(message)))
            .or_else(|| {
                self.broad
                    .iter()
                    .find(|(needle, _)| message.contains(needle))
                    .map(|(_, kind)| *kind)
            })
            .unwrap_or(ExchangeErrorKind::Generic);

        ExchangeError {
            exchange: exchange.clone(),
            kind,
            code: code.map(str::to_string),
            message: message.to_string(),
        }
    }

    fn lookup_exact(&self, key: Option<&str>) -> Option<ExchangeErrorKind> {
        let key = key?;
        self.exact
            .iter()
            .find(|(candidate, _)| *candidate == key)
            .map(|(_, kind)| *kind)
    }
}
