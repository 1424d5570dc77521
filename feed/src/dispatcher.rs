//! Event fan-out.
//!
//! Listeners are registered per event kind and invoked synchronously, in
//! registration order. A failing listener is reported on the notice side
//! channel and never stops the others.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use marketfeed_sdk::{ExchangeId, OrderBookView, Symbol, Trade};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::channel::{ChannelKey, EventKind};
use crate::error::{ExchangeError, FeedError};

/// Normalized payload delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum MarketEvent {
    /// Merged order book view.
    #[serde(rename = "orderbook")]
    OrderBook(OrderBookView),
    /// Executed trade.
    Trade(Trade),
}

impl MarketEvent {
    /// Returns the event kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::OrderBook(_) => EventKind::OrderBook,
            Self::Trade(_) => EventKind::Trade,
        }
    }

    /// Returns the exchange the event came from.
    #[must_use]
    pub fn exchange(&self) -> &ExchangeId {
        match self {
            Self::OrderBook(book) => &book.exchange,
            Self::Trade(trade) => &trade.exchange,
        }
    }
}

/// Out-of-band report about the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A listener returned an error or panicked.
    ListenerFailed {
        /// Event kind being delivered.
        kind: EventKind,
        /// Symbol being delivered.
        symbol: Symbol,
        /// Registration index of the listener.
        listener: usize,
        /// Failure description.
        message: String,
    },
    /// The session dropped.
    ConnectionLost {
        /// Exchange.
        exchange: ExchangeId,
        /// Reason.
        reason: String,
    },
    /// A consistency fault forced a resynchronization.
    ResyncStarted {
        /// Exchange.
        exchange: ExchangeId,
        /// Book that faulted.
        symbol: Symbol,
        /// Fault.
        error: FeedError,
    },
    /// A channel could not be resubscribed after reconnecting.
    ResubscribeFailed {
        /// Exchange.
        exchange: ExchangeId,
        /// Channel.
        key: ChannelKey,
        /// Failure.
        error: FeedError,
    },
    /// The exchange reported an error outside any request.
    ExchangeError(ExchangeError),
}

/// Listener callback.
pub type Listener = Arc<dyn Fn(&Symbol, &MarketEvent) -> anyhow::Result<()> + Send + Sync>;

struct DispatcherInner {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
    notices: broadcast::Sender<Notice>,
}

/// Fan-out of normalized events to registered listeners.
///
/// Cloning yields another handle onto the same listener set.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.inner.listeners.read();
        f.debug_struct("EventDispatcher")
            .field("orderbook", &listeners.get(&EventKind::OrderBook).map_or(0, Vec::len))
            .field("trade", &listeners.get(&EventKind::Trade).map_or(0, Vec::len))
            .finish()
    }
}

impl EventDispatcher {
    /// Creates a dispatcher whose notice channel buffers `capacity` notices.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (notices, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                listeners: RwLock::new(HashMap::new()),
                notices,
            }),
        }
    }

    /// Registers a listener and returns its registration index.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> usize
    where
        F: Fn(&Symbol, &MarketEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut listeners = self.inner.listeners.write();
        let entry = listeners.entry(kind).or_default();
        entry.push(Arc::new(listener));
        entry.len() - 1
    }

    /// Returns the number of listeners for a kind.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Invokes every listener registered for the event's kind.
    ///
    /// Returns the number of listeners that failed.
    pub fn emit(&self, symbol: &Symbol, event: &MarketEvent) -> usize {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut failures = 0;
        for (index, listener) in listeners.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(symbol, event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };

            failures += 1;
            warn!(%kind, %symbol, listener = index, error = %message, "Listener failed");
            self.notify(Notice::ListenerFailed {
                kind,
                symbol: symbol.clone(),
                listener: index,
                message,
            });
        }

        failures
    }

    /// Publishes a notice. Dropped if nobody listens.
    pub fn notify(&self, notice: Notice) {
        let _ = self.inner.notices.send(notice);
    }

    /// Subscribes to the notice side channel.
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("listener panicked: {text}")
    } else {
        "listener panicked".to_string()
    }
}
