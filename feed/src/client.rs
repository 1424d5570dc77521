//! Feed client.
//!
//! [`MarketFeed`] is the entry point: one supervisor per configured exchange
//! sharing a single replica store and a single dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use marketfeed_sdk::{ExchangeId, OrderBookView, Symbol};
use tokio::sync::broadcast;

use crate::adapter;
use crate::channel::{ChannelKey, EventKind};
use crate::config::FeedConfig;
use crate::dispatcher::{EventDispatcher, MarketEvent, Notice};
use crate::error::FeedError;
use crate::metrics::FeedMetricsSnapshot;
use crate::store::{BookKey, OrderBookStore};
use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::transport::Transport;

/// Per-call subscription options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Acknowledgment timeout in milliseconds. `None` = configured default.
    pub timeout_ms: Option<u64>,
    /// Depth limit for emitted books. `None` = configured default.
    pub depth_limit: Option<usize>,
}

impl SubscribeOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the acknowledgment timeout.
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the depth limit.
    #[must_use]
    pub const fn with_depth_limit(mut self, depth: usize) -> Self {
        self.depth_limit = Some(depth);
        self
    }

    /// Returns the timeout, if set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Multi-exchange market data feed.
pub struct MarketFeed {
    config: FeedConfig,
    supervisors: HashMap<ExchangeId, ConnectionSupervisor>,
    store: OrderBookStore,
    dispatcher: EventDispatcher,
}

impl fmt::Debug for MarketFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketFeed")
            .field("exchanges", &self.supervisors.len())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl MarketFeed {
    /// Creates a feed over the given transport. No connection is opened.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new<T>(config: FeedConfig, transport: T) -> Result<Self, FeedError>
    where
        T: Transport + 'static,
    {
        Self::with_transport(config, Arc::new(transport))
    }

    /// Creates a feed over a shared transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_transport(config: FeedConfig, transport: Arc<dyn Transport>) -> Result<Self, FeedError> {
        config.validate()?;

        let store = OrderBookStore::new();
        let dispatcher = EventDispatcher::new(config.notice_capacity);
        let mut supervisors = HashMap::with_capacity(config.exchanges.len());

        for exchange in &config.exchanges {
            let supervisor = ConnectionSupervisor::new(
                adapter::build(exchange)?,
                Arc::clone(&transport),
                store.clone(),
                dispatcher.clone(),
                &config,
            );
            supervisors.insert(exchange.id.clone(), supervisor);
        }

        Ok(Self {
            config,
            supervisors,
            store,
            dispatcher,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Returns the configured exchanges, sorted.
    #[must_use]
    pub fn exchanges(&self) -> Vec<&ExchangeId> {
        let mut ids: Vec<&ExchangeId> = self.supervisors.keys().collect();
        ids.sort();
        ids
    }

    /// Returns the supervisor of an exchange.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::UnknownExchange`] if it is not configured.
    pub fn supervisor(&self, exchange: &ExchangeId) -> Result<&ConnectionSupervisor, FeedError> {
        self.supervisors
            .get(exchange)
            .ok_or_else(|| FeedError::UnknownExchange(exchange.clone()))
    }

    /// Subscribes to a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol is malformed, the exchange is unknown
    /// or lacks the event kind, the connection fails, or the subscription
    /// is refused or times out.
    pub async fn subscribe(
        &self,
        exchange: &ExchangeId,
        kind: EventKind,
        symbol: &str,
        options: SubscribeOptions,
    ) -> Result<(), FeedError> {
        let key = ChannelKey::new(kind, symbol.parse()?);
        self.supervisor(exchange)?
            .subscribe(&key, options.depth_limit, options.timeout())
            .await
    }

    /// Unsubscribes from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol is malformed, the exchange is unknown,
    /// or the unsubscription is refused or times out.
    pub async fn unsubscribe(
        &self,
        exchange: &ExchangeId,
        kind: EventKind,
        symbol: &str,
        options: SubscribeOptions,
    ) -> Result<(), FeedError> {
        let key = ChannelKey::new(kind, symbol.parse()?);
        self.supervisor(exchange)?
            .unsubscribe(&key, options.timeout())
            .await
    }

    /// Registers a listener for an event kind. Returns its index.
    pub fn on_event<F>(&self, kind: EventKind, listener: F) -> usize
    where
        F: Fn(&Symbol, &MarketEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.on(kind, listener)
    }

    /// Opens the session of an exchange unless it is open.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange is unknown or the connection fails.
    pub async fn ensure_connected(&self, exchange: &ExchangeId) -> Result<(), FeedError> {
        self.supervisor(exchange)?.ensure_connected().await
    }

    /// Closes the session of an exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange is unknown.
    pub async fn close(&self, exchange: &ExchangeId) -> Result<(), FeedError> {
        self.supervisor(exchange)?.close().await;
        Ok(())
    }

    /// Closes every session.
    pub async fn close_all(&self) {
        for supervisor in self.supervisors.values() {
            supervisor.close().await;
        }
    }

    /// Returns the session state of an exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange is unknown.
    pub fn state(&self, exchange: &ExchangeId) -> Result<ConnectionState, FeedError> {
        Ok(self.supervisor(exchange)?.state())
    }

    /// Returns a copy of the current order book.
    ///
    /// `None` if the book is not subscribed or has no snapshot yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol is malformed or the exchange unknown.
    pub fn order_book(
        &self,
        exchange: &ExchangeId,
        symbol: &str,
        depth: Option<usize>,
    ) -> Result<Option<OrderBookView>, FeedError> {
        let supervisor = self.supervisor(exchange)?;
        let key = BookKey::new(supervisor.exchange().clone(), symbol.parse()?);
        Ok(self.store.clone_book(&key, depth))
    }

    /// Subscribes to side-channel notices.
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.dispatcher.notices()
    }

    /// Returns the metrics of an exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange is unknown.
    pub fn metrics(&self, exchange: &ExchangeId) -> Result<FeedMetricsSnapshot, FeedError> {
        Ok(self.supervisor(exchange)?.metrics().snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeConfig, ProtocolKind};
    use crate::transport::MemoryTransport;

    fn config() -> FeedConfig {
        FeedConfig::new()
            .with_exchange(ExchangeConfig::new("cex", ProtocolKind::Cex))
            .with_exchange(ExchangeConfig::new("hollaex", ProtocolKind::Hollaex))
    }

    #[test]
    fn test_subscribe_options() {
        let options = SubscribeOptions::new().with_timeout_ms(250).with_depth_limit(5);
        assert_eq!(options.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(options.depth_limit, Some(5));
        assert_eq!(SubscribeOptions::default().timeout(), None);
    }

    #[test]
    fn test_new_builds_supervisors() {
        let feed = MarketFeed::new(config(), MemoryTransport::new()).expect("feed");
        let ids: Vec<&str> = feed.exchanges().iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["cex", "hollaex"]);
        assert_eq!(
            feed.state(&"cex".into()).expect("state"),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = config().with_exchange(ExchangeConfig::new("cex", ProtocolKind::Cex));
        assert!(matches!(
            MarketFeed::new(config, MemoryTransport::new()),
            Err(FeedError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_exchange() {
        let feed = MarketFeed::new(config(), MemoryTransport::new()).expect("feed");
        let err = feed
            .subscribe(&"kraken".into(), EventKind::OrderBook, "BTC/EUR", SubscribeOptions::default())
            .await
            .expect_err("unknown");
        assert_eq!(err, FeedError::UnknownExchange("kraken".into()));
        assert!(feed.metrics(&"kraken".into()).is_err());
    }

    #[tokio::test]
    async fn test_malformed_symbol() {
        let transport = MemoryTransport::new();
        let feed = MarketFeed::new(config(), transport.clone()).expect("feed");
        let err = feed
            .subscribe(&"cex".into(), EventKind::OrderBook, "BTCEUR", SubscribeOptions::default())
            .await
            .expect_err("malformed");
        assert!(matches!(err, FeedError::Sdk(_)));
        assert_eq!(transport.open_count(), 0);
    }

    #[test]
    fn test_order_book_absent() {
        let feed = MarketFeed::new(config(), MemoryTransport::new()).expect("feed");
        assert_eq!(feed.order_book(&"cex".into(), "BTC/USD", None).expect("lookup"), None);
    }
}
