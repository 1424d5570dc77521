//! Connection supervision.
//!
//! A [`ConnectionSupervisor`] owns the single push session of one exchange.
//! It drives the session state machine, routes every inbound frame through
//! the exchange's adapter, and is the only writer to the session.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use marketfeed_sdk::{BookUpdate, ExchangeId, Symbol};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{AckMode, BookFraming, Correlation, Frame, HandshakeStep, ProtocolAdapter};
use crate::channel::{ChannelKey, EventKind};
use crate::config::FeedConfig;
use crate::dispatcher::{EventDispatcher, MarketEvent, Notice};
use crate::error::FeedError;
use crate::metrics::FeedMetrics;
use crate::registry::{AckReceiver, RequestKind, SubscriptionRegistry, Ticket};
use crate::store::{BookKey, OrderBookStore};
use crate::transport::{FrameSink, Outbound, Transport, TransportEvent};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Session opening or handshaking.
    Connecting,
    /// Session open.
    Connected,
    /// Session being torn down.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    connect_timeout: Duration,
    handshake_timeout: Duration,
    subscribe_timeout: Duration,
    default_depth: Option<usize>,
}

struct Link {
    state: ConnectionState,
    generation: u64,
    sink: Option<Box<dyn FrameSink>>,
    reader: Option<JoinHandle<()>>,
    handshake: Option<oneshot::Sender<Result<(), FeedError>>>,
}

struct SupervisorInner {
    adapter: Arc<dyn ProtocolAdapter>,
    transport: Arc<dyn Transport>,
    registry: SubscriptionRegistry,
    store: OrderBookStore,
    dispatcher: EventDispatcher,
    metrics: Arc<FeedMetrics>,
    settings: Settings,
    link: Mutex<Link>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Owner of one exchange's push session.
///
/// Cloning yields another handle onto the same session.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("exchange", self.exchange())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionSupervisor {
    /// Creates a supervisor in the `Disconnected` state.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn ProtocolAdapter>,
        transport: Arc<dyn Transport>,
        store: OrderBookStore,
        dispatcher: EventDispatcher,
        config: &FeedConfig,
    ) -> Self {
        let metrics = Arc::new(FeedMetrics::new());
        let registry = SubscriptionRegistry::new(adapter.exchange().clone(), Arc::clone(&metrics));

        Self {
            inner: Arc::new(SupervisorInner {
                adapter,
                transport,
                registry,
                store,
                dispatcher,
                metrics,
                settings: Settings {
                    connect_timeout: config.connect_timeout(),
                    handshake_timeout: config.handshake_timeout(),
                    subscribe_timeout: config.subscribe_timeout(),
                    default_depth: config.default_depth,
                },
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    sink: None,
                    reader: None,
                    handshake: None,
                }),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Returns the exchange identifier.
    #[must_use]
    pub fn exchange(&self) -> &ExchangeId {
        self.inner.adapter.exchange()
    }

    /// Returns the protocol adapter.
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn ProtocolAdapter> {
        &self.inner.adapter
    }

    /// Returns the current session state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    /// Returns the subscription registry.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Returns the session metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<FeedMetrics> {
        &self.inner.metrics
    }

    /// Opens the session unless it is already open.
    ///
    /// On a fresh session every channel still wanted from an earlier one is
    /// resubscribed; failures are reported as notices.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Connection`] if the transport refuses the
    /// session, the handshake is rejected, or either step times out.
    pub async fn ensure_connected(&self) -> Result<(), FeedError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let _guard = self.inner.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.connect().await?;
        self.resubscribe_wanted();
        Ok(())
    }

    async fn connect(&self) -> Result<(), FeedError> {
        let inner = &self.inner;
        let endpoint = inner.adapter.endpoint().to_string();
        let generation = {
            let mut link = inner.link.lock();
            link.state = ConnectionState::Connecting;
            link.generation += 1;
            link.generation
        };

        info!(exchange = %self.exchange(), %endpoint, "Connecting");

        let session = match tokio::time::timeout(
            inner.settings.connect_timeout,
            inner.transport.open(&endpoint),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.mark_disconnected(generation);
                warn!(exchange = %self.exchange(), error = %e, "Connection failed");
                return Err(e);
            }
            Err(_) => {
                self.mark_disconnected(generation);
                let e = FeedError::Connection(format!(
                    "connect timed out after {}ms",
                    inner.settings.connect_timeout.as_millis()
                ));
                warn!(exchange = %self.exchange(), error = %e, "Connection failed");
                return Err(e);
            }
        };

        inner.metrics.record_connection_opened();
        let (ready_tx, ready_rx) = oneshot::channel();
        let requires_handshake = inner.adapter.requires_handshake();
        {
            let mut link = inner.link.lock();
            link.sink = Some(session.sink);
            link.reader = Some(tokio::spawn(read_loop(
                Arc::downgrade(inner),
                generation,
                session.events,
            )));
            if requires_handshake {
                link.handshake = Some(ready_tx);
            } else {
                link.state = ConnectionState::Connected;
            }
        }

        if requires_handshake {
            let outcome = match tokio::time::timeout(inner.settings.handshake_timeout, ready_rx).await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(FeedError::Connection(
                    "session closed during handshake".to_string(),
                )),
                Err(_) => Err(FeedError::Connection(format!(
                    "handshake timed out after {}ms",
                    inner.settings.handshake_timeout.as_millis()
                ))),
            };

            if let Err(e) = outcome {
                warn!(exchange = %self.exchange(), error = %e, "Handshake failed");
                self.teardown(&e);
                return Err(e);
            }
        }

        info!(exchange = %self.exchange(), "Connected");
        Ok(())
    }

    fn mark_disconnected(&self, generation: u64) {
        let mut link = self.inner.link.lock();
        if link.generation == generation {
            link.state = ConnectionState::Disconnected;
        }
    }

    /// Closes the session.
    ///
    /// Pending requests fail with [`FeedError::ConnectionLost`]; wanted
    /// channels stay wanted and are resubscribed by the next
    /// [`ensure_connected`](Self::ensure_connected).
    pub async fn close(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }

        info!(exchange = %self.exchange(), "Closing");
        self.teardown(&FeedError::ConnectionLost("closed by client".to_string()));
    }

    /// Drops the session and everything tied to it.
    fn teardown(&self, error: &FeedError) {
        let inner = &self.inner;
        let (sink, reader, handshake, was_open) = {
            let mut link = inner.link.lock();
            let was_open = link.sink.is_some();
            link.state = ConnectionState::Closing;
            link.generation += 1;
            (
                link.sink.take(),
                link.reader.take(),
                link.handshake.take(),
                was_open,
            )
        };

        if let Some(sink) = sink {
            let _ = sink.send(Outbound::Close);
        }
        if let Some(handshake) = handshake {
            let _ = handshake.send(Err(FeedError::Connection(error.to_string())));
        }
        if let Some(reader) = reader {
            reader.abort();
        }

        let failed = inner.registry.fail_all(error);
        let cleared = inner.store.clear_exchange(self.exchange());
        if was_open {
            inner.metrics.record_connection_closed();
        }

        inner.link.lock().state = ConnectionState::Disconnected;
        debug!(
            exchange = %self.exchange(),
            failed_requests = failed,
            cleared_books = cleared,
            "Session torn down"
        );
    }

    /// Subscribes one caller to a channel.
    ///
    /// Resolves once the server acknowledges, immediately if the channel is
    /// already subscribed, or right after marking the channel wanted for
    /// protocols without acknowledgments.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::UnsupportedEvent`] without touching the wire if
    /// the exchange lacks the event kind, a connection error, the server's
    /// refusal, or [`FeedError::SubscriptionTimeout`].
    pub async fn subscribe(
        &self,
        key: &ChannelKey,
        depth: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<(), FeedError> {
        if !self.inner.adapter.supports(key.kind) {
            return Err(FeedError::UnsupportedEvent {
                exchange: self.exchange().clone(),
                kind: key.kind,
            });
        }

        self.ensure_connected().await?;

        let timeout = timeout.unwrap_or(self.inner.settings.subscribe_timeout);
        let ticket = self
            .inner
            .registry
            .subscribe(key, depth, timeout, self.acknowledged());

        match ticket {
            Ticket::Done => Ok(()),
            Ticket::Joined(ack) => settle(ack).await,
            Ticket::Send { nonce, ack } => {
                if let Err(e) = self.send_request(key, nonce, RequestKind::Subscribe) {
                    self.abandon(key, nonce, ack.is_some(), &e);
                    return Err(e);
                }
                match ack {
                    Some(ack) => settle(ack).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Drops one caller's subscription to a channel.
    ///
    /// The wire unsubscribe is only sent when the last caller leaves.
    ///
    /// # Errors
    ///
    /// Returns the server's refusal or [`FeedError::SubscriptionTimeout`].
    pub async fn unsubscribe(&self, key: &ChannelKey, timeout: Option<Duration>) -> Result<(), FeedError> {
        let timeout = timeout.unwrap_or(self.inner.settings.subscribe_timeout);
        let ticket = self
            .inner
            .registry
            .unsubscribe(key, timeout, self.acknowledged());

        let outcome = match ticket {
            Ticket::Done | Ticket::Joined(_) => Ok(()),
            Ticket::Send { nonce, ack } => {
                match self.send_request(key, nonce, RequestKind::Unsubscribe) {
                    Err(e) => {
                        if ack.is_some() {
                            self.inner.registry.resolve(
                                &Correlation::Nonce(nonce),
                                Some(RequestKind::Unsubscribe),
                                Err(e.clone()),
                            );
                        }
                        Err(e)
                    }
                    Ok(()) => match ack {
                        Some(ack) => settle(ack).await,
                        None => Ok(()),
                    },
                }
            }
        };

        if key.kind == EventKind::OrderBook && !self.inner.registry.is_wanted(key) {
            self.inner
                .store
                .remove(&BookKey::new(self.exchange().clone(), key.symbol.clone()));
        }
        outcome
    }

    fn acknowledged(&self) -> bool {
        self.inner.adapter.ack_mode() != AckMode::None
    }

    /// Releases a request whose frame never reached the wire.
    fn abandon(&self, key: &ChannelKey, nonce: u64, acknowledged: bool, error: &FeedError) {
        if acknowledged {
            self.inner.registry.resolve(
                &Correlation::Nonce(nonce),
                Some(RequestKind::Subscribe),
                Err(error.clone()),
            );
        } else {
            let _ = self
                .inner
                .registry
                .unsubscribe(key, self.inner.settings.subscribe_timeout, false);
        }
    }

    fn send_request(&self, key: &ChannelKey, nonce: u64, kind: RequestKind) -> Result<(), FeedError> {
        let frame = match kind {
            RequestKind::Subscribe => self.inner.adapter.encode_subscribe(key, nonce)?,
            RequestKind::Unsubscribe => self.inner.adapter.encode_unsubscribe(key, nonce)?,
        };
        match frame {
            Some(frame) => {
                debug!(exchange = %self.exchange(), channel = %key, nonce, %kind, "Sending request");
                self.send_text(frame, false)
            }
            None => Ok(()),
        }
    }

    /// Writes a frame to the session.
    ///
    /// Only handshake and keep-alive frames may go out while connecting;
    /// anything sent while closing or disconnected is rejected.
    fn send_text(&self, frame: String, handshaking: bool) -> Result<(), FeedError> {
        let link = self.inner.link.lock();
        let allowed = match link.state {
            ConnectionState::Connected => true,
            ConnectionState::Connecting => handshaking,
            ConnectionState::Closing | ConnectionState::Disconnected => false,
        };
        if !allowed {
            return Err(FeedError::NotConnected);
        }

        let sink = link.sink.as_ref().ok_or(FeedError::NotConnected)?;
        sink.send(Outbound::Text(frame))?;
        self.inner.metrics.record_frame_sent();
        Ok(())
    }

    /// Re-issues subscribes for wanted channels that are off the wire.
    fn resubscribe_wanted(&self) {
        let registry = &self.inner.registry;
        let timeout = self.inner.settings.subscribe_timeout;
        let acknowledged = self.acknowledged();

        for key in registry.resubscribe_targets() {
            let Some(Ticket::Send { nonce, ack }) = registry.resubscribe(&key, timeout, acknowledged)
            else {
                continue;
            };

            info!(exchange = %self.exchange(), channel = %key, nonce, "Resubscribing");
            if let Err(e) = self.send_request(&key, nonce, RequestKind::Subscribe) {
                if ack.is_some() {
                    registry.resolve(&Correlation::Nonce(nonce), None, Err(e.clone()));
                }
                self.resubscribe_failed(key, e);
                continue;
            }

            if let Some(ack) = ack {
                let supervisor = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = settle(ack).await {
                        supervisor.resubscribe_failed(key, e);
                    }
                });
            }
        }
    }

    fn resubscribe_failed(&self, key: ChannelKey, error: FeedError) {
        warn!(exchange = %self.exchange(), channel = %key, error = %error, "Resubscription failed");
        self.inner.dispatcher.notify(Notice::ResubscribeFailed {
            exchange: self.exchange().clone(),
            key,
            error,
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.link.lock().generation == generation
    }

    fn handle_event(&self, generation: u64, event: TransportEvent) {
        if !self.is_current(generation) {
            return;
        }

        match event {
            TransportEvent::Text(raw) => {
                self.inner.metrics.record_frame_received();
                let frame = self.inner.adapter.classify(&raw);
                self.handle_frame(frame);
            }
            TransportEvent::Closed(reason) => {
                self.connection_lost(reason.unwrap_or_else(|| "closed by server".to_string()));
            }
        }
    }

    /// Drops the session after the server ended it or asked for a reconnect.
    /// Wanted channels stay wanted for the next `ensure_connected`.
    fn connection_lost(&self, reason: String) {
        warn!(exchange = %self.exchange(), %reason, "Connection lost");
        self.inner.dispatcher.notify(Notice::ConnectionLost {
            exchange: self.exchange().clone(),
            reason: reason.clone(),
        });
        self.teardown(&FeedError::ConnectionLost(reason));
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Handshake(step) => self.handle_handshake(step),
            Frame::Reply(frame) => {
                if let Err(e) = self.send_text(frame, true) {
                    debug!(exchange = %self.exchange(), error = %e, "Keep-alive reply not sent");
                }
            }
            Frame::SubscribeAck {
                correlation,
                result,
                snapshot,
            } => {
                if let (Ok(()), Some((symbol, book))) = (&result, snapshot) {
                    self.apply_snapshot(symbol, &book);
                }
                self.inner.registry.resolve(
                    &correlation,
                    Some(RequestKind::Subscribe),
                    result.map_err(FeedError::from),
                );
            }
            Frame::UnsubscribeAck {
                correlation,
                result,
            } => {
                self.inner.registry.resolve(
                    &correlation,
                    Some(RequestKind::Unsubscribe),
                    result.map_err(FeedError::from),
                );
            }
            Frame::Snapshot { symbol, book } => self.apply_snapshot(symbol, &book),
            Frame::Delta { symbol, update } => self.apply_delta(symbol, &update),
            Frame::Trades { symbol, trades } => {
                if !self.wanted(&ChannelKey::trades(symbol.clone())) {
                    return;
                }
                for trade in trades {
                    self.emit(&symbol, &MarketEvent::Trade(trade));
                }
            }
            Frame::Error { correlation, error } => {
                let resolved = correlation.and_then(|correlation| {
                    self.inner
                        .registry
                        .resolve(&correlation, None, Err(error.clone().into()))
                });
                if resolved.is_none() {
                    warn!(exchange = %self.exchange(), error = %error, "Exchange error");
                    self.inner.dispatcher.notify(Notice::ExchangeError(error));
                }
            }
            Frame::ReconnectRequested => {
                self.connection_lost("reconnect requested by server".to_string());
            }
            Frame::Unrecognized => {
                self.inner.metrics.record_frame_dropped();
                debug!(exchange = %self.exchange(), "Unrecognized frame dropped");
            }
        }
    }

    fn handle_handshake(&self, step: HandshakeStep) {
        match step {
            HandshakeStep::Send(frame) => {
                if let Err(e) = self.send_text(frame, true) {
                    warn!(exchange = %self.exchange(), error = %e, "Handshake frame not sent");
                }
            }
            HandshakeStep::Ready => {
                let waiter = {
                    let mut link = self.inner.link.lock();
                    if link.state == ConnectionState::Connecting {
                        link.state = ConnectionState::Connected;
                    }
                    link.handshake.take()
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
            }
            HandshakeStep::Rejected(error) => {
                let waiter = self.inner.link.lock().handshake.take();
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Err(FeedError::Connection(error.to_string())));
                    }
                    None => {
                        warn!(exchange = %self.exchange(), error = %error, "Session rejected");
                        self.inner.dispatcher.notify(Notice::ExchangeError(error));
                    }
                }
            }
        }
    }

    /// Returns true if a caller wants the channel; counts the frame as
    /// dropped otherwise.
    fn wanted(&self, key: &ChannelKey) -> bool {
        let wanted = self.inner.registry.is_wanted(key);
        if !wanted {
            self.inner.metrics.record_frame_dropped();
            debug!(exchange = %self.exchange(), channel = %key, "Frame for unwanted channel dropped");
        }
        wanted
    }

    fn book_key(&self, symbol: &Symbol) -> BookKey {
        BookKey::new(self.exchange().clone(), symbol.clone())
    }

    fn apply_snapshot(&self, symbol: Symbol, book: &BookUpdate) {
        if !self.wanted(&ChannelKey::order_book(symbol.clone())) {
            return;
        }
        self.inner.store.apply_snapshot(&self.book_key(&symbol), book);
        self.inner.metrics.record_snapshot();
        self.emit_book(&symbol);
    }

    fn apply_delta(&self, symbol: Symbol, update: &BookUpdate) {
        if !self.wanted(&ChannelKey::order_book(symbol.clone())) {
            return;
        }

        let key = self.book_key(&symbol);
        if self.inner.adapter.book_framing() == BookFraming::FirstIsSnapshot
            && !self.inner.store.is_initialized(&key)
        {
            self.inner.store.apply_snapshot(&key, update);
            self.inner.metrics.record_snapshot();
            self.emit_book(&symbol);
            return;
        }

        match self.inner.store.apply_delta(&key, update) {
            Ok(()) => {
                self.inner.metrics.record_delta();
                self.emit_book(&symbol);
            }
            Err(FeedError::OrderBookNotInitialized(_)) => {
                self.inner.metrics.record_frame_dropped();
                debug!(exchange = %self.exchange(), %symbol, "Delta before snapshot dropped");
            }
            Err(fault) if fault.is_sequence_fault() => self.resync(symbol, fault),
            Err(e) => {
                warn!(exchange = %self.exchange(), %symbol, error = %e, "Delta rejected");
            }
        }
    }

    /// Recovers from a consistency fault: drops the session and every
    /// replica, then reconnects and resubscribes in the background.
    fn resync(&self, symbol: Symbol, fault: FeedError) {
        warn!(exchange = %self.exchange(), %symbol, error = %fault, "Book continuity lost, resynchronizing");
        self.inner.metrics.record_resync();
        self.inner.dispatcher.notify(Notice::ResyncStarted {
            exchange: self.exchange().clone(),
            symbol,
            error: fault.clone(),
        });

        self.teardown(&FeedError::ConnectionLost(format!("resynchronizing after {fault}")));

        let supervisor = self.clone();
        tokio::spawn(async move {
            let _guard = supervisor.inner.connect_lock.lock().await;
            if supervisor.state() != ConnectionState::Connected {
                if let Err(e) = supervisor.connect().await {
                    for key in supervisor.inner.registry.resubscribe_targets() {
                        supervisor.resubscribe_failed(key, e.clone());
                    }
                    return;
                }
            }
            supervisor.resubscribe_wanted();
        });
    }

    fn emit_book(&self, symbol: &Symbol) {
        let channel = ChannelKey::order_book(symbol.clone());
        let depth = self
            .inner
            .registry
            .depth(&channel)
            .or(self.inner.settings.default_depth);

        if let Some(view) = self.inner.store.clone_book(&self.book_key(symbol), depth) {
            self.emit(symbol, &MarketEvent::OrderBook(view));
        }
    }

    fn emit(&self, symbol: &Symbol, event: &MarketEvent) {
        let failures = self.inner.dispatcher.emit(symbol, event);
        if failures > 0 {
            self.inner.metrics.record_listener_failures(failures as u64);
        }
    }
}

async fn settle(ack: AckReceiver) -> Result<(), FeedError> {
    ack.await
        .unwrap_or_else(|_| Err(FeedError::ConnectionLost("request abandoned".to_string())))
}

async fn read_loop(
    inner: Weak<SupervisorInner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let closed = matches!(event, TransportEvent::Closed(_));
        ConnectionSupervisor { inner }.handle_event(generation, event);
        if closed {
            return;
        }
    }

    if let Some(inner) = inner.upgrade() {
        ConnectionSupervisor { inner }.handle_event(generation, TransportEvent::Closed(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter;
    use crate::config::{ExchangeConfig, ProtocolKind};
    use crate::transport::MemoryTransport;
    use marketfeed_sdk::Market;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};

    fn supervisor(config: ExchangeConfig, transport: &MemoryTransport) -> ConnectionSupervisor {
        let adapter = adapter::build(&config).expect("adapter");
        ConnectionSupervisor::new(
            adapter,
            Arc::new(transport.clone()),
            OrderBookStore::new(),
            EventDispatcher::new(16),
            &FeedConfig::new().with_subscribe_timeout_ms(1000),
        )
    }

    fn bitstamp() -> ExchangeConfig {
        ExchangeConfig::new("bitstamp", ProtocolKind::Bitstamp)
            .with_market(Market::new("btceur", "BTC/EUR".parse().expect("symbol")))
    }

    fn bitstamp_acks(frame: &str) -> Vec<String> {
        let msg: Value = serde_json::from_str(frame).expect("json");
        let channel = msg["data"]["channel"].clone();
        let event = match msg["event"].as_str() {
            Some("bts:subscribe") => "bts:subscription_succeeded",
            _ => "bts:unsubscription_succeeded",
        };
        vec![json!({"event": event, "channel": channel, "data": {}}).to_string()]
    }

    fn btc_eur() -> ChannelKey {
        ChannelKey::order_book("BTC/EUR".parse().expect("symbol"))
    }

    #[tokio::test]
    async fn test_connect_without_handshake() {
        let transport = MemoryTransport::new();
        let supervisor = supervisor(bitstamp(), &transport);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);

        supervisor.ensure_connected().await.expect("connect");
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        supervisor.ensure_connected().await.expect("connect");
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.urls(), vec!["wss://ws.bitstamp.net".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_with_handshake() {
        let transport = MemoryTransport::new().with_greeting(r#"{"e":"connected"}"#);
        let supervisor = supervisor(ExchangeConfig::new("cex", ProtocolKind::Cex), &transport);

        supervisor.ensure_connected().await.expect("connect");
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(supervisor.metrics().connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let transport = MemoryTransport::new();
        transport.refuse_connections(Some("handshake refused"));
        let supervisor = supervisor(bitstamp(), &transport);

        let err = supervisor.ensure_connected().await.expect_err("refused");
        assert!(err.is_connection());
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let transport = MemoryTransport::new();
        let supervisor = supervisor(ExchangeConfig::new("cex", ProtocolKind::Cex), &transport);

        let err = supervisor.ensure_connected().await.expect_err("timeout");
        assert!(matches!(err, FeedError::Connection(ref m) if m.contains("handshake timed out")));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let transport = MemoryTransport::new()
            .with_greeting(r#"{"e":"auth","ok":"error","data":{"error":"Invalid signature"}}"#);
        let supervisor = supervisor(ExchangeConfig::new("cex", ProtocolKind::Cex), &transport);

        let err = supervisor.ensure_connected().await.expect_err("rejected");
        assert!(matches!(err, FeedError::Connection(ref m) if m.contains("Invalid signature")));
    }

    #[tokio::test]
    async fn test_keep_alive_reply() {
        let transport = MemoryTransport::new().with_greeting(r#"{"e":"connected"}"#);
        let supervisor = supervisor(ExchangeConfig::new("cex", ProtocolKind::Cex), &transport);
        supervisor.ensure_connected().await.expect("connect");

        assert!(transport.inject(r#"{"e":"ping","time":1}"#));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent(), vec![r#"{"e":"pong"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_send_rejected_when_disconnected() {
        let transport = MemoryTransport::new();
        let supervisor = supervisor(bitstamp(), &transport);
        assert_eq!(
            supervisor.send_text("x".to_string(), false),
            Err(FeedError::NotConnected)
        );
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_and_snapshot() {
        let transport = MemoryTransport::new().with_responder(bitstamp_acks);
        let supervisor = supervisor(bitstamp(), &transport);

        supervisor.subscribe(&btc_eur(), None, None).await.expect("subscribe");
        let sent: Vec<Value> = transport
            .sent()
            .iter()
            .map(|frame| serde_json::from_str(frame).expect("json"))
            .collect();
        assert_eq!(
            sent,
            vec![json!({"event": "bts:subscribe", "data": {"channel": "order_book_btceur"}})]
        );

        assert!(transport.inject(
            json!({
                "event": "data",
                "channel": "order_book_btceur",
                "data": {"bids": [["100.0", "1.0"]], "asks": [["101.0", "2.0"]], "microtimestamp": "1700000000000000"}
            })
            .to_string()
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let store = &supervisor.inner.store;
        let view = store
            .clone_book(&supervisor.book_key(&btc_eur().symbol), None)
            .expect("book");
        assert_eq!(view.best_bid(), Some(dec!(100.0)));
        assert_eq!(view.best_ask(), Some(dec!(101.0)));
        assert_eq!(supervisor.metrics().snapshots_applied(), 1);
    }

    #[tokio::test]
    async fn test_unwanted_frames_dropped() {
        let transport = MemoryTransport::new();
        let supervisor = supervisor(bitstamp(), &transport);
        supervisor.ensure_connected().await.expect("connect");

        transport.inject(
            json!({
                "event": "data",
                "channel": "order_book_btceur",
                "data": {"bids": [], "asks": []}
            })
            .to_string(),
        );
        transport.inject("not json");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(supervisor.inner.store.is_empty());
        assert_eq!(supervisor.metrics().frames_received(), 2);
        assert_eq!(supervisor.metrics().frames_dropped(), 2);
    }

    #[tokio::test]
    async fn test_connection_lost_fails_pending() {
        let transport = MemoryTransport::new();
        let supervisor = supervisor(bitstamp(), &transport);
        let mut notices = supervisor.inner.dispatcher.notices();

        let pending = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.subscribe(&btc_eur(), None, None).await })
        };
        while transport.sent_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(transport.drop_connection("reset by peer"));
        let outcome = pending.await.expect("join");
        assert_eq!(
            outcome,
            Err(FeedError::ConnectionLost("reset by peer".to_string()))
        );
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(matches!(
            notices.recv().await.expect("notice"),
            Notice::ConnectionLost { ref reason, .. } if reason == "reset by peer"
        ));

        // The channel stays wanted and is resubscribed on reconnect.
        transport.set_responder(bitstamp_acks);
        transport.clear_sent();
        supervisor.ensure_connected().await.expect("reconnect");
        assert_eq!(transport.sent_count(), 1);
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let transport = MemoryTransport::new();
        let supervisor = supervisor(bitstamp(), &transport);

        let pending = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.subscribe(&btc_eur(), None, None).await })
        };
        while transport.sent_count() == 0 {
            tokio::task::yield_now().await;
        }

        supervisor.close().await;
        assert!(matches!(
            pending.await.expect("join"),
            Err(FeedError::ConnectionLost(_))
        ));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(transport.close_count(), 1);
        assert_eq!(supervisor.metrics().connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_last_caller_sends_frame() {
        let transport = MemoryTransport::new().with_responder(bitstamp_acks);
        let supervisor = supervisor(bitstamp(), &transport);

        supervisor.subscribe(&btc_eur(), None, None).await.expect("subscribe");
        supervisor.subscribe(&btc_eur(), None, None).await.expect("subscribe");
        assert_eq!(transport.sent_count(), 1);

        supervisor.unsubscribe(&btc_eur(), None).await.expect("unsubscribe");
        assert_eq!(transport.sent_count(), 1);
        supervisor.unsubscribe(&btc_eur(), None).await.expect("unsubscribe");
        assert_eq!(transport.sent_count(), 2);
        assert!(!supervisor.registry().is_wanted(&btc_eur()));
        assert_eq!(supervisor.metrics().unsubscriptions(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_request_drops_session() {
        let transport = MemoryTransport::new().with_responder(bitstamp_acks);
        let supervisor = supervisor(bitstamp(), &transport);
        let mut notices = supervisor.inner.dispatcher.notices();
        supervisor.subscribe(&btc_eur(), None, None).await.expect("subscribe");

        transport.inject(r#"{"event":"bts:request_reconnect","channel":"","data":""}"#);
        assert!(matches!(
            notices.recv().await.expect("notice"),
            Notice::ConnectionLost { ref reason, .. } if reason.contains("reconnect requested")
        ));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(transport.close_count(), 1);
        assert!(supervisor.registry().is_wanted(&btc_eur()));

        transport.clear_sent();
        supervisor.ensure_connected().await.expect("reconnect");
        assert_eq!(transport.open_count(), 2);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_server_error_without_request() {
        let transport = MemoryTransport::new();
        let supervisor = supervisor(bitstamp(), &transport);
        let mut notices = supervisor.inner.dispatcher.notices();
        supervisor.ensure_connected().await.expect("connect");

        transport.inject(r#"{"event":"bts:error","channel":"","data":{"code":null,"message":"Bad subscription string."}}"#);
        assert!(matches!(
            notices.recv().await.expect("notice"),
            Notice::ExchangeError(_)
        ));
    }
}
