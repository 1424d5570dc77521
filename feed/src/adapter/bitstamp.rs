//! Channel-acknowledged protocol with full order book pushes.
//!
//! Subscriptions are addressed by channel name (`order_book_btceur`,
//! `live_trades_btceur`) and acknowledged by echoing that name. Every order
//! book message replaces the whole book.

use std::collections::HashMap;
use std::sync::Arc;

use marketfeed_sdk::{
    decimal_from_json, BookUpdate, Case, ExchangeId, MarketDirectory, PriceLevel, SdkError, Side,
    Symbol, SymbolCodec, Trade, WireStyle,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use super::{text_field, u64_field, AckMode, BookFraming, Correlation, Frame, ProtocolAdapter};
use crate::channel::{ChannelKey, EventKind};
use crate::config::ExchangeConfig;
use crate::error::{ErrorTable, ExchangeErrorKind, FeedError};

const EVENTS: &[EventKind] = &[EventKind::OrderBook, EventKind::Trade];

const ORDER_BOOK_PREFIX: &str = "order_book_";
const TRADES_PREFIX: &str = "live_trades_";

const ERRORS: ErrorTable = ErrorTable {
    exact: &[
        ("Order not found", ExchangeErrorKind::NotFound),
        ("Incorrect JSON format.", ExchangeErrorKind::BadRequest),
        ("Bad subscription string.", ExchangeErrorKind::BadRequest),
    ],
    broad: &[
        ("Invalid nonce", ExchangeErrorKind::Authentication),
        ("API key", ExchangeErrorKind::Authentication),
        ("Rate limit", ExchangeErrorKind::RateLimit),
        ("not found", ExchangeErrorKind::NotFound),
        ("Ensure this value has at least", ExchangeErrorKind::BadRequest),
    ],
};

/// Adapter for the bitstamp protocol.
#[derive(Debug)]
pub struct BitstampAdapter {
    exchange: ExchangeId,
    endpoint: String,
    codec: SymbolCodec,
    /// Channel names sent on the wire, for markets the directory lacks.
    encoded: Mutex<HashMap<String, ChannelKey>>,
}

impl BitstampAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new(config: &ExchangeConfig, directory: Arc<MarketDirectory>) -> Self {
        Self {
            exchange: config.id.clone(),
            endpoint: config.endpoint().to_string(),
            codec: SymbolCodec::new(WireStyle::Concatenated { case: Case::Lower })
                .with_directory(directory),
            encoded: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel name for a key.
    #[must_use]
    pub fn channel_name(&self, key: &ChannelKey) -> String {
        let prefix = match key.kind {
            EventKind::OrderBook => ORDER_BOOK_PREFIX,
            EventKind::Trade => TRADES_PREFIX,
        };
        format!("{prefix}{}", self.codec.encode(&key.symbol))
    }

    /// Resolves a channel name to its key.
    ///
    /// Names are decoded through the market directory first, then matched
    /// against the names this adapter has encoded for requests.
    #[must_use]
    pub fn channel_key(&self, channel: &str) -> Option<ChannelKey> {
        let (kind, market) = if let Some(market) = channel.strip_prefix(ORDER_BOOK_PREFIX) {
            (EventKind::OrderBook, market)
        } else {
            (EventKind::Trade, channel.strip_prefix(TRADES_PREFIX)?)
        };
        match self.codec.decode(market) {
            Some(symbol) => Some(ChannelKey::new(kind, symbol)),
            None => self.encoded.lock().get(channel).cloned(),
        }
    }

    fn request(&self, event: &str, key: &ChannelKey) -> String {
        let channel = self.channel_name(key);
        self.encoded
            .lock()
            .entry(channel.clone())
            .or_insert_with(|| key.clone());
        json!({
            "event": event,
            "data": {"channel": channel},
        })
        .to_string()
    }

    fn parse_book(data: &Value) -> Result<BookUpdate, SdkError> {
        let book = BookUpdate::new(
            PriceLevel::list_from_json(data.get("bids"))?,
            PriceLevel::list_from_json(data.get("asks"))?,
        );
        Ok(match timestamp_millis(data) {
            Some(timestamp) => book.with_timestamp(timestamp),
            None => book,
        })
    }

    fn parse_trade(&self, symbol: Symbol, data: &Value) -> Result<Trade, SdkError> {
        let side = match u64_field(data, "type") {
            Some(0) => Side::Buy,
            Some(1) => Side::Sell,
            other => return Err(SdkError::InvalidSide(format!("{other:?}"))),
        };
        let price = data
            .get("price_str")
            .or_else(|| data.get("price"))
            .map(decimal_from_json)
            .transpose()?
            .ok_or_else(|| SdkError::InvalidPrice("missing".into()))?;
        let amount = data
            .get("amount_str")
            .or_else(|| data.get("amount"))
            .map(decimal_from_json)
            .transpose()?
            .ok_or_else(|| SdkError::InvalidSize("missing".into()))?;

        Ok(Trade {
            exchange: self.exchange.clone(),
            symbol,
            id: text_field(data, "id"),
            side,
            price,
            amount,
            timestamp: timestamp_millis(data)
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        })
    }

    fn try_classify(&self, msg: &Value) -> Result<Frame, SdkError> {
        let event = msg.get("event").and_then(Value::as_str).unwrap_or_default();
        let key = msg
            .get("channel")
            .and_then(Value::as_str)
            .and_then(|channel| self.channel_key(channel));
        let data = msg.get("data").unwrap_or(&Value::Null);

        let frame = match (event, key) {
            ("bts:subscription_succeeded", Some(key)) => Frame::SubscribeAck {
                correlation: Correlation::Channel(key),
                result: Ok(()),
                snapshot: None,
            },
            ("bts:unsubscription_succeeded", Some(key)) => Frame::UnsubscribeAck {
                correlation: Correlation::Channel(key),
                result: Ok(()),
            },
            ("data", Some(key)) if key.kind == EventKind::OrderBook => Frame::Snapshot {
                book: Self::parse_book(data)?,
                symbol: key.symbol,
            },
            ("trade", Some(key)) if key.kind == EventKind::Trade => Frame::Trades {
                trades: vec![self.parse_trade(key.symbol.clone(), data)?],
                symbol: key.symbol,
            },
            ("bts:error", key) => {
                let message =
                    text_field(data, "message").unwrap_or_else(|| "bitstamp error".to_string());
                let code = text_field(data, "code");
                Frame::Error {
                    correlation: key.map(Correlation::Channel),
                    error: ERRORS.translate(&self.exchange, code.as_deref(), &message),
                }
            }
            ("bts:request_reconnect", _) => Frame::ReconnectRequested,
            _ => Frame::Unrecognized,
        };
        Ok(frame)
    }
}

fn timestamp_millis(data: &Value) -> Option<i64> {
    if let Some(micros) = u64_field(data, "microtimestamp") {
        return i64::try_from(micros / 1000).ok();
    }
    u64_field(data, "timestamp")
        .and_then(|secs| i64::try_from(secs).ok())
        .map(|secs| secs.saturating_mul(1000))
}

impl ProtocolAdapter for BitstampAdapter {
    fn exchange(&self) -> &ExchangeId {
        &self.exchange
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn supported_events(&self) -> &[EventKind] {
        EVENTS
    }

    fn ack_mode(&self) -> AckMode {
        AckMode::Channel
    }

    fn book_framing(&self) -> BookFraming {
        BookFraming::Explicit
    }

    fn requires_handshake(&self) -> bool {
        false
    }

    fn codec(&self) -> &SymbolCodec {
        &self.codec
    }

    fn classify(&self, raw: &str) -> Frame {
        let msg: Value = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(exchange = %self.exchange, error = %e, "Non-JSON frame");
                return Frame::Unrecognized;
            }
        };

        self.try_classify(&msg).unwrap_or_else(|e| {
            debug!(exchange = %self.exchange, error = %e, "Malformed frame");
            Frame::Unrecognized
        })
    }

    fn encode_subscribe(&self, key: &ChannelKey, _nonce: u64) -> Result<Option<String>, FeedError> {
        Ok(Some(self.request("bts:subscribe", key)))
    }

    fn encode_unsubscribe(
        &self,
        key: &ChannelKey,
        _nonce: u64,
    ) -> Result<Option<String>, FeedError> {
        Ok(Some(self.request("bts:unsubscribe", key)))
    }
}
