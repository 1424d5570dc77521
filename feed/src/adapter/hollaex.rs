//! Broadcast protocol filtered client-side.
//!
//! Socket.io over a websocket, namespace `/realtime`. The server pushes
//! every market; nothing is acknowledged and book frames carry no sequence,
//! so gaps cannot be detected.

use std::sync::Arc;

use marketfeed_sdk::types::millis_from_rfc3339;
use marketfeed_sdk::{
    decimal_from_json, BookUpdate, Case, ExchangeId, MarketDirectory, PriceLevel, SdkError, Side,
    Symbol, SymbolCodec, Trade, WireStyle,
};
use serde_json::Value;
use tracing::debug;

use super::{text_field, AckMode, BookFraming, Frame, HandshakeStep, ProtocolAdapter};
use crate::channel::{ChannelKey, EventKind};
use crate::config::ExchangeConfig;
use crate::error::{ErrorTable, ExchangeErrorKind, FeedError};

const EVENTS: &[EventKind] = &[EventKind::OrderBook, EventKind::Trade];

const NAMESPACE: &str = "/realtime";

const ERRORS: ErrorTable = ErrorTable {
    exact: &[
        ("Order not found", ExchangeErrorKind::NotFound),
        ("400", ExchangeErrorKind::BadRequest),
        ("403", ExchangeErrorKind::Authentication),
        ("404", ExchangeErrorKind::BadRequest),
        ("405", ExchangeErrorKind::BadRequest),
        ("410", ExchangeErrorKind::BadRequest),
        ("429", ExchangeErrorKind::RateLimit),
        ("500", ExchangeErrorKind::Server),
        ("503", ExchangeErrorKind::Server),
    ],
    broad: &[("Invalid token", ExchangeErrorKind::Authentication)],
};

/// Adapter for the hollaex protocol.
#[derive(Debug)]
pub struct HollaexAdapter {
    exchange: ExchangeId,
    endpoint: String,
    codec: SymbolCodec,
}

impl HollaexAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new(config: &ExchangeConfig, directory: Arc<MarketDirectory>) -> Self {
        Self {
            exchange: config.id.clone(),
            endpoint: config.endpoint().to_string(),
            codec: SymbolCodec::new(WireStyle::Delimited {
                separator: '-',
                case: Case::Lower,
            })
            .with_directory(directory),
        }
    }

    /// Returns the market identifier a payload refers to.
    fn market_id(payload: &Value) -> Option<String> {
        text_field(payload, "symbol").or_else(|| {
            payload
                .as_object()?
                .keys()
                .find(|key| key.contains('-'))
                .cloned()
        })
    }

    fn symbol(&self, market: &str) -> Result<Symbol, SdkError> {
        self.codec
            .decode(market)
            .ok_or_else(|| SdkError::InvalidSymbol(market.to_string()))
    }

    fn parse_book(&self, payload: &Value) -> Result<Frame, SdkError> {
        let market = Self::market_id(payload)
            .ok_or_else(|| SdkError::Deserialization("orderbook without market".into()))?;
        let symbol = self.symbol(&market)?;
        let book = payload.get(&market).unwrap_or(&Value::Null);

        let mut update = BookUpdate::new(
            PriceLevel::list_from_json(book.get("bids"))?,
            PriceLevel::list_from_json(book.get("asks"))?,
        );
        let timestamp = text_field(book, "timestamp").or_else(|| text_field(payload, "timestamp"));
        if let Some(timestamp) = timestamp {
            update = update.with_timestamp(millis_from_rfc3339(&timestamp)?);
        }

        if text_field(payload, "action").as_deref() == Some("partial") {
            Ok(Frame::Snapshot {
                symbol,
                book: update,
            })
        } else {
            Ok(Frame::Delta { symbol, update })
        }
    }

    fn parse_trade(&self, symbol: &Symbol, data: &Value) -> Result<Trade, SdkError> {
        let side: Side = text_field(data, "side")
            .ok_or_else(|| SdkError::InvalidSide("missing".into()))?
            .parse()?;
        let price = data
            .get("price")
            .map(decimal_from_json)
            .transpose()?
            .ok_or_else(|| SdkError::InvalidPrice("missing".into()))?;
        let amount = data
            .get("size")
            .map(decimal_from_json)
            .transpose()?
            .ok_or_else(|| SdkError::InvalidSize("missing".into()))?;
        let timestamp = match text_field(data, "timestamp") {
            Some(timestamp) => millis_from_rfc3339(&timestamp)?,
            None => chrono::Utc::now().timestamp_millis(),
        };

        Ok(Trade {
            exchange: self.exchange.clone(),
            symbol: symbol.clone(),
            id: text_field(data, "id"),
            side,
            price,
            amount,
            timestamp,
        })
    }

    fn parse_trades(&self, payload: &Value) -> Result<Frame, SdkError> {
        let market = Self::market_id(payload)
            .ok_or_else(|| SdkError::Deserialization("trades without market".into()))?;
        let symbol = self.symbol(&market)?;
        let trades = match payload.get(&market) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| self.parse_trade(&symbol, item))
                .collect::<Result<Vec<_>, _>>()?,
            Some(item @ Value::Object(_)) => vec![self.parse_trade(&symbol, item)?],
            _ => Vec::new(),
        };
        Ok(Frame::Trades { symbol, trades })
    }

    fn event(&self, body: &str) -> Result<Frame, SdkError> {
        let packet: Value =
            serde_json::from_str(body).map_err(|e| SdkError::Deserialization(e.to_string()))?;
        let (name, payload) = match packet.as_array().map(Vec::as_slice) {
            Some([Value::String(name), payload, ..]) => (name.as_str(), payload),
            _ => return Ok(Frame::Unrecognized),
        };

        match name {
            "orderbook" => self.parse_book(payload),
            "trades" => self.parse_trades(payload),
            "error" => {
                let message = text_field(payload, "message").unwrap_or_else(|| payload.to_string());
                let code = text_field(payload, "code");
                Ok(Frame::Error {
                    correlation: None,
                    error: ERRORS.translate(&self.exchange, code.as_deref(), &message),
                })
            }
            _ => Ok(Frame::Unrecognized),
        }
    }

    fn try_classify(&self, raw: &str) -> Result<Frame, SdkError> {
        if raw == "2" {
            return Ok(Frame::Reply("3".to_string()));
        }
        if raw.starts_with('0') {
            return Ok(Frame::Handshake(HandshakeStep::Send(format!("40{NAMESPACE},"))));
        }

        let Some(rest) = raw.get(1..).filter(|_| raw.starts_with('4')) else {
            return Ok(Frame::Unrecognized);
        };
        let Some((kind, body)) = rest.split_at_checked(1) else {
            return Ok(Frame::Unrecognized);
        };
        let Some(body) = body
            .strip_prefix(NAMESPACE)
            .map(|b| b.strip_prefix(',').unwrap_or(b))
        else {
            return Ok(Frame::Unrecognized);
        };

        match kind {
            "0" => Ok(Frame::Handshake(HandshakeStep::Ready)),
            "4" => {
                let message = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| text_field(&v, "message"))
                    .unwrap_or_else(|| "connection refused".to_string());
                let mut error = ERRORS.translate(&self.exchange, None, &message);
                if error.kind == ExchangeErrorKind::Generic {
                    error.kind = ExchangeErrorKind::Authentication;
                }
                Ok(Frame::Handshake(HandshakeStep::Rejected(error)))
            }
            "1" => Ok(Frame::Error {
                correlation: None,
                error: ERRORS.translate(&self.exchange, None, "namespace disconnected"),
            }),
            "2" => self.event(body),
            _ => Ok(Frame::Unrecognized),
        }
    }
}

impl ProtocolAdapter for HollaexAdapter {
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
        AckMode::None
    }

    fn book_framing(&self) -> BookFraming {
        BookFraming::FirstIsSnapshot
    }

    fn requires_handshake(&self) -> bool {
        true
    }

    fn codec(&self) -> &SymbolCodec {
        &self.codec
    }

    fn classify(&self, raw: &str) -> Frame {
        self.try_classify(raw).unwrap_or_else(|e| {
            debug!(exchange = %self.exchange, error = %e, "Malformed frame");
            Frame::Unrecognized
        })
    }

    fn encode_subscribe(&self, key: &ChannelKey, _nonce: u64) -> Result<Option<String>, FeedError> {
        if !self.supports(key.kind) {
            return Err(FeedError::UnsupportedEvent {
                exchange: self.exchange.clone(),
                kind: key.kind,
            });
        }
        Ok(None)
    }

    fn encode_unsubscribe(
        &self,
        key: &ChannelKey,
        nonce: u64,
    ) -> Result<Option<String>, FeedError> {
        self.encode_subscribe(key, nonce)
    }
}
