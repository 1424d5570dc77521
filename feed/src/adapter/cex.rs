//! Nonce-acknowledged protocol with sequenced order book updates.
//!
//! Frames are JSON objects keyed by `e`. Requests carry an `oid` that the
//! server echoes in its reply; the subscribe reply carries the initial book
//! and every later `md_update` must carry `id == previous + 1`.

use std::sync::Arc;

use marketfeed_sdk::{
    BookUpdate, Case, ExchangeId, MarketDirectory, PriceLevel, SdkError, Symbol, SymbolCodec,
    WireStyle,
};
use ring::hmac;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    text_field, u64_field, AckMode, BookFraming, Correlation, Frame, HandshakeStep, ProtocolAdapter,
};
use crate::channel::{ChannelKey, EventKind};
use crate::config::{Credentials, ExchangeConfig};
use crate::error::{ErrorTable, ExchangeError, ExchangeErrorKind, FeedError};

const EVENTS: &[EventKind] = &[EventKind::OrderBook];

const ERRORS: ErrorTable = ErrorTable {
    exact: &[
        ("Invalid signature", ExchangeErrorKind::Authentication),
        ("Timestamp is not in 20sec range", ExchangeErrorKind::Authentication),
        ("Rate limit exceeded", ExchangeErrorKind::RateLimit),
        ("Invalid pair", ExchangeErrorKind::NotFound),
        ("Order not found", ExchangeErrorKind::NotFound),
    ],
    broad: &[
        ("Permission denied", ExchangeErrorKind::Authentication),
        ("API key", ExchangeErrorKind::Authentication),
        ("is not supported", ExchangeErrorKind::NotFound),
        ("Internal error", ExchangeErrorKind::Server),
    ],
};

/// Signs `payload` with HMAC-SHA256 and returns lowercase hex.
#[must_use]
pub fn sign(secret: &str, payload: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let signature = hmac::sign(&key, payload.as_bytes());
    hex::encode(signature.as_ref())
}

/// Adapter for the cex protocol.
#[derive(Debug)]
pub struct CexAdapter {
    exchange: ExchangeId,
    endpoint: String,
    codec: SymbolCodec,
    credentials: Option<Credentials>,
}

impl CexAdapter {
    /// Creates the adapter.
    #[must_use]
    pub fn new(config: &ExchangeConfig, directory: Arc<MarketDirectory>) -> Self {
        Self {
            exchange: config.id.clone(),
            endpoint: config.endpoint().to_string(),
            codec: SymbolCodec::new(WireStyle::Delimited {
                separator: ':',
                case: Case::Upper,
            })
            .with_directory(directory),
            credentials: config.credentials.clone(),
        }
    }

    /// Builds the `auth` frame for a timestamp in seconds.
    #[must_use]
    pub fn auth_payload(credentials: &Credentials, timestamp: i64) -> String {
        let timestamp = timestamp.to_string();
        let signature = sign(
            &credentials.secret,
            &format!("{timestamp}{}", credentials.api_key),
        );
        json!({
            "e": "auth",
            "auth": {
                "key": credentials.api_key,
                "signature": signature,
                "timestamp": timestamp,
            },
        })
        .to_string()
    }

    fn pair(&self, symbol: &Symbol) -> Result<Value, FeedError> {
        let wire = self.codec.encode(symbol);
        match wire.split_once(':') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {
                Ok(json!([base, quote]))
            }
            _ => Err(FeedError::Protocol(format!(
                "market id {wire:?} for {symbol} is not BASE:QUOTE"
            ))),
        }
    }

    fn decode_pair(&self, data: &Value) -> Result<Symbol, SdkError> {
        let pair = match data.get("pair") {
            Some(Value::String(pair)) => pair.clone(),
            Some(Value::Array(legs)) => legs
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(":"),
            _ => String::new(),
        };
        self.codec
            .decode(&pair)
            .ok_or(SdkError::InvalidSymbol(pair))
    }

    fn parse_book(&self, data: &Value, timestamp: Option<i64>) -> Result<(Symbol, BookUpdate), SdkError> {
        let symbol = self.decode_pair(data)?;
        let mut book = BookUpdate::new(
            PriceLevel::list_from_json(data.get("bids"))?,
            PriceLevel::list_from_json(data.get("asks"))?,
        );
        if let Some(id) = u64_field(data, "id") {
            book = book.with_sequence(id);
        }
        if let Some(timestamp) = timestamp {
            book = book.with_timestamp(timestamp);
        }
        Ok((symbol, book))
    }

    fn error(&self, data: &Value, fallback: &str) -> ExchangeError {
        let message = text_field(data, "error").unwrap_or_else(|| fallback.to_string());
        ERRORS.translate(&self.exchange, None, &message)
    }

    fn handshake(&self, msg: &Value) -> Frame {
        match msg.get("e").and_then(Value::as_str) {
            Some("connected") => match &self.credentials {
                Some(credentials) => Frame::Handshake(HandshakeStep::Send(Self::auth_payload(
                    credentials,
                    chrono::Utc::now().timestamp(),
                ))),
                None => Frame::Handshake(HandshakeStep::Ready),
            },
            _ if is_ok(msg) => Frame::Handshake(HandshakeStep::Ready),
            _ => {
                let mut error = self.error(msg.get("data").unwrap_or(&Value::Null), "auth error");
                error.kind = ExchangeErrorKind::Authentication;
                Frame::Handshake(HandshakeStep::Rejected(error))
            }
        }
    }

    fn try_classify(&self, msg: &Value) -> Result<Frame, SdkError> {
        let event = msg.get("e").and_then(Value::as_str).unwrap_or_default();
        let data = msg.get("data").unwrap_or(&Value::Null);
        let correlation = text_field(msg, "oid")
            .and_then(|oid| oid.parse().ok())
            .map(Correlation::Nonce);

        let frame = match event {
            "connected" | "auth" => self.handshake(msg),
            "ping" => Frame::Reply(json!({"e": "pong"}).to_string()),
            "order-book-subscribe" => {
                let Some(correlation) = correlation else {
                    return Ok(Frame::Unrecognized);
                };
                if is_ok(msg) {
                    let timestamp = u64_field(data, "timestamp")
                        .and_then(|secs| i64::try_from(secs).ok())
                        .map(|secs| secs.saturating_mul(1000));
                    Frame::SubscribeAck {
                        correlation,
                        result: Ok(()),
                        snapshot: Some(self.parse_book(data, timestamp)?),
                    }
                } else {
                    Frame::SubscribeAck {
                        correlation,
                        result: Err(self.error(data, "orderbook error")),
                        snapshot: None,
                    }
                }
            }
            "order-book-unsubscribe" => {
                let Some(correlation) = correlation else {
                    return Ok(Frame::Unrecognized);
                };
                let result = if is_ok(msg) {
                    Ok(())
                } else {
                    Err(self.error(data, "orderbook error"))
                };
                Frame::UnsubscribeAck {
                    correlation,
                    result,
                }
            }
            "md_update" => {
                let timestamp = u64_field(data, "time").and_then(|ms| i64::try_from(ms).ok());
                let (symbol, update) = self.parse_book(data, timestamp)?;
                if update.sequence.is_none() {
                    return Err(SdkError::Deserialization("md_update without id".into()));
                }
                Frame::Delta { symbol, update }
            }
            _ if msg.get("ok").and_then(Value::as_str) == Some("error") => Frame::Error {
                correlation,
                error: self.error(data, "exchange error"),
            },
            _ => Frame::Unrecognized,
        };
        Ok(frame)
    }
}

fn is_ok(msg: &Value) -> bool {
    msg.get("ok").and_then(Value::as_str) == Some("ok")
}

impl ProtocolAdapter for CexAdapter {
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
        AckMode::Nonce
    }

    fn book_framing(&self) -> BookFraming {
        BookFraming::Explicit
    }

    fn requires_handshake(&self) -> bool {
        true
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

    fn encode_subscribe(&self, key: &ChannelKey, nonce: u64) -> Result<Option<String>, FeedError> {
        if key.kind != EventKind::OrderBook {
            return Err(FeedError::UnsupportedEvent {
                exchange: self.exchange.clone(),
                kind: key.kind,
            });
        }
        Ok(Some(
            json!({
                "e": "order-book-subscribe",
                "data": {
                    "pair": self.pair(&key.symbol)?,
                    "subscribe": true,
                    "depth": 0,
                },
                "oid": nonce.to_string(),
            })
            .to_string(),
        ))
    }

    fn encode_unsubscribe(
        &self,
        key: &ChannelKey,
        nonce: u64,
    ) -> Result<Option<String>, FeedError> {
        if key.kind != EventKind::OrderBook {
            return Err(FeedError::UnsupportedEvent {
                exchange: self.exchange.clone(),
                kind: key.kind,
            });
        }
        Ok(Some(
            json!({
                "e": "order-book-unsubscribe",
                "data": {
                    "pair": self.pair(&key.symbol)?,
                },
                "oid": nonce.to_string(),
            })
            .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolKind;
    use marketfeed_sdk::Market;
    use rust_decimal_macros::dec;

    fn adapter() -> CexAdapter {
        CexAdapter::new(
            &ExchangeConfig::new("cex", ProtocolKind::Cex),
            Arc::new(MarketDirectory::new()),
        )
    }

    fn btc_usd() -> Symbol {
        "BTC/USD".parse().expect("symbol")
    }

    #[test]
    fn test_sign_known_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let payload = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign(secret, payload),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_auth_payload() {
        let credentials = Credentials::new("key", "secret");
        let payload: Value =
            serde_json::from_str(&CexAdapter::auth_payload(&credentials, 1_551_914_592))
                .expect("json");
        assert_eq!(payload["e"], "auth");
        assert_eq!(payload["auth"]["key"], "key");
        assert_eq!(payload["auth"]["timestamp"], "1551914592");
        assert_eq!(
            payload["auth"]["signature"],
            sign("secret", "1551914592key").as_str()
        );
    }

    #[test]
    fn test_handshake_without_credentials() {
        assert_eq!(
            adapter().classify(r#"{"e":"connected"}"#),
            Frame::Handshake(HandshakeStep::Ready)
        );
    }

    #[test]
    fn test_handshake_with_credentials() {
        let adapter = CexAdapter::new(
            &ExchangeConfig::new("cex", ProtocolKind::Cex)
                .with_credentials(Credentials::new("key", "secret")),
            Arc::new(MarketDirectory::new()),
        );

        match adapter.classify(r#"{"e":"connected"}"#) {
            Frame::Handshake(HandshakeStep::Send(frame)) => assert!(frame.contains("\"auth\"")),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(
            adapter.classify(r#"{"e":"auth","ok":"ok","data":{"ok":"ok"}}"#),
            Frame::Handshake(HandshakeStep::Ready)
        );
        match adapter.classify(r#"{"e":"auth","ok":"error","data":{"error":"Invalid signature"}}"#) {
            Frame::Handshake(HandshakeStep::Rejected(error)) => {
                assert_eq!(error.kind, ExchangeErrorKind::Authentication);
                assert_eq!(error.message, "Invalid signature");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_ping_reply() {
        assert_eq!(
            adapter().classify(r#"{"e":"ping","time":1}"#),
            Frame::Reply(r#"{"e":"pong"}"#.to_string())
        );
    }

    #[test]
    fn test_encode_subscribe() {
        let frame = adapter()
            .encode_subscribe(&ChannelKey::order_book(btc_usd()), 7)
            .expect("encode")
            .expect("frame");
        let frame: Value = serde_json::from_str(&frame).expect("json");

        assert_eq!(frame["e"], "order-book-subscribe");
        assert_eq!(frame["data"]["pair"], json!(["BTC", "USD"]));
        assert_eq!(frame["data"]["subscribe"], true);
        assert_eq!(frame["oid"], "7");
    }

    #[test]
    fn test_encode_rejects_unpaired_market_id() {
        let config = ExchangeConfig::new("cex", ProtocolKind::Cex)
            .with_market(Market::new("BTCUSD", btc_usd()));
        let directory = Arc::new(MarketDirectory::from_markets(config.markets.clone()));
        let adapter = CexAdapter::new(&config, directory);

        let result = adapter.encode_subscribe(&ChannelKey::order_book(btc_usd()), 1);
        assert!(matches!(result, Err(FeedError::Protocol(_))));
        let result = adapter.encode_unsubscribe(&ChannelKey::order_book(btc_usd()), 2);
        assert!(matches!(result, Err(FeedError::Protocol(_))));
    }

    #[test]
    fn test_encode_unsupported() {
        let result = adapter().encode_subscribe(&ChannelKey::trades(btc_usd()), 1);
        assert!(matches!(result, Err(FeedError::UnsupportedEvent { .. })));
    }

    #[test]
    fn test_classify_subscribe_ack() {
        let raw = r#"{"e":"order-book-subscribe","oid":"7","ok":"ok","data":{
            "timestamp":1551914592,"pair":"BTC:USD","id":5,
            "bids":[[3900.5,0.2],[3900,1]],"asks":[[3901,0.5]]}}"#;

        match adapter().classify(raw) {
            Frame::SubscribeAck {
                correlation,
                result,
                snapshot: Some((symbol, book)),
            } => {
                assert_eq!(correlation, Correlation::Nonce(7));
                assert!(result.is_ok());
                assert_eq!(symbol, btc_usd());
                assert_eq!(book.sequence, Some(5));
                assert_eq!(book.timestamp, Some(1_551_914_592_000));
                assert_eq!(book.bids[0], PriceLevel::new(dec!(3900.5), dec!(0.2)));
                assert_eq!(book.asks.len(), 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_classify_subscribe_refused() {
        let raw = r#"{"e":"order-book-subscribe","oid":"8","ok":"error","data":{"error":"Invalid pair"}}"#;
        match adapter().classify(raw) {
            Frame::SubscribeAck {
                correlation,
                result: Err(error),
                snapshot: None,
            } => {
                assert_eq!(correlation, Correlation::Nonce(8));
                assert_eq!(error.kind, ExchangeErrorKind::NotFound);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_classify_unsubscribe_ack() {
        let raw = r#"{"e":"order-book-unsubscribe","oid":"9","ok":"ok","data":{"pair":"BTC:USD"}}"#;
        assert_eq!(
            adapter().classify(raw),
            Frame::UnsubscribeAck {
                correlation: Correlation::Nonce(9),
                result: Ok(())
            }
        );
    }

    #[test]
    fn test_classify_md_update() {
        let raw = r#"{"e":"md_update","data":{"id":6,"pair":"BTC:USD","time":1551914593000,
            "bids":[[3900.5,0]],"asks":[]}}"#;
        match adapter().classify(raw) {
            Frame::Delta { symbol, update } => {
                assert_eq!(symbol, btc_usd());
                assert_eq!(update.sequence, Some(6));
                assert_eq!(update.timestamp, Some(1_551_914_593_000));
                assert!(update.bids[0].is_removal());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_frame() {
        let raw = r#"{"e":"get-balance","oid":"3","ok":"error","data":{"error":"Rate limit exceeded"}}"#;
        match adapter().classify(raw) {
            Frame::Error {
                correlation: Some(Correlation::Nonce(3)),
                error,
            } => assert_eq!(error.kind, ExchangeErrorKind::RateLimit),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_classify_unrecognized() {
        let adapter = adapter();
        assert_eq!(adapter.classify("not json"), Frame::Unrecognized);
        assert_eq!(adapter.classify(r#"{"e":"tick","data":{}}"#), Frame::Unrecognized);
        assert_eq!(
            adapter.classify(r#"{"e":"md_update","data":{"pair":"BTC:USD","bids":[["x",1]]}}"#),
            Frame::Unrecognized
        );
        assert_eq!(
            adapter.classify(r#"{"e":"md_update","data":{"pair":"BTC:USD","bids":[[3900.5,0]]}}"#),
            Frame::Unrecognized
        );
        assert_eq!(
            adapter.classify(r#"{"e":"md_update","data":{"id":"x","pair":"BTC:USD","bids":[]}}"#),
            Frame::Unrecognized
        );
        assert_eq!(
            adapter.classify(r#"{"e":"order-book-subscribe","ok":"ok","data":{}}"#),
            Frame::Unrecognized
        );
    }
}
