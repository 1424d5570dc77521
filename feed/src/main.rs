//! Marketfeed watcher binary.
//!
//! Subscribes to the channels listed in `MARKETFEED_SUBSCRIBE` and logs every
//! order book and trade event until interrupted.

use std::env;

use anyhow::{bail, Context};
use marketfeed_feed::{
    EventKind, ExchangeConfig, FeedConfig, MarketEvent, MarketFeed, ProtocolKind,
    SubscribeOptions, WsTransport,
};
use marketfeed_sdk::ExchangeId;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parses `exchange:kind:BASE/QUOTE`.
fn parse_subscription(entry: &str) -> anyhow::Result<(ExchangeId, EventKind, String)> {
    let mut parts = entry.trim().splitn(3, ':');
    let (Some(exchange), Some(kind), Some(symbol)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("expected exchange:kind:BASE/QUOTE, got {entry:?}");
    };
    let kind = kind.parse::<EventKind>().map_err(anyhow::Error::msg)?;
    Ok((ExchangeId::new(exchange), kind, symbol.to_string()))
}

fn load_config() -> anyhow::Result<FeedConfig> {
    match env::var("MARKETFEED_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config from {path}"))?;
            Ok(FeedConfig::from_json(&json)?)
        }
        Err(_) => Ok(FeedConfig::new()
            .with_exchange(ExchangeConfig::new("cex", ProtocolKind::Cex))
            .with_exchange(ExchangeConfig::new("hollaex", ProtocolKind::Hollaex))
            .with_exchange(ExchangeConfig::new("bitstamp", ProtocolKind::Bitstamp))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marketfeed_feed=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    let subscriptions = env::var("MARKETFEED_SUBSCRIBE")
        .unwrap_or_else(|_| "hollaex:orderbook:BTC/USDT".to_string())
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(parse_subscription)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let feed = MarketFeed::new(config, WsTransport::new())?;

    feed.on_event(EventKind::OrderBook, |symbol, event| {
        if let MarketEvent::OrderBook(book) = event {
            tracing::info!(
                exchange = %book.exchange,
                %symbol,
                bid = ?book.best_bid(),
                ask = ?book.best_ask(),
                levels = book.bids.len() + book.asks.len(),
                "Order book"
            );
        }
        Ok(())
    });
    feed.on_event(EventKind::Trade, |symbol, event| {
        if let MarketEvent::Trade(trade) = event {
            tracing::info!(
                exchange = %trade.exchange,
                %symbol,
                side = %trade.side,
                price = %trade.price,
                amount = %trade.amount,
                "Trade"
            );
        }
        Ok(())
    });

    let mut notices = feed.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            tracing::warn!(?notice, "Feed notice");
        }
    });

    tracing::info!("Starting Marketfeed watcher");
    for (exchange, kind, symbol) in &subscriptions {
        feed.subscribe(exchange, *kind, symbol, SubscribeOptions::default())
            .await
            .with_context(|| format!("subscribing to {exchange}:{kind}:{symbol}"))?;
        tracing::info!(%exchange, %kind, %symbol, "Subscribed");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down Marketfeed watcher");
    feed.close_all().await;

    Ok(())
}
