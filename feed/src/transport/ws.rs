//! WebSocket transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{ChannelSink, Outbound, Transport, TransportEvent, TransportSession};
use crate::error::FeedError;

/// Transport over `tokio-tungstenite`.
///
/// Each session runs a writer task draining the outbound queue and a reader
/// task forwarding text frames. Transport-level pings are answered by
/// tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    /// Creates a new WebSocket transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<TransportSession, FeedError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))?;

        let (mut sink, mut source) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let result = match frame {
                    Outbound::Text(text) => sink.send(Message::Text(text.into())).await,
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "WebSocket write failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(TransportEvent::Text(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.as_str().to_owned());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            debug!(?reason, "WebSocket reader finished");
            let _ = in_tx.send(TransportEvent::Closed(reason));
        });

        Ok(TransportSession {
            sink: Box::new(ChannelSink::new(out_tx)),
            events: in_rx,
        })
    }
}
