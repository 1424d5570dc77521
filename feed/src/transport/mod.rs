//! Transport abstraction layer.
//!
//! A transport opens one bidirectional text session per call. The outbound
//! half is a non-blocking sink; the inbound half is a stream of events.

pub mod memory;
pub mod ws;

pub use memory::MemoryTransport;
pub use ws::WsTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::FeedError;

/// Frame written to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(String),
    /// Close the session.
    Close,
}

/// Event read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Text frame.
    Text(String),
    /// The session ended, with an optional reason.
    Closed(Option<String>),
}

/// Outbound half of a session.
pub trait FrameSink: Send + Sync {
    /// Queues a frame without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is gone.
    fn send(&self, frame: Outbound) -> Result<(), FeedError>;
}

/// One open session.
pub struct TransportSession {
    /// Outbound half.
    pub sink: Box<dyn FrameSink>,
    /// Inbound half.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession").finish_non_exhaustive()
    }
}

/// Opens sessions to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session.
    async fn open(&self, url: &str) -> Result<TransportSession, FeedError>;
}

/// Sink backed by an unbounded channel drained by a writer task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    /// Wraps a sender.
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }
}

impl FrameSink for ChannelSink {
    fn send(&self, frame: Outbound) -> Result<(), FeedError> {
        self.tx
            .send(frame)
            .map_err(|_| FeedError::ConnectionLost("transport writer closed".to_string()))
    }
}
