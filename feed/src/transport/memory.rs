//! In-process transport.
//!
//! Records every outbound frame and lets the owner script the server side:
//! greeting frames on open, automatic replies, refused connections and
//! dropped sessions.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{FrameSink, Outbound, Transport, TransportEvent, TransportSession};
use crate::error::FeedError;

/// Produces server replies for one outbound frame.
pub type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

struct LiveSession {
    id: u64,
    inbound: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct MemoryState {
    sent: Vec<String>,
    urls: Vec<String>,
    open_count: u64,
    close_count: u64,
    refuse: Option<String>,
    greeting: Vec<String>,
    responder: Option<Responder>,
    live: Option<LiveSession>,
}

/// In-process transport.
///
/// Cloning yields another handle onto the same scripted server.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryTransport")
            .field("sent", &state.sent.len())
            .field("open_count", &state.open_count)
            .field("live", &state.live.is_some())
            .finish()
    }
}

impl MemoryTransport {
    /// Creates a transport that accepts connections and stays silent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a frame pushed to the client on every open.
    #[must_use]
    pub fn with_greeting(self, frame: impl Into<String>) -> Self {
        self.state.lock().greeting.push(frame.into());
        self
    }

    /// Sets the automatic reply function.
    #[must_use]
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.set_responder(responder);
        self
    }

    /// Replaces the automatic reply function.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    /// Removes the automatic reply function.
    pub fn clear_responder(&self) {
        self.state.lock().responder = None;
    }

    /// Makes subsequent opens fail with the given reason, or accept again.
    pub fn refuse_connections(&self, reason: Option<&str>) {
        self.state.lock().refuse = reason.map(str::to_string);
    }

    /// Pushes a frame to the live session. Returns false if none is open.
    pub fn inject(&self, frame: impl Into<String>) -> bool {
        let state = self.state.lock();
        state
            .live
            .as_ref()
            .is_some_and(|live| live.inbound.send(TransportEvent::Text(frame.into())).is_ok())
    }

    /// Ends the live session from the server side.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let live = self.state.lock().live.take();
        live.is_some_and(|live| {
            live.inbound
                .send(TransportEvent::Closed(Some(reason.to_string())))
                .is_ok()
        })
    }

    /// Returns every frame sent by the client, across sessions.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Returns the number of frames sent by the client.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    /// Forgets recorded frames.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Returns the URLs opened, in order.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.state.lock().urls.clone()
    }

    /// Returns the number of sessions opened.
    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.state.lock().open_count
    }

    /// Returns the number of sessions closed by the client.
    #[must_use]
    pub fn close_count(&self) -> u64 {
        self.state.lock().close_count
    }

    /// Returns true if a session is live.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().live.is_some()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<TransportSession, FeedError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.refuse {
            return Err(FeedError::Connection(reason.clone()));
        }

        let (inbound, events) = mpsc::unbounded_channel();
        for frame in &state.greeting {
            let _ = inbound.send(TransportEvent::Text(frame.clone()));
        }

        state.open_count += 1;
        state.urls.push(url.to_string());
        let id = state.open_count;
        state.live = Some(LiveSession { id, inbound });

        Ok(TransportSession {
            sink: Box::new(MemorySink {
                id,
                state: Arc::clone(&self.state),
            }),
            events,
        })
    }
}

struct MemorySink {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
}

impl FrameSink for MemorySink {
    fn send(&self, frame: Outbound) -> Result<(), FeedError> {
        let mut state = self.state.lock();
        if state.live.as_ref().map(|live| live.id) != Some(self.id) {
            return Err(FeedError::ConnectionLost("session closed".to_string()));
        }

        match frame {
            Outbound::Close => {
                state.close_count += 1;
                state.live = None;
            }
            Outbound::Text(text) => {
                let replies = state
                    .responder
                    .as_ref()
                    .map(|responder| responder(&text))
                    .unwrap_or_default();
                state.sent.push(text);
                if let Some(live) = &state.live {
                    for reply in replies {
                        let _ = live.inbound.send(TransportEvent::Text(reply));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_greets_and_records() {
        let transport = MemoryTransport::new().with_greeting("hello");
        let mut session = transport.open("ws://memory").await.expect("open");

        assert_eq!(
            session.events.recv().await,
            Some(TransportEvent::Text("hello".into()))
        );
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.urls(), vec!["ws://memory".to_string()]);

        session
            .sink
            .send(Outbound::Text("ping".into()))
            .expect("send");
        assert_eq!(transport.sent(), vec!["ping".to_string()]);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_responder_replies() {
        let transport =
            MemoryTransport::new().with_responder(|frame| vec![format!("echo:{frame}")]);
        let mut session = transport.open("ws://memory").await.expect("open");

        session.sink.send(Outbound::Text("a".into())).expect("send");
        assert_eq!(
            session.events.recv().await,
            Some(TransportEvent::Text("echo:a".into()))
        );
    }

    #[tokio::test]
    async fn test_inject_and_drop() {
        let transport = MemoryTransport::new();
        assert!(!transport.inject("nobody"));

        let mut session = transport.open("ws://memory").await.expect("open");
        assert!(transport.inject("frame"));
        assert!(transport.drop_connection("bye"));

        assert_eq!(
            session.events.recv().await,
            Some(TransportEvent::Text("frame".into()))
        );
        assert_eq!(
            session.events.recv().await,
            Some(TransportEvent::Closed(Some("bye".into())))
        );
        assert!(!transport.is_open());
        assert!(session.sink.send(Outbound::Text("late".into())).is_err());
    }

    #[tokio::test]
    async fn test_refuse_connections() {
        let transport = MemoryTransport::new();
        transport.refuse_connections(Some("maintenance"));

        let result = transport.open("ws://memory").await;
        assert_eq!(
            result.err(),
            Some(FeedError::Connection("maintenance".into()))
        );
        assert_eq!(transport.open_count(), 0);

        transport.refuse_connections(None);
        assert!(transport.open("ws://memory").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_from_client() {
        let transport = MemoryTransport::new();
        let session = transport.open("ws://memory").await.expect("open");

        session.sink.send(Outbound::Close).expect("close");
        assert_eq!(transport.close_count(), 1);
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_stale_sink_rejected() {
        let transport = MemoryTransport::new();
        let first = transport.open("ws://memory").await.expect("open");
        let _second = transport.open("ws://memory").await.expect("open");

        assert!(first.sink.send(Outbound::Text("x".into())).is_err());
        assert_eq!(transport.sent_count(), 0);
    }
}
