//! Subscription bookkeeping for one exchange.
//!
//! Tracks which channels callers want, which subscribe/unsubscribe requests
//! are waiting for an acknowledgment, and the timeout armed for each.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use marketfeed_sdk::ExchangeId;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapter::Correlation;
use crate::channel::ChannelKey;
use crate::error::FeedError;
use crate::metrics::FeedMetrics;

static NEXT_NONCE: AtomicU64 = AtomicU64::new(1);

fn next_nonce() -> u64 {
    NEXT_NONCE.fetch_add(1, Ordering::Relaxed)
}

/// Receives the outcome of a request.
pub type AckReceiver = oneshot::Receiver<Result<(), FeedError>>;

/// Direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Subscribe.
    Subscribe,
    /// Unsubscribe.
    Unsubscribe,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// What a caller must do after registering interest.
#[derive(Debug)]
pub enum Ticket {
    /// Nothing to wait for.
    Done,
    /// Another request for the channel is in flight; await its outcome.
    Joined(AckReceiver),
    /// Put a request with this nonce on the wire, then await the outcome
    /// if one is expected.
    Send {
        /// Request nonce.
        nonce: u64,
        /// Outcome, or `None` when the protocol sends no acknowledgment.
        ack: Option<AckReceiver>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireState {
    Idle,
    Pending(u64),
    Active,
    Unsubscribing(u64),
}

#[derive(Debug)]
struct ChannelRef {
    refs: usize,
    depth: Option<usize>,
    wire: WireState,
}

struct PendingRequest {
    key: ChannelKey,
    kind: RequestKind,
    created_at: Instant,
    joined: usize,
    waiters: Vec<oneshot::Sender<Result<(), FeedError>>>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryState {
    channels: HashMap<ChannelKey, ChannelRef>,
    pending: HashMap<u64, PendingRequest>,
}

/// Channel state as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Channel.
    pub key: ChannelKey,
    /// Callers that want the channel.
    pub refs: usize,
    /// Depth limit for emitted books.
    pub depth: Option<usize>,
    /// True if the server confirmed the subscription.
    pub active: bool,
}

/// Subscription registry for one exchange.
///
/// Cloning yields another handle onto the same state.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    exchange: ExchangeId,
    state: Arc<Mutex<RegistryState>>,
    metrics: Arc<FeedMetrics>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("exchange", &self.exchange)
            .field("channels", &state.channels.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(exchange: ExchangeId, metrics: Arc<FeedMetrics>) -> Self {
        Self {
            exchange,
            state: Arc::new(Mutex::new(RegistryState::default())),
            metrics,
        }
    }

    /// Registers one caller's interest in a channel.
    ///
    /// `acknowledged` says whether the protocol answers subscribe requests;
    /// if not, the channel counts as subscribed immediately.
    pub fn subscribe(
        &self,
        key: &ChannelKey,
        depth: Option<usize>,
        timeout: Duration,
        acknowledged: bool,
    ) -> Ticket {
        let mut state = self.state.lock();
        let entry = state.channels.entry(key.clone()).or_insert(ChannelRef {
            refs: 0,
            depth: None,
            wire: WireState::Idle,
        });
        entry.refs += 1;
        if depth.is_some() {
            entry.depth = depth;
        }
        let wire = entry.wire;

        match wire {
            WireState::Active => Ticket::Done,
            WireState::Pending(nonce) => match state.pending.get_mut(&nonce) {
                Some(request) => {
                    let (tx, rx) = oneshot::channel();
                    request.waiters.push(tx);
                    request.joined += 1;
                    Ticket::Joined(rx)
                }
                None => Ticket::Done,
            },
            WireState::Idle | WireState::Unsubscribing(_) => {
                self.start(&mut state, key, RequestKind::Subscribe, timeout, acknowledged, 1)
            }
        }
    }

    /// Re-issues a subscribe for a wanted channel that is not on the wire.
    ///
    /// Returns `None` if the channel is no longer wanted or already
    /// subscribed.
    pub fn resubscribe(&self, key: &ChannelKey, timeout: Duration, acknowledged: bool) -> Option<Ticket> {
        let mut state = self.state.lock();
        let channel = state.channels.get(key)?;
        if channel.refs == 0 || channel.wire != WireState::Idle {
            return None;
        }
        Some(self.start(&mut state, key, RequestKind::Subscribe, timeout, acknowledged, 0))
    }

    /// Drops one caller's interest in a channel.
    pub fn unsubscribe(&self, key: &ChannelKey, timeout: Duration, acknowledged: bool) -> Ticket {
        let mut state = self.state.lock();
        let Some(channel) = state.channels.get_mut(key) else {
            return Ticket::Done;
        };
        if channel.refs == 0 {
            return Ticket::Done;
        }

        channel.refs -= 1;
        if channel.refs > 0 {
            return Ticket::Done;
        }

        let wire = channel.wire;
        match wire {
            WireState::Active | WireState::Pending(_) => {
                self.start(&mut state, key, RequestKind::Unsubscribe, timeout, acknowledged, 0)
            }
            WireState::Idle | WireState::Unsubscribing(_) => {
                state.channels.remove(key);
                Ticket::Done
            }
        }
    }

    fn start(
        &self,
        state: &mut RegistryState,
        key: &ChannelKey,
        kind: RequestKind,
        timeout: Duration,
        acknowledged: bool,
        joined: usize,
    ) -> Ticket {
        let nonce = next_nonce();

        if !acknowledged {
            match kind {
                RequestKind::Subscribe => {
                    if let Some(channel) = state.channels.get_mut(key) {
                        channel.wire = WireState::Active;
                    }
                    self.metrics.record_subscription();
                }
                RequestKind::Unsubscribe => {
                    state.channels.remove(key);
                    self.metrics.record_unsubscription();
                }
            }
            return Ticket::Send { nonce, ack: None };
        }

        if let Some(channel) = state.channels.get_mut(key) {
            channel.wire = match kind {
                RequestKind::Subscribe => WireState::Pending(nonce),
                RequestKind::Unsubscribe => WireState::Unsubscribing(nonce),
            };
        }

        let registry = self.clone();
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.expire(nonce, timeout_ms);
        });

        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            nonce,
            PendingRequest {
                key: key.clone(),
                kind,
                created_at: Instant::now(),
                joined,
                waiters: vec![tx],
                timer: Some(timer),
            },
        );

        debug!(exchange = %self.exchange, channel = %key, nonce, %kind, "Request registered");
        Ticket::Send {
            nonce,
            ack: Some(rx),
        }
    }

    fn expire(&self, nonce: u64, timeout_ms: u64) {
        let key = {
            let state = self.state.lock();
            match state.pending.get(&nonce) {
                Some(request) => request.key.clone(),
                None => return,
            }
        };

        warn!(exchange = %self.exchange, channel = %key, nonce, timeout_ms, "Acknowledgment timed out");
        self.metrics.record_ack_timeout();
        self.complete(
            nonce,
            Err(FeedError::SubscriptionTimeout { key, timeout_ms }),
        );
    }

    /// Resolves the request an ack or error frame refers to.
    ///
    /// `kind` narrows the match when the frame says which direction it
    /// answers. Unmatched correlations are ignored. Returns the channel of
    /// the resolved request.
    pub fn resolve(
        &self,
        correlation: &Correlation,
        kind: Option<RequestKind>,
        result: Result<(), FeedError>,
    ) -> Option<ChannelKey> {
        let nonce = {
            let state = self.state.lock();
            let matches = |request: &PendingRequest| kind.map_or(true, |k| request.kind == k);
            match correlation {
                Correlation::Nonce(nonce) => state
                    .pending
                    .get(nonce)
                    .filter(|request| matches(request))
                    .map(|_| *nonce),
                Correlation::Channel(key) => state
                    .pending
                    .iter()
                    .filter(|(_, request)| &request.key == key && matches(request))
                    .map(|(nonce, _)| *nonce)
                    .min(),
            }
        };

        match nonce {
            Some(nonce) => self.complete(nonce, result),
            None => {
                debug!(exchange = %self.exchange, %correlation, "Unmatched acknowledgment");
                None
            }
        }
    }

    /// Settles a request exactly once; later calls for the nonce are no-ops.
    fn complete(&self, nonce: u64, result: Result<(), FeedError>) -> Option<ChannelKey> {
        let request = {
            let mut state = self.state.lock();
            let request = state.pending.remove(&nonce)?;

            match request.kind {
                RequestKind::Subscribe => {
                    let mut drop_channel = false;
                    if let Some(channel) = state.channels.get_mut(&request.key) {
                        if channel.wire == WireState::Pending(nonce) {
                            if result.is_ok() {
                                channel.wire = WireState::Active;
                            } else {
                                channel.refs = channel.refs.saturating_sub(request.joined);
                                channel.wire = WireState::Idle;
                                drop_channel = channel.refs == 0;
                            }
                        }
                    }
                    if drop_channel {
                        state.channels.remove(&request.key);
                    }
                }
                RequestKind::Unsubscribe => {
                    let settled = state.channels.get(&request.key).is_some_and(|channel| {
                        channel.refs == 0 && channel.wire == WireState::Unsubscribing(nonce)
                    });
                    if settled {
                        state.channels.remove(&request.key);
                    }
                }
            }
            request
        };

        if let Some(timer) = &request.timer {
            timer.abort();
        }

        match (&result, request.kind) {
            (Ok(()), RequestKind::Subscribe) => self.metrics.record_subscription(),
            (Ok(()), RequestKind::Unsubscribe) => self.metrics.record_unsubscription(),
            (Err(_), _) => {}
        }

        debug!(
            exchange = %self.exchange,
            channel = %request.key,
            nonce,
            kind = %request.kind,
            ok = result.is_ok(),
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "Request resolved"
        );

        for waiter in request.waiters {
            let _ = waiter.send(result.clone());
        }
        Some(request.key)
    }

    /// Fails every pending request and marks wanted channels for
    /// resubscription.
    pub fn fail_all(&self, error: &FeedError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.state.lock();
            let drained = state.pending.drain().map(|(_, request)| request).collect();
            state.channels.retain(|_, channel| {
                channel.wire = WireState::Idle;
                channel.refs > 0
            });
            drained
        };

        let count = drained.len();
        for request in drained {
            if let Some(timer) = &request.timer {
                timer.abort();
            }
            for waiter in request.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        count
    }

    /// Returns true if at least one caller wants the channel.
    #[must_use]
    pub fn is_wanted(&self, key: &ChannelKey) -> bool {
        self.state
            .lock()
            .channels
            .get(key)
            .is_some_and(|channel| channel.refs > 0)
    }

    /// Returns the depth limit for the channel.
    #[must_use]
    pub fn depth(&self, key: &ChannelKey) -> Option<usize> {
        self.state.lock().channels.get(key).and_then(|c| c.depth)
    }

    /// Returns wanted channels that are not on the wire.
    #[must_use]
    pub fn resubscribe_targets(&self) -> Vec<ChannelKey> {
        let state = self.state.lock();
        let mut keys: Vec<ChannelKey> = state
            .channels
            .iter()
            .filter(|(_, c)| c.refs > 0 && c.wire == WireState::Idle)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Returns the state of every tracked channel.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelStatus> {
        let state = self.state.lock();
        let mut channels: Vec<ChannelStatus> = state
            .channels
            .iter()
            .map(|(key, c)| ChannelStatus {
                key: key.clone(),
                refs: c.refs,
                depth: c.depth,
                active: c.wire == WireState::Active,
            })
            .collect();
        channels.sort_by(|a, b| a.key.cmp(&b.key));
        channels
    }

    /// Returns the number of requests awaiting acknowledgment.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}
