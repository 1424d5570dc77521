//! Order book replicas.
//!
//! One replica per (exchange, symbol). Replicas are only ever mutated here;
//! callers receive depth-limited copies.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use marketfeed_sdk::{BookUpdate, ExchangeId, OrderBookView, PriceLevel, Symbol};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;

use crate::error::FeedError;

/// Identifies one replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    /// Exchange.
    pub exchange: ExchangeId,
    /// Canonical symbol.
    pub symbol: Symbol,
}

impl BookKey {
    /// Creates a new book key.
    #[must_use]
    pub const fn new(exchange: ExchangeId, symbol: Symbol) -> Self {
        Self { exchange, symbol }
    }
}

impl fmt::Display for BookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

#[derive(Debug, Default)]
struct OrderBookReplica {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    sequence: Option<u64>,
    timestamp: i64,
    initialized: bool,
}

impl OrderBookReplica {
    fn replace(&mut self, update: &BookUpdate) {
        self.bids.clear();
        self.asks.clear();
        for level in update.bids.iter().filter(|l| !l.is_removal()) {
            self.bids.insert(level.price, level.size);
        }
        for level in update.asks.iter().filter(|l| !l.is_removal()) {
            self.asks.insert(level.price, level.size);
        }
        self.sequence = update.sequence;
        self.timestamp = update.timestamp.unwrap_or_else(now_millis);
        self.initialized = true;
    }

    fn merge(&mut self, update: &BookUpdate) {
        merge_side(&mut self.bids, &update.bids);
        merge_side(&mut self.asks, &update.asks);
        if update.sequence.is_some() {
            self.sequence = update.sequence;
        }
        self.timestamp = update.timestamp.unwrap_or_else(now_millis);
    }

    fn view(&self, key: &BookKey, depth: Option<usize>) -> OrderBookView {
        let limit = depth.unwrap_or(usize::MAX);
        OrderBookView {
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            bids: self
                .bids
                .iter()
                .rev()
                .take(limit)
                .map(|(price, size)| PriceLevel::new(*price, *size))
                .collect(),
            asks: self
                .asks
                .iter()
                .take(limit)
                .map(|(price, size)| PriceLevel::new(*price, *size))
                .collect(),
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}

fn merge_side(side: &mut BTreeMap<Decimal, Decimal>, levels: &[PriceLevel]) {
    for level in levels {
        if level.is_removal() {
            side.remove(&level.price);
        } else {
            side.insert(level.price, level.size);
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Thread-safe store of order book replicas.
///
/// Cloning yields another handle onto the same replicas. Each replica sits
/// behind its own lock, so mutations of different books never contend and
/// a copy always observes both sides at the same update.
#[derive(Clone, Default)]
pub struct OrderBookStore {
    books: Arc<RwLock<HashMap<BookKey, Arc<Mutex<OrderBookReplica>>>>>,
}

impl fmt::Debug for OrderBookStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderBookStore")
            .field("books", &self.books.read().len())
            .finish()
    }
}

impl OrderBookStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn replica(&self, key: &BookKey) -> Option<Arc<Mutex<OrderBookReplica>>> {
        self.books.read().get(key).map(Arc::clone)
    }

    fn replica_or_insert(&self, key: &BookKey) -> Arc<Mutex<OrderBookReplica>> {
        if let Some(replica) = self.replica(key) {
            return replica;
        }
        Arc::clone(self.books.write().entry(key.clone()).or_default())
    }

    /// Replaces the replica with a snapshot.
    ///
    /// Zero-size levels are skipped; a price listed twice keeps the last size.
    pub fn apply_snapshot(&self, key: &BookKey, snapshot: &BookUpdate) {
        self.replica_or_insert(key).lock().replace(snapshot);
    }

    /// Merges a delta into the replica.
    ///
    /// # Errors
    ///
    /// Returns `OrderBookNotInitialized` if no snapshot has been applied,
    /// `SequenceGap` if the delta's sequence does not follow the replica's,
    /// or `MissingSequence` if a sequenced replica receives a delta without
    /// one. The replica is left untouched on every error.
    pub fn apply_delta(&self, key: &BookKey, delta: &BookUpdate) -> Result<(), FeedError> {
        let replica = self
            .replica(key)
            .ok_or_else(|| FeedError::OrderBookNotInitialized(key.to_string()))?;
        let mut replica = replica.lock();

        if !replica.initialized {
            return Err(FeedError::OrderBookNotInitialized(key.to_string()));
        }

        if let Some(current) = replica.sequence {
            let expected = current.saturating_add(1);
            match delta.sequence {
                Some(received) if received == expected => {}
                Some(received) => return Err(FeedError::SequenceGap { expected, received }),
                None => return Err(FeedError::MissingSequence { expected }),
            }
        }

        replica.merge(delta);
        Ok(())
    }

    /// Returns a depth-limited copy of the replica.
    ///
    /// Each side is truncated independently; `None` means full depth.
    #[must_use]
    pub fn clone_book(&self, key: &BookKey, depth: Option<usize>) -> Option<OrderBookView> {
        let replica = self.replica(key)?;
        let replica = replica.lock();
        replica.initialized.then(|| replica.view(key, depth))
    }

    /// Returns true if a snapshot has been applied for the key.
    #[must_use]
    pub fn is_initialized(&self, key: &BookKey) -> bool {
        self.replica(key).is_some_and(|r| r.lock().initialized)
    }

    /// Returns the replica's sequence.
    #[must_use]
    pub fn sequence(&self, key: &BookKey) -> Option<u64> {
        self.replica(key).and_then(|r| r.lock().sequence)
    }

    /// Drops one replica.
    pub fn remove(&self, key: &BookKey) -> bool {
        self.books.write().remove(key).is_some()
    }

    /// Drops every replica of an exchange.
    pub fn clear_exchange(&self, exchange: &ExchangeId) -> usize {
        let mut books = self.books.write();
        let before = books.len();
        books.retain(|key, _| &key.exchange != exchange);
        before - books.len()
    }

    /// Returns the keys of initialized replicas.
    #[must_use]
    pub fn keys(&self) -> Vec<BookKey> {
        self.books
            .read()
            .iter()
            .filter(|(_, replica)| replica.lock().initialized)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns the number of replicas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.books.read().len()
    }

    /// Returns true if the store holds no replica.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.books.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn key() -> BookKey {
        BookKey::new(ExchangeId::new("cex"), "BTC/EUR".parse().expect("symbol"))
    }

    fn level(price: Decimal, size: Decimal) -> PriceLevel {
        PriceLevel::new(price, size)
    }

    fn snapshot(sequence: u64) -> BookUpdate {
        BookUpdate::new(
            vec![level(dec!(100), dec!(1))],
            vec![level(dec!(101), dec!(1))],
        )
        .with_sequence(sequence)
        .with_timestamp(1_000)
    }

    fn assert_sorted(view: &OrderBookView) {
        assert!(view.bids.windows(2).all(|w| w[0].price > w[1].price));
        assert!(view.asks.windows(2).all(|w| w[0].price < w[1].price));
    }

    #[test]
    fn test_snapshot_sorted_and_deduplicated() {
        let store = OrderBookStore::new();
        let update = BookUpdate::new(
            vec![
                level(dec!(99), dec!(1)),
                level(dec!(101), dec!(2)),
                level(dec!(100), dec!(3)),
                level(dec!(101), dec!(4)),
                level(dec!(98), dec!(0)),
            ],
            vec![
                level(dec!(105), dec!(1)),
                level(dec!(103), dec!(1)),
                level(dec!(104), dec!(0)),
                level(dec!(103), dec!(2)),
            ],
        );

        store.apply_snapshot(&key(), &update);
        let view = store.clone_book(&key(), None).expect("book");

        assert_sorted(&view);
        assert_eq!(view.bids.len(), 3);
        assert_eq!(view.bids[0], level(dec!(101), dec!(4)));
        assert_eq!(view.asks.len(), 2);
        assert_eq!(view.asks[0], level(dec!(103), dec!(2)));
        assert!(view.level_at(marketfeed_sdk::Side::Buy, dec!(98)).is_none());
    }

    #[test]
    fn test_snapshot_replaces_book() {
        let store = OrderBookStore::new();
        store.apply_snapshot(&key(), &snapshot(5));
        store.apply_snapshot(
            &key(),
            &BookUpdate::new(vec![level(dec!(90), dec!(2))], Vec::new()).with_sequence(20),
        );

        let view = store.clone_book(&key(), None).expect("book");
        assert_eq!(view.bids, vec![level(dec!(90), dec!(2))]);
        assert!(view.asks.is_empty());
        assert_eq!(view.sequence, Some(20));
    }

    #[test]
    fn test_delta_removes_zero_level() {
        let store = OrderBookStore::new();
        store.apply_snapshot(&key(), &snapshot(5));

        let delta = BookUpdate::new(vec![level(dec!(100), dec!(0))], Vec::new()).with_sequence(6);
        store.apply_delta(&key(), &delta).expect("apply delta");

        let view = store.clone_book(&key(), None).expect("book");
        assert!(view.bids.is_empty());
        assert_eq!(view.asks, vec![level(dec!(101), dec!(1))]);
        assert_eq!(view.sequence, Some(6));
    }

    #[test]
    fn test_delta_upserts() {
        let store = OrderBookStore::new();
        store.apply_snapshot(&key(), &snapshot(5));

        let delta = BookUpdate::new(
            vec![level(dec!(100), dec!(7)), level(dec!(99.5), dec!(1))],
            vec![level(dec!(100.5), dec!(2))],
        )
        .with_sequence(6);
        store.apply_delta(&key(), &delta).expect("apply delta");

        let view = store.clone_book(&key(), None).expect("book");
        assert_sorted(&view);
        assert_eq!(view.bids[0], level(dec!(100), dec!(7)));
        assert_eq!(view.bids.len(), 2);
        assert_eq!(view.best_ask(), Some(dec!(100.5)));
    }

    #[test]
    fn test_delta_sequence_gap_leaves_replica_unchanged() {
        let store = OrderBookStore::new();
        store.apply_snapshot(&key(), &snapshot(5));
        let before = store.clone_book(&key(), None).expect("book");

        let delta = BookUpdate::new(vec![level(dec!(100), dec!(0))], Vec::new()).with_sequence(8);
        let err = store.apply_delta(&key(), &delta).expect_err("gap");

        assert_eq!(
            err,
            FeedError::SequenceGap {
                expected: 6,
                received: 8
            }
        );
        assert_eq!(store.clone_book(&key(), None), Some(before));
        assert_eq!(store.sequence(&key()), Some(5));
    }

    #[test]
    fn test_delta_stale_sequence_rejected() {
        let store = OrderBookStore::new();
        store.apply_snapshot(&key(), &snapshot(5));

        let delta = BookUpdate::new(vec![level(dec!(100), dec!(3))], Vec::new()).with_sequence(5);
        assert!(matches!(
            store.apply_delta(&key(), &delta),
            Err(FeedError::SequenceGap { .. })
        ));
    }

    #[test]
    fn test_delta_before_snapshot() {
        let store = OrderBookStore::new();
        let delta = BookUpdate::new(vec![level(dec!(100), dec!(1))], Vec::new());

        assert!(matches!(
            store.apply_delta(&key(), &delta),
            Err(FeedError::OrderBookNotInitialized(_))
        ));
        assert!(!store.is_initialized(&key()));
        assert!(store.clone_book(&key(), None).is_none());
    }

    #[test]
    fn test_delta_without_sequence_on_sequenced_book() {
        let store = OrderBookStore::new();
        store.apply_snapshot(&key(), &snapshot(5));
        let before = store.clone_book(&key(), None).expect("book");

        let delta = BookUpdate::new(vec![level(dec!(100), dec!(0))], Vec::new());
        let err = store.apply_delta(&key(), &delta).expect_err("missing sequence");

        assert_eq!(err, FeedError::MissingSequence { expected: 6 });
        assert_eq!(store.clone_book(&key(), None), Some(before));
        assert_eq!(store.sequence(&key()), Some(5));
    }

    #[test]
    fn test_unsequenced_deltas() {
        let store = OrderBookStore::new();
        store.apply_snapshot(
            &key(),
            &BookUpdate::new(vec![level(dec!(100), dec!(1))], Vec::new()),
        );

        for size in [dec!(2), dec!(3)] {
            let delta = BookUpdate::new(vec![level(dec!(100), size)], Vec::new());
            store.apply_delta(&key(), &delta).expect("apply delta");
        }

        let view = store.clone_book(&key(), None).expect("book");
        assert_eq!(view.bids, vec![level(dec!(100), dec!(3))]);
        assert_eq!(view.sequence, None);
    }

    #[test]
    fn test_clone_depth_limit() {
        let store = OrderBookStore::new();
        let bids = (1..=50)
            .map(|p| level(Decimal::from(p), dec!(1)))
            .collect::<Vec<_>>();
        let asks = (51..=60)
            .map(|p| level(Decimal::from(p), dec!(1)))
            .collect::<Vec<_>>();
        store.apply_snapshot(&key(), &BookUpdate::new(bids, asks));

        let view = store.clone_book(&key(), Some(5)).expect("book");
        let prices: Vec<Decimal> = view.bids.iter().map(|l| l.price).collect();
        assert_eq!(
            prices,
            vec![dec!(50), dec!(49), dec!(48), dec!(47), dec!(46)]
        );
        assert_eq!(view.asks.len(), 5);
        assert_eq!(view.best_ask(), Some(dec!(51)));

        let full = store.clone_book(&key(), None).expect("book");
        assert_eq!(full.bids.len(), 50);
        assert_eq!(full.asks.len(), 10);
    }

    #[test]
    fn test_clone_is_detached() {
        let store = OrderBookStore::new();
        store.apply_snapshot(&key(), &snapshot(5));

        let mut view = store.clone_book(&key(), None).expect("book");
        view.bids.clear();

        let fresh = store.clone_book(&key(), None).expect("book");
        assert_eq!(fresh.bids.len(), 1);
    }

    #[test]
    fn test_timestamp_tracks_updates() {
        let store = OrderBookStore::new();
        store.apply_snapshot(&key(), &snapshot(5));
        assert_eq!(store.clone_book(&key(), None).expect("book").timestamp, 1_000);

        let delta = BookUpdate::new(Vec::new(), Vec::new())
            .with_sequence(6)
            .with_timestamp(2_000);
        store.apply_delta(&key(), &delta).expect("apply delta");
        assert_eq!(store.clone_book(&key(), None).expect("book").timestamp, 2_000);
    }

    #[test]
    fn test_clear_exchange() {
        let store = OrderBookStore::new();
        let other = BookKey::new(ExchangeId::new("bitstamp"), "BTC/EUR".parse().expect("symbol"));
        store.apply_snapshot(&key(), &snapshot(1));
        store.apply_snapshot(&other, &snapshot(1));

        assert_eq!(store.clear_exchange(&ExchangeId::new("cex")), 1);
        assert!(!store.is_initialized(&key()));
        assert!(store.is_initialized(&other));
        assert_eq!(store.keys(), vec![other.clone()]);

        assert!(store.remove(&other));
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_handles_share_state() {
        let store = OrderBookStore::new();
        let handle = store.clone();
        handle.apply_snapshot(&key(), &snapshot(1));
        assert!(store.is_initialized(&key()));
        assert_eq!(store.len(), 1);
    }
}
