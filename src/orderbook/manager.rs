//! Order book engine
//!
//! Manages the books of one exchange connection. Only the owning connection
//! mutates a book; the per-symbol mutex guards it against the periodic
//! snapshot timer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{OrderBook, ResyncReason, SequencePolicy, SyncStatus, UpdateOutcome};
use crate::events::{BookSnapshot, DepthDiff};
use crate::exchange::Exchange;

/// Manages order books for multiple symbols of one exchange
#[derive(Debug)]
pub struct OrderBookEngine {
    exchange: Exchange,
    policy: SequencePolicy,
    max_depth: usize,
    books: RwLock<HashMap<String, Arc<Mutex<OrderBook>>>>,
}

impl OrderBookEngine {
    pub fn new(exchange: Exchange, policy: SequencePolicy, max_depth: usize) -> Self {
        Self {
            exchange,
            policy,
            max_depth,
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn policy(&self) -> SequencePolicy {
        self.policy
    }

    /// Levels kept per side
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    async fn book(&self, symbol: &str) -> Arc<Mutex<OrderBook>> {
        if let Some(book) = self.books.read().await.get(symbol) {
            return book.clone();
        }
        let mut books = self.books.write().await;
        books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new(symbol, self.max_depth))))
            .clone()
    }

    async fn existing(&self, symbol: &str) -> Option<Arc<Mutex<OrderBook>>> {
        self.books.read().await.get(symbol).cloned()
    }

    /// Replace a book with a snapshot, creating it if needed
    pub async fn apply_snapshot(&self, snapshot: &BookSnapshot) {
        let book = self.book(&snapshot.symbol).await;
        book.lock().await.apply_snapshot(snapshot);
        info!(
            exchange = %self.exchange,
            symbol = %snapshot.symbol,
            sequence = snapshot.sequence,
            "Order book synced from snapshot"
        );
    }

    /// Apply a diff. A `ResyncRequired` outcome means the caller must fetch
    /// a snapshot; until it lands further diffs are discarded.
    pub async fn apply_update(&self, diff: &DepthDiff) -> UpdateOutcome {
        let book = self.book(&diff.symbol).await;
        let outcome = book.lock().await.apply_update(diff, self.policy);

        match outcome {
            UpdateOutcome::ResyncRequired(ResyncReason::Gap { expected, got }) => {
                warn!(
                    exchange = %self.exchange,
                    symbol = %diff.symbol,
                    expected,
                    got,
                    "Sequence gap detected, resyncing"
                );
            }
            UpdateOutcome::ResyncRequired(ResyncReason::Crossed { best_bid, best_ask }) => {
                warn!(
                    exchange = %self.exchange,
                    symbol = %diff.symbol,
                    best_bid = %best_bid,
                    best_ask = %best_ask,
                    "Crossed book detected, resyncing"
                );
            }
            UpdateOutcome::ResyncRequired(ResyncReason::Bootstrap) => {
                info!(
                    exchange = %self.exchange,
                    symbol = %diff.symbol,
                    "No snapshot yet, requesting one"
                );
            }
            UpdateOutcome::Stale | UpdateOutcome::Discarded => {
                debug!(
                    exchange = %self.exchange,
                    symbol = %diff.symbol,
                    last_seq = diff.last_seq,
                    outcome = ?outcome,
                    "Diff not applied"
                );
            }
            UpdateOutcome::Applied => {}
        }

        outcome
    }

    /// Record that a snapshot was requested for `symbol`
    pub async fn begin_resync(&self, symbol: &str) {
        self.book(symbol).await.lock().await.begin_resync();
    }

    /// The snapshot request for `symbol` failed
    pub async fn resync_failed(&self, symbol: &str) {
        if let Some(book) = self.existing(symbol).await {
            book.lock().await.resync_failed();
        }
    }

    /// Forget every book's state, e.g. after the stream was interrupted
    pub async fn invalidate_all(&self) {
        let books: Vec<_> = self.books.read().await.values().cloned().collect();
        for book in books {
            book.lock().await.reset();
        }
    }

    /// Stop tracking a symbol
    pub async fn remove(&self, symbol: &str) -> bool {
        self.books.write().await.remove(symbol).is_some()
    }

    /// Top-N snapshot of a synced book
    pub async fn snapshot(&self, symbol: &str, levels: usize) -> Option<BookSnapshot> {
        let book = self.existing(symbol).await?;
        let book = book.lock().await;
        book.status().is_synced().then(|| book.to_snapshot(levels))
    }

    /// Top-N snapshots of every synced book
    pub async fn snapshots(&self, levels: usize) -> Vec<BookSnapshot> {
        let books: Vec<_> = self.books.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(books.len());
        for book in books {
            let book = book.lock().await;
            if book.status().is_synced() {
                snapshots.push(book.to_snapshot(levels));
            }
        }
        snapshots
    }

    pub async fn status(&self, symbol: &str) -> Option<SyncStatus> {
        let book = self.existing(symbol).await?;
        let status = book.lock().await.status();
        Some(status)
    }

    /// Get the last update ID for a symbol
    pub async fn last_update_id(&self, symbol: &str) -> Option<u64> {
        let book = self.existing(symbol).await?;
        let id = book.lock().await.last_update_id();
        Some(id)
    }

    /// Get list of symbols being tracked
    pub async fn symbols(&self) -> Vec<String> {
        self.books.read().await.keys().cloned().collect()
    }
}
