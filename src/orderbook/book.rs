//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{ResyncReason, SequenceCheck, SequencePolicy, Side, SyncStatus, UpdateOutcome};
use crate::events::{BookSnapshot, DepthDiff, PriceLevel};

/// Order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Last applied update ID
    last_update_id: u64,
    status: SyncStatus,
    /// Maximum depth levels to maintain per side
    max_depth: usize,
    /// Exchange timestamp of the last snapshot or diff
    last_update_time: i64,
}

impl OrderBook {
    /// Create a new empty order book awaiting its first snapshot
    pub fn new(symbol: &str, max_depth: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            status: SyncStatus::AwaitingSnapshot,
            max_depth,
            last_update_time: 0,
        }
    }

    /// Replace the book with a snapshot, unconditionally
    pub fn apply_snapshot(&mut self, snapshot: &BookSnapshot) {
        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if level.quantity > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.quantity);
            }
        }

        for level in &snapshot.asks {
            if level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.last_update_id = snapshot.sequence;
        self.last_update_time = snapshot.event_time;
        self.status = SyncStatus::Synced;
        self.trim_depth();
    }

    /// Apply a depth diff if it continues the local sequence
    pub fn apply_update(&mut self, update: &DepthDiff, policy: SequencePolicy) -> UpdateOutcome {
        match self.status {
            SyncStatus::AwaitingSnapshot => {
                self.status = SyncStatus::Resyncing;
                return UpdateOutcome::ResyncRequired(ResyncReason::Bootstrap);
            }
            SyncStatus::Resyncing => return UpdateOutcome::Discarded,
            SyncStatus::Synced => {}
        }

        match policy.check(self.last_update_id, update) {
            SequenceCheck::Stale => return UpdateOutcome::Stale,
            SequenceCheck::Gap { expected, got } => {
                self.invalidate();
                return UpdateOutcome::ResyncRequired(ResyncReason::Gap { expected, got });
            }
            SequenceCheck::Contiguous => {}
        }

        for level in &update.bids {
            self.update_side(Side::Bid, level);
        }
        for level in &update.asks {
            self.update_side(Side::Ask, level);
        }

        self.last_update_id = update.last_seq;
        self.last_update_time = update.event_time;
        self.trim_depth();

        if let (Some(best_bid), Some(best_ask)) = (self.best_bid(), self.best_ask()) {
            if best_bid >= best_ask {
                self.invalidate();
                return UpdateOutcome::ResyncRequired(ResyncReason::Crossed { best_bid, best_ask });
            }
        }

        UpdateOutcome::Applied
    }

    /// Drop all levels and wait for a new snapshot
    pub fn invalidate(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.status = SyncStatus::Resyncing;
    }

    /// Forget all state; the next diff requests a snapshot
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = 0;
        self.status = SyncStatus::AwaitingSnapshot;
    }

    /// Mark that a snapshot has been requested
    pub fn begin_resync(&mut self) {
        if self.status != SyncStatus::Synced {
            self.status = SyncStatus::Resyncing;
        } else {
            self.invalidate();
        }
    }

    /// The requested snapshot never arrived; allow the next diff to ask again
    pub fn resync_failed(&mut self) {
        if self.status == SyncStatus::Resyncing {
            self.status = SyncStatus::AwaitingSnapshot;
        }
    }

    /// Update a single price level
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        match side {
            Side::Bid => {
                if level.quantity == Decimal::ZERO {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.quantity);
                }
            }
            Side::Ask => {
                if level.quantity == Decimal::ZERO {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.quantity);
                }
            }
        }
    }

    /// Trim the book to max depth
    fn trim_depth(&mut self) {
        while self.bids.len() > self.max_depth {
            self.bids.pop_last();
        }
        while self.asks.len() > self.max_depth {
            self.asks.pop_last();
        }
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Get last update ID
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Top `levels` bids, best first
    pub fn bids(&self, levels: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .take(levels)
            .map(|(Reverse(p), q)| PriceLevel::new(*p, *q))
            .collect()
    }

    /// Top `levels` asks, best first
    pub fn asks(&self, levels: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(levels)
            .map(|(p, q)| PriceLevel::new(*p, *q))
            .collect()
    }

    /// Current top-N state as a snapshot
    pub fn to_snapshot(&self, levels: usize) -> BookSnapshot {
        BookSnapshot {
            symbol: self.symbol.clone(),
            event_time: self.last_update_time,
            sequence: self.last_update_id,
            bids: self.bids(levels),
            asks: self.asks(levels),
        }
    }
}
