//! Order book module
//!
//! Reconstructs depth-bounded local books from snapshots plus sequenced diffs
//! and detects when the local state can no longer be trusted.

mod book;
mod manager;

pub use book::OrderBook;
pub use manager::OrderBookEngine;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::events::DepthDiff;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// Synchronization state of a local book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No trusted state and no snapshot requested yet
    AwaitingSnapshot,
    /// Snapshot requested; diffs are discarded until it lands
    Resyncing,
    /// Applying diffs normally
    Synced,
}

impl SyncStatus {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncStatus::Synced)
    }
}

/// How an exchange chains its diff sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePolicy {
    /// Diffs carry an id range `[first, last]`; the next diff must cover
    /// `last_applied + 1` (Binance `U`/`u`).
    Range,
    /// Each diff carries one id that must be exactly `last_applied + 1`
    /// (Bybit `u`).
    Consecutive,
    /// Each diff names the id it follows (OKX `prevSeqId`/`seqId`).
    Chained,
}

/// Result of checking a diff against the last applied sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    Contiguous,
    Stale,
    Gap { expected: u64, got: u64 },
}

impl SequencePolicy {
    pub fn check(&self, last_applied: u64, diff: &DepthDiff) -> SequenceCheck {
        let next = last_applied + 1;
        match self {
            SequencePolicy::Range => {
                if diff.last_seq <= last_applied {
                    SequenceCheck::Stale
                } else if diff.first_seq <= next {
                    SequenceCheck::Contiguous
                } else {
                    SequenceCheck::Gap {
                        expected: next,
                        got: diff.first_seq,
                    }
                }
            }
            SequencePolicy::Consecutive => {
                if diff.last_seq <= last_applied {
                    SequenceCheck::Stale
                } else if diff.first_seq == next {
                    SequenceCheck::Contiguous
                } else {
                    SequenceCheck::Gap {
                        expected: next,
                        got: diff.first_seq,
                    }
                }
            }
            SequencePolicy::Chained => match diff.prev_seq {
                Some(prev) if prev == last_applied => SequenceCheck::Contiguous,
                _ if diff.last_seq < last_applied => SequenceCheck::Stale,
                prev => SequenceCheck::Gap {
                    expected: last_applied,
                    got: prev.unwrap_or(diff.first_seq),
                },
            },
        }
    }
}

/// Why a book needs a fresh snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// First diff for a book that never had a snapshot
    Bootstrap,
    /// Missed one or more diffs
    Gap { expected: u64, got: u64 },
    /// Best bid at or above best ask after applying a diff
    Crossed { best_bid: Decimal, best_ask: Decimal },
}

/// Outcome of applying a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Already covered by the current snapshot
    Stale,
    /// Dropped while waiting for a snapshot
    Discarded,
    /// Rejected; the caller must fetch a snapshot
    ResyncRequired(ResyncReason),
}
