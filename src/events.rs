//! Normalized market events
//!
//! Exchange adapters turn raw frames into these types. Symbols are always in
//! internal (undelimited) form and timestamps are Unix milliseconds.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Price level (price, quantity pair)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Aggressor side of a trade, or the side of a liquidated order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    /// Parse `buy`/`sell` in any case.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("buy") {
            Some(TradeSide::Buy)
        } else if raw.eq_ignore_ascii_case("sell") {
            Some(TradeSide::Sell)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub trade_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: TradeSide,
    pub trade_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    /// Canonical interval, e.g. `1m`, `1h`, `1d`
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: Option<u64>,
    pub is_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    pub symbol: String,
    pub side: TradeSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub event_time: i64,
}

/// Incremental order book change tagged with its sequence range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthDiff {
    pub symbol: String,
    pub event_time: i64,
    /// First update id covered by this diff
    pub first_seq: u64,
    /// Final update id covered by this diff
    pub last_seq: u64,
    /// Sequence of the diff this one follows, for chained protocols
    pub prev_seq: Option<u64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Full point-in-time book state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub event_time: i64,
    pub sequence: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Event produced by parsing one exchange frame
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Trade(Trade),
    DepthDiff(DepthDiff),
    BookSnapshot(BookSnapshot),
    Kline(Kline),
    Liquidation(Liquidation),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::Trade(t) => &t.symbol,
            MarketEvent::DepthDiff(d) => &d.symbol,
            MarketEvent::BookSnapshot(s) => &s.symbol,
            MarketEvent::Kline(k) => &k.symbol,
            MarketEvent::Liquidation(l) => &l.symbol,
        }
    }

    /// Short label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            MarketEvent::Trade(_) => "trade",
            MarketEvent::DepthDiff(_) => "orderbook_update",
            MarketEvent::BookSnapshot(_) => "orderbook_snapshot",
            MarketEvent::Kline(_) => "kline",
            MarketEvent::Liquidation(_) => "liquidation",
        }
    }
}

/// Length of a kline interval (`1m`, `15m`, `4h`, `1d`, `1w`) in milliseconds.
pub fn interval_millis(interval: &str) -> Option<i64> {
    let split = interval.find(|c: char| !c.is_ascii_digit())?;
    let (count, unit) = interval.split_at(split);
    let count: i64 = count.parse().ok()?;
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        _ => return None,
    };
    Some(count * unit_ms)
}
