//! Exchange adapters
//!
//! Each supported venue implements [`ExchangeAdapter`]: how to reach and
//! subscribe to its public streams, how to turn a raw frame into
//! [`MarketEvent`]s, and how to recover an order book after a sequence fault.
//! The connection manager is generic over the adapter, which is chosen once
//! at startup from configuration.

mod binance;
mod bybit;
mod okx;

pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use okx::OkxAdapter;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IngestError, Result};
use crate::events::{interval_millis, BookSnapshot, MarketEvent, PriceLevel};
use crate::orderbook::SequencePolicy;
use crate::symbol;

/// Supported exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
}

impl Exchange {
    pub const ALL: [Exchange; 3] = [Exchange::Binance, Exchange::Bybit, Exchange::Okx];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Okx => "okx",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        Exchange::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| IngestError::ConfigError(format!("unknown exchange '{s}'")))
    }
}

/// Spot or perpetual instruments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    #[default]
    Spot,
    Perpetual,
}

/// A stream to subscribe to for every configured symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StreamKind {
    Trade,
    Depth,
    /// Candles at a canonical interval such as `1m`
    Kline(String),
    Liquidation,
}

impl FromStr for StreamKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "trade" | "trades" => Ok(StreamKind::Trade),
            "depth" | "orderbook" => Ok(StreamKind::Depth),
            "kline" => Ok(StreamKind::Kline("1m".to_string())),
            "liquidation" | "liquidations" | "forceorder" => Ok(StreamKind::Liquidation),
            other => match other.strip_prefix("kline_") {
                Some(interval) if interval_millis(interval).is_some() => {
                    Ok(StreamKind::Kline(interval.to_string()))
                }
                _ => Err(IngestError::ConfigError(format!("unknown stream kind '{s}'"))),
            },
        }
    }
}

impl TryFrom<String> for StreamKind {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StreamKind> for String {
    fn from(kind: StreamKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Trade => f.write_str("trade"),
            StreamKind::Depth => f.write_str("depth"),
            StreamKind::Kline(interval) => write!(f, "kline_{interval}"),
            StreamKind::Liquidation => f.write_str("liquidation"),
        }
    }
}

/// Keep-alive message format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingPayload {
    /// Text frame, e.g. OKX `ping` or Bybit `{"op":"ping"}`
    Text(String),
    /// Standard WebSocket ping frame
    WebSocketPing,
}

/// Classification of one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Market data; trade frames may batch several prints
    Events(Vec<MarketEvent>),
    /// Reply to our keep-alive
    Pong,
    /// Subscription acks and other protocol chatter
    Control,
    /// Valid JSON we have no use for
    Unrecognized,
}

/// How to obtain a fresh order book snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncRequest {
    /// Fetch over REST with [`ExchangeAdapter::fetch_snapshot`]
    FetchSnapshot,
    /// Re-subscribe the book channel; the exchange pushes a snapshot first
    Resubscribe {
        unsubscribe: String,
        subscribe: String,
    },
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    /// How diff sequence numbers chain on this exchange
    fn sequence_policy(&self) -> SequencePolicy;

    /// URL to connect to
    fn stream_url(&self, symbols: &[String], streams: &[StreamKind]) -> String;

    /// Messages to send right after connecting
    fn subscribe_messages(&self, symbols: &[String], streams: &[StreamKind]) -> Vec<String>;

    /// Parse one text frame. Errors are protocol faults: the frame is dropped
    /// and the stream continues.
    fn parse_frame(&self, text: &str) -> Result<Frame>;

    fn ping_payload(&self) -> PingPayload;

    fn resync_request(&self, symbol: &str) -> ResyncRequest;

    /// Fetch a REST snapshot of `symbol` with at least `depth` levels
    async fn fetch_snapshot(
        &self,
        _http: &reqwest::Client,
        _symbol: &str,
        _depth: usize,
    ) -> Result<BookSnapshot> {
        Err(IngestError::SnapshotUnsupported {
            exchange: self.exchange().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// JSON helpers shared by the parsers
// ---------------------------------------------------------------------------

pub(crate) fn field<'a>(v: &'a Value, key: &str) -> Result<&'a Value> {
    v.get(key)
        .ok_or_else(|| IngestError::ParseError(format!("missing field '{key}'")))
}

pub(crate) fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str> {
    field(v, key)?
        .as_str()
        .ok_or_else(|| IngestError::ParseError(format!("field '{key}' is not a string")))
}

/// Decimal encoded either as a JSON string or number
pub(crate) fn decimal_value(v: &Value) -> Result<Decimal> {
    match v {
        Value::String(s) => Decimal::from_str(s)
            .map_err(|e| IngestError::ParseError(format!("invalid decimal '{s}': {e}"))),
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| IngestError::ParseError(format!("invalid decimal '{n}': {e}"))),
        other => Err(IngestError::ParseError(format!("expected decimal, got {other}"))),
    }
}

pub(crate) fn decimal_field(v: &Value, key: &str) -> Result<Decimal> {
    decimal_value(field(v, key)?)
}

/// Integer encoded either as a JSON string or number
pub(crate) fn i64_value(v: &Value) -> Result<i64> {
    match v {
        Value::String(s) => s
            .parse()
            .map_err(|_| IngestError::ParseError(format!("invalid integer '{s}'"))),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| IngestError::ParseError(format!("invalid integer {n}"))),
        other => Err(IngestError::ParseError(format!("expected integer, got {other}"))),
    }
}

pub(crate) fn i64_field(v: &Value, key: &str) -> Result<i64> {
    i64_value(field(v, key)?)
}

pub(crate) fn u64_field(v: &Value, key: &str) -> Result<u64> {
    let n = i64_field(v, key)?;
    u64::try_from(n).map_err(|_| IngestError::ParseError(format!("field '{key}' is negative")))
}

/// Levels encoded as `[["price", "qty", ...], ...]`
pub(crate) fn parse_levels(v: &Value) -> Result<Vec<PriceLevel>> {
    let rows = v
        .as_array()
        .ok_or_else(|| IngestError::ParseError("price levels are not an array".to_string()))?;
    rows.iter()
        .map(|row| match row.as_array().map(Vec::as_slice) {
            Some([price, qty, ..]) => Ok(PriceLevel::new(decimal_value(price)?, decimal_value(qty)?)),
            _ => Err(IngestError::ParseError(format!("invalid price level {row}"))),
        })
        .collect()
}

/// Exchange-native symbol to internal form
pub(crate) fn internal_symbol(native: &str) -> Result<String> {
    Ok(symbol::normalize(native)?)
}
