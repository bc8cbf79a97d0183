//! OKX v5 public stream adapter
//!
//! Channels are keyed by instrument id (`BTC-USDT`, `BTC-USDT-SWAP`). Book
//! messages chain through `prevSeqId`/`seqId`; a resubscribe makes the
//! exchange push a fresh snapshot.

use std::collections::HashSet;

use serde_json::{json, Value};

use super::{
    decimal_field, field, i64_field, i64_value, internal_symbol, parse_levels, str_field,
    Exchange, ExchangeAdapter, Frame, MarketType, PingPayload, ResyncRequest, StreamKind,
};
use crate::error::{IngestError, Result};
use crate::events::{
    interval_millis, BookSnapshot, DepthDiff, Kline, Liquidation, MarketEvent, Trade, TradeSide,
};
use crate::orderbook::SequencePolicy;
use crate::symbol;

pub struct OkxAdapter {
    ws_endpoint: String,
    market: MarketType,
    /// Internal symbols we track; the liquidation channel is instrument-type wide
    symbols: HashSet<String>,
}

impl OkxAdapter {
    pub fn new(ws_endpoint: &str, market: MarketType, symbols: &[String]) -> Self {
        Self {
            ws_endpoint: ws_endpoint.to_string(),
            market,
            symbols: symbols.iter().cloned().collect(),
        }
    }

    /// `BTCUSDT` -> `BTC-USDT`, or `BTC-USDT-SWAP` for perpetuals
    fn inst_id(&self, symbol: &str) -> String {
        let spot = symbol::to_delimited(symbol)
            .map(|s| s.replace('/', "-"))
            .unwrap_or_else(|_| symbol.to_string());
        match self.market {
            MarketType::Spot => spot,
            MarketType::Perpetual => format!("{spot}-SWAP"),
        }
    }

    fn channel_arg(&self, symbol: &str, stream: &StreamKind) -> Result<Option<Value>> {
        let inst_id = self.inst_id(symbol);
        Ok(match stream {
            StreamKind::Trade => Some(json!({ "channel": "trades", "instId": inst_id })),
            StreamKind::Depth => Some(json!({ "channel": "books", "instId": inst_id })),
            StreamKind::Kline(interval) => Some(json!({
                "channel": format!("candle{}", to_okx_interval(interval)?),
                "instId": inst_id,
            })),
            // Subscribed once per connection, see subscribe_messages
            StreamKind::Liquidation => None,
        })
    }

    fn op_message(op: &str, args: Vec<Value>) -> String {
        json!({ "op": op, "args": args }).to_string()
    }

    fn parse_books(value: &Value, symbol: &str) -> Result<Vec<MarketEvent>> {
        let snapshot = value.get("action").and_then(Value::as_str) == Some("snapshot");
        data_rows(value)?
            .iter()
            .map(|row| {
                let event_time = i64_field(row, "ts")?;
                let seq = u64_value(field(row, "seqId")?, "seqId")?;
                let bids = parse_levels(field(row, "bids")?)?;
                let asks = parse_levels(field(row, "asks")?)?;

                if snapshot {
                    Ok(MarketEvent::BookSnapshot(BookSnapshot {
                        symbol: symbol.to_string(),
                        event_time,
                        sequence: seq,
                        bids,
                        asks,
                    }))
                } else {
                    let prev = i64_field(row, "prevSeqId")?;
                    Ok(MarketEvent::DepthDiff(DepthDiff {
                        symbol: symbol.to_string(),
                        event_time,
                        first_seq: seq,
                        last_seq: seq,
                        prev_seq: u64::try_from(prev).ok(),
                        bids,
                        asks,
                    }))
                }
            })
            .collect()
    }

    fn parse_trades(value: &Value, symbol: &str) -> Result<Vec<MarketEvent>> {
        data_rows(value)?
            .iter()
            .map(|row| {
                Ok(MarketEvent::Trade(Trade {
                    symbol: symbol.to_string(),
                    trade_id: str_field(row, "tradeId")?.to_string(),
                    price: decimal_field(row, "px")?,
                    quantity: decimal_field(row, "sz")?,
                    side: parse_side(str_field(row, "side")?)?,
                    trade_time: i64_field(row, "ts")?,
                }))
            })
            .collect()
    }

    /// Candle rows are positional: `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`
    fn parse_candles(value: &Value, symbol: &str, channel: &str) -> Result<Vec<MarketEvent>> {
        let interval = from_okx_interval(channel.trim_start_matches("candle"))?;
        let span = interval_millis(&interval)
            .ok_or_else(|| IngestError::ParseError(format!("unknown candle channel '{channel}'")))?;

        data_rows(value)?
            .iter()
            .map(|row| {
                let cols = row
                    .as_array()
                    .filter(|cols| cols.len() >= 6)
                    .ok_or_else(|| IngestError::ParseError(format!("invalid candle row {row}")))?;
                let open_time = i64_value(&cols[0])?;
                Ok(MarketEvent::Kline(Kline {
                    symbol: symbol.to_string(),
                    interval: interval.clone(),
                    open_time,
                    close_time: open_time + span - 1,
                    open: super::decimal_value(&cols[1])?,
                    high: super::decimal_value(&cols[2])?,
                    low: super::decimal_value(&cols[3])?,
                    close: super::decimal_value(&cols[4])?,
                    volume: super::decimal_value(&cols[5])?,
                    trade_count: None,
                    is_closed: cols.get(8).and_then(Value::as_str) == Some("1"),
                }))
            })
            .collect()
    }

    /// One message may carry liquidations for many instruments; keep ours
    fn parse_liquidations(&self, value: &Value) -> Result<Vec<MarketEvent>> {
        let mut events = Vec::new();
        for row in data_rows(value)? {
            let symbol = internal_symbol(str_field(row, "instId")?)?;
            if !self.symbols.contains(&symbol) {
                continue;
            }
            let details = field(row, "details")?
                .as_array()
                .ok_or_else(|| IngestError::ParseError("'details' is not an array".to_string()))?;
            for detail in details {
                events.push(MarketEvent::Liquidation(Liquidation {
                    symbol: symbol.clone(),
                    side: parse_side(str_field(detail, "side")?)?,
                    price: decimal_field(detail, "bkPx")?,
                    quantity: decimal_field(detail, "sz")?,
                    event_time: i64_field(detail, "ts")?,
                }));
            }
        }
        Ok(events)
    }
}

impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn sequence_policy(&self) -> SequencePolicy {
        SequencePolicy::Chained
    }

    fn stream_url(&self, _symbols: &[String], _streams: &[StreamKind]) -> String {
        self.ws_endpoint.clone()
    }

    fn subscribe_messages(&self, symbols: &[String], streams: &[StreamKind]) -> Vec<String> {
        let mut args: Vec<Value> = symbols
            .iter()
            .flat_map(|s| {
                streams
                    .iter()
                    .filter_map(move |stream| self.channel_arg(s, stream).ok().flatten())
            })
            .collect();

        if streams.contains(&StreamKind::Liquidation) {
            args.push(json!({ "channel": "liquidation-orders", "instType": "SWAP" }));
        }

        if args.is_empty() {
            return Vec::new();
        }
        vec![Self::op_message("subscribe", args)]
    }

    fn parse_frame(&self, text: &str) -> Result<Frame> {
        if text == "pong" {
            return Ok(Frame::Pong);
        }

        let value: Value = serde_json::from_str(text)?;
        if value.get("event").is_some() {
            return Ok(Frame::Control);
        }

        let Some(arg) = value.get("arg") else {
            return Ok(Frame::Unrecognized);
        };
        let channel = str_field(arg, "channel")?;

        let events = if channel == "liquidation-orders" {
            self.parse_liquidations(&value)?
        } else {
            let symbol = internal_symbol(str_field(arg, "instId")?)?;
            match channel {
                "books" => Self::parse_books(&value, &symbol)?,
                "trades" => Self::parse_trades(&value, &symbol)?,
                c if c.starts_with("candle") => Self::parse_candles(&value, &symbol, c)?,
                _ => return Ok(Frame::Unrecognized),
            }
        };

        Ok(Frame::Events(events))
    }

    fn ping_payload(&self) -> PingPayload {
        PingPayload::Text("ping".to_string())
    }

    fn resync_request(&self, symbol: &str) -> ResyncRequest {
        let arg = json!({ "channel": "books", "instId": self.inst_id(symbol) });
        ResyncRequest::Resubscribe {
            unsubscribe: Self::op_message("unsubscribe", vec![arg.clone()]),
            subscribe: Self::op_message("subscribe", vec![arg]),
        }
    }
}

fn data_rows(value: &Value) -> Result<&Vec<Value>> {
    field(value, "data")?
        .as_array()
        .ok_or_else(|| IngestError::ParseError("'data' is not an array".to_string()))
}

fn u64_value(v: &Value, key: &str) -> Result<u64> {
    u64::try_from(i64_value(v)?)
        .map_err(|_| IngestError::ParseError(format!("field '{key}' is negative")))
}

fn parse_side(raw: &str) -> Result<TradeSide> {
    TradeSide::parse(raw).ok_or_else(|| IngestError::ParseError(format!("invalid side '{raw}'")))
}

/// Hour and longer bars are upper-case on OKX (`1H`, `1D`, `1W`)
fn to_okx_interval(interval: &str) -> Result<String> {
    if interval_millis(interval).is_none() {
        return Err(IngestError::ConfigError(format!("invalid kline interval '{interval}'")));
    }
    match interval.strip_suffix('m') {
        Some(minutes) => Ok(format!("{minutes}m")),
        None => Ok(interval.to_ascii_uppercase()),
    }
}

fn from_okx_interval(raw: &str) -> Result<String> {
    // UTC-anchored bars (`1Dutc`) map onto the plain interval
    let raw = raw.trim_end_matches("utc");
    let interval = match raw.strip_suffix('m') {
        Some(minutes) => format!("{minutes}m"),
        None => raw.to_ascii_lowercase(),
    };
    if interval_millis(&interval).is_none() {
        return Err(IngestError::ParseError(format!("unknown candle interval '{raw}'")));
    }
    Ok(interval)
}
