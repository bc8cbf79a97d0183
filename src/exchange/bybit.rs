//! Bybit v5 public stream adapter
//!
//! Topics: `orderbook.{depth}.{symbol}` (snapshot then deltas chained by `u`),
//! `publicTrade.{symbol}`, `kline.{interval}.{symbol}`,
//! `allLiquidation.{symbol}`. Keep-alive is the JSON `{"op":"ping"}`.

use serde_json::{json, Value};

use super::{
    field, i64_field, internal_symbol, parse_levels, str_field, u64_field, decimal_field,
    Exchange, ExchangeAdapter, Frame, PingPayload, ResyncRequest, StreamKind,
};
use crate::error::{IngestError, Result};
use crate::events::{
    interval_millis, BookSnapshot, DepthDiff, Kline, Liquidation, MarketEvent, Trade, TradeSide,
};
use crate::orderbook::SequencePolicy;

/// Book depth subscribed to
const BOOK_DEPTH: usize = 50;

/// Spot connections accept at most ten topics per subscribe request
const MAX_TOPICS_PER_REQUEST: usize = 10;

pub struct BybitAdapter {
    ws_endpoint: String,
}

impl BybitAdapter {
    pub fn new(ws_endpoint: &str) -> Self {
        Self {
            ws_endpoint: ws_endpoint.to_string(),
        }
    }

    fn topic(symbol: &str, stream: &StreamKind) -> Result<String> {
        Ok(match stream {
            StreamKind::Trade => format!("publicTrade.{symbol}"),
            StreamKind::Depth => format!("orderbook.{BOOK_DEPTH}.{symbol}"),
            StreamKind::Kline(interval) => format!("kline.{}.{symbol}", to_bybit_interval(interval)?),
            StreamKind::Liquidation => format!("allLiquidation.{symbol}"),
        })
    }

    fn op_message(op: &str, topics: &[String]) -> String {
        json!({ "op": op, "args": topics }).to_string()
    }

    fn parse_book(topic_symbol: &str, value: &Value) -> Result<MarketEvent> {
        let data = field(value, "data")?;
        let symbol = internal_symbol(data.get("s").and_then(Value::as_str).unwrap_or(topic_symbol))?;
        let event_time = i64_field(value, "ts")?;
        let update_id = u64_field(data, "u")?;
        let bids = parse_levels(field(data, "b")?)?;
        let asks = parse_levels(field(data, "a")?)?;

        match str_field(value, "type")? {
            "snapshot" => Ok(MarketEvent::BookSnapshot(BookSnapshot {
                symbol,
                event_time,
                sequence: update_id,
                bids,
                asks,
            })),
            "delta" => Ok(MarketEvent::DepthDiff(DepthDiff {
                symbol,
                event_time,
                first_seq: update_id,
                last_seq: update_id,
                prev_seq: None,
                bids,
                asks,
            })),
            other => Err(IngestError::ParseError(format!("unknown book message type '{other}'"))),
        }
    }

    fn parse_trades(value: &Value) -> Result<Vec<MarketEvent>> {
        data_rows(value)?
            .iter()
            .map(|row| {
                Ok(MarketEvent::Trade(Trade {
                    symbol: internal_symbol(str_field(row, "s")?)?,
                    trade_id: str_field(row, "i")?.to_string(),
                    price: decimal_field(row, "p")?,
                    quantity: decimal_field(row, "v")?,
                    side: parse_side(str_field(row, "S")?)?,
                    trade_time: i64_field(row, "T")?,
                }))
            })
            .collect()
    }

    fn parse_klines(topic_symbol: &str, value: &Value) -> Result<Vec<MarketEvent>> {
        let symbol = internal_symbol(topic_symbol)?;
        data_rows(value)?
            .iter()
            .map(|row| {
                Ok(MarketEvent::Kline(Kline {
                    symbol: symbol.clone(),
                    interval: from_bybit_interval(str_field(row, "interval")?)?,
                    open_time: i64_field(row, "start")?,
                    close_time: i64_field(row, "end")?,
                    open: decimal_field(row, "open")?,
                    high: decimal_field(row, "high")?,
                    low: decimal_field(row, "low")?,
                    close: decimal_field(row, "close")?,
                    volume: decimal_field(row, "volume")?,
                    trade_count: None,
                    is_closed: field(row, "confirm")?.as_bool().unwrap_or(false),
                }))
            })
            .collect()
    }

    fn parse_liquidations(value: &Value) -> Result<Vec<MarketEvent>> {
        data_rows(value)?
            .iter()
            .map(|row| {
                Ok(MarketEvent::Liquidation(Liquidation {
                    symbol: internal_symbol(str_field(row, "s")?)?,
                    side: parse_side(str_field(row, "S")?)?,
                    price: decimal_field(row, "p")?,
                    quantity: decimal_field(row, "v")?,
                    event_time: i64_field(row, "T")?,
                }))
            })
            .collect()
    }
}

impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn sequence_policy(&self) -> SequencePolicy {
        SequencePolicy::Consecutive
    }

    fn stream_url(&self, _symbols: &[String], _streams: &[StreamKind]) -> String {
        self.ws_endpoint.clone()
    }

    fn subscribe_messages(&self, symbols: &[String], streams: &[StreamKind]) -> Vec<String> {
        let topics: Vec<String> = symbols
            .iter()
            .flat_map(|s| streams.iter().filter_map(move |stream| Self::topic(s, stream).ok()))
            .collect();

        topics
            .chunks(MAX_TOPICS_PER_REQUEST)
            .map(|chunk| Self::op_message("subscribe", chunk))
            .collect()
    }

    fn parse_frame(&self, text: &str) -> Result<Frame> {
        let value: Value = serde_json::from_str(text)?;

        // {"op":"pong",...} on linear, {"op":"ping","ret_msg":"pong",...} on spot
        let op = value.get("op").and_then(Value::as_str);
        let ret_msg = value.get("ret_msg").and_then(Value::as_str);
        if op == Some("pong") || ret_msg == Some("pong") {
            return Ok(Frame::Pong);
        }
        if op.is_some() || value.get("success").is_some() {
            return Ok(Frame::Control);
        }

        let Some(topic) = value.get("topic").and_then(Value::as_str) else {
            return Ok(Frame::Unrecognized);
        };
        let (channel, topic_symbol) = match topic.split_once('.') {
            Some((channel, rest)) => (channel, rest.rsplit('.').next().unwrap_or(rest)),
            None => return Ok(Frame::Unrecognized),
        };

        let events = match channel {
            "orderbook" => vec![Self::parse_book(topic_symbol, &value)?],
            "publicTrade" => Self::parse_trades(&value)?,
            "kline" => Self::parse_klines(topic_symbol, &value)?,
            "allLiquidation" | "liquidation" => Self::parse_liquidations(&value)?,
            _ => return Ok(Frame::Unrecognized),
        };

        Ok(Frame::Events(events))
    }

    fn ping_payload(&self) -> PingPayload {
        PingPayload::Text(json!({ "op": "ping" }).to_string())
    }

    fn resync_request(&self, symbol: &str) -> ResyncRequest {
        let topic = vec![format!("orderbook.{BOOK_DEPTH}.{symbol}")];
        ResyncRequest::Resubscribe {
            unsubscribe: Self::op_message("unsubscribe", &topic),
            subscribe: Self::op_message("subscribe", &topic),
        }
    }
}

fn data_rows(value: &Value) -> Result<&Vec<Value>> {
    field(value, "data")?
        .as_array()
        .ok_or_else(|| IngestError::ParseError("'data' is not an array".to_string()))
}

fn parse_side(raw: &str) -> Result<TradeSide> {
    TradeSide::parse(raw).ok_or_else(|| IngestError::ParseError(format!("invalid side '{raw}'")))
}

/// `1m` -> `1`, `1h` -> `60`, `1d` -> `D`, `1w` -> `W`
fn to_bybit_interval(interval: &str) -> Result<String> {
    match interval {
        "1d" => return Ok("D".to_string()),
        "1w" => return Ok("W".to_string()),
        _ => {}
    }
    let ms = interval_millis(interval)
        .filter(|ms| ms % 60_000 == 0 && *ms < 86_400_000)
        .ok_or_else(|| IngestError::ConfigError(format!("interval '{interval}' not offered by bybit")))?;
    Ok((ms / 60_000).to_string())
}

fn from_bybit_interval(raw: &str) -> Result<String> {
    match raw {
        "D" => Ok("1d".to_string()),
        "W" => Ok("1w".to_string()),
        minutes => {
            let minutes: i64 = minutes
                .parse()
                .map_err(|_| IngestError::ParseError(format!("invalid kline interval '{raw}'")))?;
            if minutes % 60 == 0 {
                Ok(format!("{}h", minutes / 60))
            } else {
                Ok(format!("{minutes}m"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PriceLevel;
    use rust_decimal_macros::dec;

    fn adapter() -> BybitAdapter {
        BybitAdapter::new("wss://stream.bybit.com/v5/public/spot")
    }

    #[test]
    fn test_subscribe_messages_are_chunked() {
        let symbols: Vec<String> = ["BTCUSDT", "ETHUSDT", "SOLUSDT"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let streams = vec![
            StreamKind::Trade,
            StreamKind::Depth,
            StreamKind::Kline("1m".to_string()),
            StreamKind::Liquidation,
        ];
        let messages = adapter().subscribe_messages(&symbols, &streams);
        assert_eq!(messages.len(), 2);

        let first: Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(first["op"], "subscribe");
        assert_eq!(first["args"].as_array().unwrap().len(), 10);
        assert_eq!(first["args"][0], "publicTrade.BTCUSDT");
        assert_eq!(first["args"][1], "orderbook.50.BTCUSDT");
        assert_eq!(first["args"][2], "kline.1.BTCUSDT");
    }

    #[test]
    fn test_parse_book_snapshot_and_delta() {
        let snapshot = r#"{"topic":"orderbook.50.BTCUSDT","type":"snapshot","ts":1672304484978,
            "data":{"s":"BTCUSDT","b":[["16493.50","0.006"]],"a":[["16611.00","0.029"]],"u":18521288,"seq":7961638724}}"#;
        let Frame::Events(events) = adapter().parse_frame(snapshot).unwrap() else {
            panic!("Expected events");
        };
        let MarketEvent::BookSnapshot(book) = &events[0] else {
            panic!("Expected BookSnapshot");
        };
        assert_eq!(book.sequence, 18521288);
        assert_eq!(book.bids, vec![PriceLevel::new(dec!(16493.50), dec!(0.006))]);

        let delta = r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","ts":1672304484979,
            "data":{"s":"BTCUSDT","b":[["16493.50","0"]],"a":[],"u":18521289,"seq":7961638725}}"#;
        let Frame::Events(events) = adapter().parse_frame(delta).unwrap() else {
            panic!("Expected events");
        };
        let MarketEvent::DepthDiff(diff) = &events[0] else {
            panic!("Expected DepthDiff");
        };
        assert_eq!((diff.first_seq, diff.last_seq), (18521289, 18521289));
        assert_eq!(diff.bids[0].quantity, dec!(0));
    }

    #[test]
    fn test_parse_trades() {
        let raw = r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1672304486868,"data":[
            {"T":1672304486865,"s":"BTCUSDT","S":"Buy","v":"0.001","p":"16578.50","L":"PlusTick","i":"20f43950","BT":false},
            {"T":1672304486866,"s":"BTCUSDT","S":"Sell","v":"0.002","p":"16578.00","L":"MinusTick","i":"20f43951","BT":false}]}"#;
        let Frame::Events(events) = adapter().parse_frame(raw).unwrap() else {
            panic!("Expected events");
        };
        assert_eq!(events.len(), 2);
        let MarketEvent::Trade(trade) = &events[1] else {
            panic!("Expected Trade");
        };
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.trade_id, "20f43951");
        assert_eq!(trade.price, dec!(16578.00));
    }

    #[test]
    fn test_parse_kline() {
        let raw = r#"{"topic":"kline.60.BTCUSDT","type":"snapshot","ts":1672324988882,"data":[
            {"start":1672322400000,"end":1672325999999,"interval":"60","open":"16649.5","close":"16677",
             "high":"16677","low":"16608","volume":"2.081","turnover":"34666.4005","confirm":false,"timestamp":1672324988882}]}"#;
        let Frame::Events(events) = adapter().parse_frame(raw).unwrap() else {
            panic!("Expected events");
        };
        let MarketEvent::Kline(kline) = &events[0] else {
            panic!("Expected Kline");
        };
        assert_eq!(kline.symbol, "BTCUSDT");
        assert_eq!(kline.interval, "1h");
        assert_eq!(kline.close, dec!(16677));
        assert!(!kline.is_closed);
    }

    #[test]
    fn test_parse_liquidation() {
        let raw = r#"{"topic":"allLiquidation.ROSEUSDT","type":"snapshot","ts":1739502303204,
            "data":[{"T":1739502302929,"s":"ROSEUSDT","S":"Sell","v":"20000","p":"0.04499"}]}"#;
        let Frame::Events(events) = adapter().parse_frame(raw).unwrap() else {
            panic!("Expected events");
        };
        let MarketEvent::Liquidation(liq) = &events[0] else {
            panic!("Expected Liquidation");
        };
        assert_eq!(liq.symbol, "ROSEUSDT");
        assert_eq!(liq.price, dec!(0.04499));
    }

    #[test]
    fn test_control_frames() {
        let a = adapter();
        assert_eq!(
            a.parse_frame(r#"{"success":true,"ret_msg":"pong","conn_id":"x","op":"ping"}"#)
                .unwrap(),
            Frame::Pong
        );
        assert_eq!(
            a.parse_frame(r#"{"success":true,"ret_msg":"","conn_id":"x","op":"subscribe"}"#)
                .unwrap(),
            Frame::Control
        );
        assert_eq!(
            a.parse_frame(r#"{"topic":"tickers.BTCUSDT","data":{}}"#).unwrap(),
            Frame::Unrecognized
        );
    }

    #[test]
    fn test_resync_resubscribes_book() {
        let ResyncRequest::Resubscribe { unsubscribe, subscribe } = adapter().resync_request("BTCUSDT")
        else {
            panic!("Expected resubscribe");
        };
        assert_eq!(unsubscribe, r#"{"args":["orderbook.50.BTCUSDT"],"op":"unsubscribe"}"#);
        assert_eq!(subscribe, r#"{"args":["orderbook.50.BTCUSDT"],"op":"subscribe"}"#);
    }

    #[test]
    fn test_interval_mapping() {
        assert_eq!(to_bybit_interval("1m").unwrap(), "1");
        assert_eq!(to_bybit_interval("4h").unwrap(), "240");
        assert_eq!(to_bybit_interval("1d").unwrap(), "D");
        assert!(to_bybit_interval("30s").is_err());
        assert_eq!(from_bybit_interval("240").unwrap(), "4h");
        assert_eq!(from_bybit_interval("15").unwrap(), "15m");
    }
}
