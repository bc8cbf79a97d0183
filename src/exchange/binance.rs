//! Binance adapter
//!
//! Subscribes through the combined-stream URL and keeps books in sync with the
//! REST depth snapshot, following Binance's "manage a local order book" rules.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;
use tracing::info;

use super::{
    internal_symbol, Exchange, ExchangeAdapter, Frame, PingPayload, ResyncRequest, StreamKind,
};
use crate::error::Result;
use crate::events::{
    BookSnapshot, DepthDiff, Kline, Liquidation, MarketEvent, PriceLevel, Trade, TradeSide,
};
use crate::orderbook::SequencePolicy;

/// Limits accepted by the REST depth endpoint
const SNAPSHOT_LIMITS: [usize; 8] = [5, 10, 20, 50, 100, 500, 1000, 5000];

/// Binance depth update message
#[derive(Debug, Clone, Deserialize)]
struct DepthUpdate {
    /// Event time (milliseconds)
    #[serde(rename = "E")]
    event_time: i64,

    #[serde(rename = "s")]
    symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    final_update_id: u64,

    /// Final update ID of the previous event (futures only)
    #[serde(rename = "pu", default)]
    previous_final_update_id: Option<u64>,

    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    bids: Vec<PriceLevel>,

    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    asks: Vec<PriceLevel>,
}

/// Binance trade message
#[derive(Debug, Clone, Deserialize)]
struct TradeMessage {
    #[serde(rename = "s")]
    symbol: String,

    #[serde(rename = "t")]
    trade_id: u64,

    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    price: Decimal,

    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    quantity: Decimal,

    #[serde(rename = "T")]
    trade_time: i64,

    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct KlineMessage {
    #[serde(rename = "s")]
    symbol: String,

    #[serde(rename = "k")]
    kline: KlineBody,
}

#[derive(Debug, Clone, Deserialize)]
struct KlineBody {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o", deserialize_with = "deserialize_decimal")]
    open: Decimal,
    #[serde(rename = "h", deserialize_with = "deserialize_decimal")]
    high: Decimal,
    #[serde(rename = "l", deserialize_with = "deserialize_decimal")]
    low: Decimal,
    #[serde(rename = "c", deserialize_with = "deserialize_decimal")]
    close: Decimal,
    #[serde(rename = "v", deserialize_with = "deserialize_decimal")]
    volume: Decimal,
    #[serde(rename = "n")]
    trade_count: u64,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Futures liquidation (`forceOrder`) message
#[derive(Debug, Clone, Deserialize)]
struct ForceOrderMessage {
    #[serde(rename = "o")]
    order: ForceOrder,
}

#[derive(Debug, Clone, Deserialize)]
struct ForceOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    quantity: Decimal,
    #[serde(rename = "ap", deserialize_with = "deserialize_decimal")]
    average_price: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
struct RestSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,

    /// Message time, futures only
    #[serde(rename = "E", default)]
    event_time: Option<i64>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    bids: Vec<PriceLevel>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    asks: Vec<PriceLevel>,
}

pub struct BinanceAdapter {
    ws_endpoint: String,
    rest_endpoint: String,
}

impl BinanceAdapter {
    pub fn new(ws_endpoint: &str, rest_endpoint: &str) -> Self {
        Self {
            ws_endpoint: ws_endpoint.trim_end_matches('/').to_string(),
            rest_endpoint: rest_endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn channel(stream: &StreamKind) -> String {
        match stream {
            StreamKind::Trade => "trade".to_string(),
            StreamKind::Depth => "depth@100ms".to_string(),
            StreamKind::Kline(interval) => format!("kline_{interval}"),
            StreamKind::Liquidation => "forceOrder".to_string(),
        }
    }

    fn parse_event(data: Value) -> Result<Frame> {
        let event_type = data.get("e").and_then(Value::as_str).map(str::to_string);

        let event = match event_type.as_deref() {
            Some("depthUpdate") => {
                let depth: DepthUpdate = serde_json::from_value(data)?;
                MarketEvent::DepthDiff(DepthDiff {
                    symbol: internal_symbol(&depth.symbol)?,
                    event_time: depth.event_time,
                    // futures chain diffs with `pu`; continuing from `pu` is the
                    // same as covering `pu + 1`
                    first_seq: depth
                        .previous_final_update_id
                        .map(|pu| pu + 1)
                        .unwrap_or(depth.first_update_id),
                    last_seq: depth.final_update_id,
                    prev_seq: depth.previous_final_update_id,
                    bids: depth.bids,
                    asks: depth.asks,
                })
            }
            Some("trade") => {
                let trade: TradeMessage = serde_json::from_value(data)?;
                MarketEvent::Trade(Trade {
                    symbol: internal_symbol(&trade.symbol)?,
                    trade_id: trade.trade_id.to_string(),
                    price: trade.price,
                    quantity: trade.quantity,
                    // buyer is maker: the aggressor sold
                    side: if trade.is_buyer_maker {
                        TradeSide::Sell
                    } else {
                        TradeSide::Buy
                    },
                    trade_time: trade.trade_time,
                })
            }
            Some("kline") => {
                let msg: KlineMessage = serde_json::from_value(data)?;
                let k = msg.kline;
                MarketEvent::Kline(Kline {
                    symbol: internal_symbol(&msg.symbol)?,
                    interval: k.interval,
                    open_time: k.open_time,
                    close_time: k.close_time,
                    open: k.open,
                    high: k.high,
                    low: k.low,
                    close: k.close,
                    volume: k.volume,
                    trade_count: Some(k.trade_count),
                    is_closed: k.is_closed,
                })
            }
            Some("forceOrder") => {
                let msg: ForceOrderMessage = serde_json::from_value(data)?;
                let o = msg.order;
                let side = TradeSide::parse(&o.side).ok_or_else(|| {
                    crate::error::IngestError::ParseError(format!("invalid side '{}'", o.side))
                })?;
                MarketEvent::Liquidation(Liquidation {
                    symbol: internal_symbol(&o.symbol)?,
                    side,
                    price: o.average_price,
                    quantity: o.quantity,
                    event_time: o.trade_time,
                })
            }
            _ => return Ok(Frame::Unrecognized),
        };

        Ok(Frame::Events(vec![event]))
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn sequence_policy(&self) -> SequencePolicy {
        SequencePolicy::Range
    }

    fn stream_url(&self, symbols: &[String], streams: &[StreamKind]) -> String {
        let channels: Vec<String> = symbols
            .iter()
            .flat_map(|s| {
                let s_lower = s.to_lowercase();
                streams
                    .iter()
                    .map(move |stream| format!("{}@{}", s_lower, Self::channel(stream)))
            })
            .collect();

        format!("{}/stream?streams={}", self.ws_endpoint, channels.join("/"))
    }

    fn subscribe_messages(&self, _symbols: &[String], _streams: &[StreamKind]) -> Vec<String> {
        // the combined-stream URL already carries the subscription
        Vec::new()
    }

    fn parse_frame(&self, text: &str) -> Result<Frame> {
        let value: Value = serde_json::from_str(text)?;

        // subscription acks: {"result": null, "id": 1}
        if value.get("id").is_some() && value.get("result").is_some() {
            return Ok(Frame::Control);
        }

        // combined stream wrapper: {"stream": "...", "data": {...}}
        let data = match value {
            Value::Object(mut map) if map.contains_key("stream") => {
                map.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };

        Self::parse_event(data)
    }

    fn ping_payload(&self) -> PingPayload {
        PingPayload::WebSocketPing
    }

    fn resync_request(&self, _symbol: &str) -> ResyncRequest {
        ResyncRequest::FetchSnapshot
    }

    async fn fetch_snapshot(
        &self,
        http: &reqwest::Client,
        symbol: &str,
        depth: usize,
    ) -> Result<BookSnapshot> {
        let url = format!(
            "{}/depth?symbol={}&limit={}",
            self.rest_endpoint,
            symbol,
            snapshot_limit(depth)
        );

        info!(symbol = %symbol, url = %url, "Fetching order book snapshot");

        let response = http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<RestSnapshot>()
            .await?;

        Ok(BookSnapshot {
            symbol: symbol.to_string(),
            event_time: response
                .event_time
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            sequence: response.last_update_id,
            bids: response.bids,
            asks: response.asks,
        })
    }
}

/// Smallest accepted REST limit covering `depth` levels
fn snapshot_limit(depth: usize) -> usize {
    SNAPSHOT_LIMITS
        .into_iter()
        .find(|limit| *limit >= depth)
        .unwrap_or(SNAPSHOT_LIMITS[SNAPSHOT_LIMITS.len() - 1])
}

/// Custom deserializer for Decimal from string
fn deserialize_decimal<'de, D>(deserializer: D) -> std::result::Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

/// Custom deserializer for price levels from array of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(PriceLevel {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                quantity: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new("wss://stream.binance.com:9443/", "https://api.binance.com/api/v3")
    }

    #[test]
    fn test_stream_url() {
        let url = adapter().stream_url(
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            &[StreamKind::Depth, StreamKind::Trade],
        );
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@depth@100ms/btcusdt@trade/ethusdt@depth@100ms/ethusdt@trade"
        );
    }

    #[test]
    fn test_parse_depth_update() {
        let raw = r#"{
            "stream": "btcusdt@depth@100ms",
            "data": {
                "e": "depthUpdate",
                "E": 1672531200000,
                "s": "BTCUSDT",
                "U": 100,
                "u": 105,
                "b": [["50000.00", "1.5"], ["49999.00", "2.0"]],
                "a": [["50001.00", "1.0"], ["50002.00", "0.5"]]
            }
        }"#;

        let frame = adapter().parse_frame(raw).unwrap();
        let Frame::Events(events) = frame else {
            panic!("Expected events, got {frame:?}");
        };
        let MarketEvent::DepthDiff(depth) = &events[0] else {
            panic!("Expected DepthDiff");
        };
        assert_eq!(depth.symbol, "BTCUSDT");
        assert_eq!((depth.first_seq, depth.last_seq), (100, 105));
        assert_eq!(depth.prev_seq, None);
        assert_eq!(depth.bids.len(), 2);
        assert_eq!(depth.asks[1], PriceLevel::new(dec!(50002.00), dec!(0.5)));
    }

    #[test]
    fn test_parse_futures_depth_uses_previous_id() {
        let raw = r#"{"e":"depthUpdate","E":1,"T":1,"s":"BTCUSDT","U":200,"u":210,"pu":190,"b":[],"a":[]}"#;
        let Frame::Events(events) = adapter().parse_frame(raw).unwrap() else {
            panic!("Expected events");
        };
        let MarketEvent::DepthDiff(depth) = &events[0] else {
            panic!("Expected DepthDiff");
        };
        assert_eq!(depth.first_seq, 191);
        assert_eq!(depth.prev_seq, Some(190));
    }

    #[test]
    fn test_parse_trade() {
        let raw = r#"{
            "e": "trade",
            "E": 1672531200000,
            "s": "BTCUSDT",
            "t": 12345,
            "p": "50000.50",
            "q": "0.5",
            "T": 1672531200000,
            "m": true,
            "M": true
        }"#;

        let Frame::Events(events) = adapter().parse_frame(raw).unwrap() else {
            panic!("Expected events");
        };
        let MarketEvent::Trade(trade) = &events[0] else {
            panic!("Expected Trade");
        };
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.trade_id, "12345");
        assert_eq!(trade.price, dec!(50000.50));
        assert_eq!(trade.side, TradeSide::Sell);
    }

    #[test]
    fn test_parse_kline() {
        let raw = r#"{"stream":"ethbtc@kline_1m","data":{"e":"kline","E":1,"s":"ETHBTC","k":{
            "t":1672531200000,"T":1672531259999,"s":"ETHBTC","i":"1m","f":1,"L":2,
            "o":"0.0010","c":"0.0020","h":"0.0025","l":"0.0015","v":"1000","n":100,
            "x":false,"q":"1.0","V":"500","Q":"0.5","B":"0"}}}"#;

        let Frame::Events(events) = adapter().parse_frame(raw).unwrap() else {
            panic!("Expected events");
        };
        let MarketEvent::Kline(kline) = &events[0] else {
            panic!("Expected Kline");
        };
        assert_eq!(kline.symbol, "ETHBTC");
        assert_eq!(kline.interval, "1m");
        assert_eq!(kline.high, dec!(0.0025));
        assert_eq!(kline.trade_count, Some(100));
        assert!(!kline.is_closed);
    }

    #[test]
    fn test_parse_force_order() {
        let raw = r#"{"e":"forceOrder","E":1568014460893,"o":{"s":"BTCUSDT","S":"SELL","o":"LIMIT",
            "f":"IOC","q":"0.014","p":"9910","ap":"9910","X":"FILLED","l":"0.014","z":"0.014",
            "T":1568014460893}}"#;

        let Frame::Events(events) = adapter().parse_frame(raw).unwrap() else {
            panic!("Expected events");
        };
        let MarketEvent::Liquidation(liq) = &events[0] else {
            panic!("Expected Liquidation");
        };
        assert_eq!(liq.side, TradeSide::Sell);
        assert_eq!(liq.quantity, dec!(0.014));
        assert_eq!(liq.event_time, 1568014460893);
    }

    #[test]
    fn test_control_and_unknown_frames() {
        let a = adapter();
        assert_eq!(a.parse_frame(r#"{"result":null,"id":1}"#).unwrap(), Frame::Control);
        assert_eq!(
            a.parse_frame(r#"{"e":"24hrTicker","s":"BTCUSDT"}"#).unwrap(),
            Frame::Unrecognized
        );
        assert!(a.parse_frame("not json").is_err());
        // malformed known event is a protocol fault
        assert!(a.parse_frame(r#"{"e":"trade","s":"BTCUSDT"}"#).is_err());
    }

    #[test]
    fn test_snapshot_limit() {
        assert_eq!(snapshot_limit(20), 20);
        assert_eq!(snapshot_limit(25), 50);
        assert_eq!(snapshot_limit(10_000), 5000);
    }
}
