//! Durable queue between ingestion and persistence
//!
//! One FIFO list per (exchange, kind) in an external store, bounded by a
//! hard max depth with drop-oldest eviction. Entries are MessagePack encoded
//! [`QueueMessage`]s. The latest order book snapshot of every symbol is also
//! kept in a hash with a short TTL for external readers.

mod backend;
mod redis_backend;

pub use backend::{MemoryBackend, PushOutcome, QueueBackend};
pub use redis_backend::RedisBackend;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{IngestError, Result};
use crate::events::{BookSnapshot, DepthDiff, Kline, Liquidation, MarketEvent, Trade};
use crate::exchange::Exchange;
use crate::metrics::Metrics;

/// URL scheme selecting the in-process backend
pub const MEMORY_URL: &str = "memory://";

/// Latest snapshot hashes expire after ten minutes
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Trade,
    OrderbookUpdate,
    OrderbookSnapshot,
    Kline,
    Liquidation,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Trade,
        MessageKind::OrderbookUpdate,
        MessageKind::OrderbookSnapshot,
        MessageKind::Kline,
        MessageKind::Liquidation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Trade => "trade",
            MessageKind::OrderbookUpdate => "orderbook_update",
            MessageKind::OrderbookSnapshot => "orderbook_snapshot",
            MessageKind::Kline => "kline",
            MessageKind::Liquidation => "liquidation",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        MessageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| IngestError::ParseError(format!("unknown message kind '{s}'")))
    }
}

/// Typed queue payload; the variant always agrees with the envelope kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Trade(Trade),
    OrderbookUpdate(DepthDiff),
    OrderbookSnapshot(BookSnapshot),
    Kline(Kline),
    Liquidation(Liquidation),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Trade(_) => MessageKind::Trade,
            Payload::OrderbookUpdate(_) => MessageKind::OrderbookUpdate,
            Payload::OrderbookSnapshot(_) => MessageKind::OrderbookSnapshot,
            Payload::Kline(_) => MessageKind::Kline,
            Payload::Liquidation(_) => MessageKind::Liquidation,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Payload::Trade(t) => &t.symbol,
            Payload::OrderbookUpdate(d) => &d.symbol,
            Payload::OrderbookSnapshot(s) => &s.symbol,
            Payload::Kline(k) => &k.symbol,
            Payload::Liquidation(l) => &l.symbol,
        }
    }
}

impl From<MarketEvent> for Payload {
    fn from(event: MarketEvent) -> Self {
        match event {
            MarketEvent::Trade(t) => Payload::Trade(t),
            MarketEvent::DepthDiff(d) => Payload::OrderbookUpdate(d),
            MarketEvent::BookSnapshot(s) => Payload::OrderbookSnapshot(s),
            MarketEvent::Kline(k) => Payload::Kline(k),
            MarketEvent::Liquidation(l) => Payload::Liquidation(l),
        }
    }
}

/// Immutable queue envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    kind: MessageKind,
    exchange: Exchange,
    payload: Payload,
    received_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(exchange: Exchange, payload: Payload) -> Self {
        Self::received_at(exchange, payload, Utc::now())
    }

    pub fn received_at(exchange: Exchange, payload: Payload, received_at: DateTime<Utc>) -> Self {
        Self {
            kind: payload.kind(),
            exchange,
            payload,
            received_at,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn received(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: QueueMessage = rmp_serde::from_slice(bytes)?;
        if message.kind != message.payload.kind() {
            return Err(IngestError::SerializationError(format!(
                "envelope kind {} does not match {} payload",
                message.kind,
                message.payload.kind()
            )));
        }
        Ok(message)
    }
}

/// Bounded per-(exchange, kind) FIFO queues over a [`QueueBackend`]
pub struct DurableQueue {
    backend: Arc<dyn QueueBackend>,
    prefix: String,
    max_depth: usize,
    metrics: Arc<Metrics>,
}

impl DurableQueue {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        prefix: &str,
        max_depth: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            prefix: prefix.to_string(),
            max_depth,
            metrics,
        }
    }

    /// Open the backend named by `config.url`
    pub async fn connect(config: &QueueConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let backend: Arc<dyn QueueBackend> = if config.url == MEMORY_URL {
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(RedisBackend::connect(&config.url).await?)
        };
        Ok(Self::new(backend, &config.key_prefix, config.max_depth, metrics))
    }

    pub fn queue_key(&self, exchange: Exchange, kind: MessageKind) -> String {
        format!("{}:queue:{}:{}", self.prefix, exchange, kind)
    }

    pub fn snapshot_key(&self, symbol: &str) -> String {
        format!("{}:orderbook:{}", self.prefix, symbol)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub async fn push(&self, message: &QueueMessage) -> Result<()> {
        let entry = message.encode()?;
        self.push_entries(message.exchange, message.kind, vec![entry])
            .await
    }

    /// Push many messages; each target list is appended atomically
    pub async fn push_batch(&self, messages: &[QueueMessage]) -> Result<()> {
        let mut groups: BTreeMap<(Exchange, MessageKind), Vec<Vec<u8>>> = BTreeMap::new();
        for message in messages {
            groups
                .entry((message.exchange, message.kind))
                .or_default()
                .push(message.encode()?);
        }
        for ((exchange, kind), entries) in groups {
            self.push_entries(exchange, kind, entries).await?;
        }
        Ok(())
    }

    async fn push_entries(
        &self,
        exchange: Exchange,
        kind: MessageKind,
        entries: Vec<Vec<u8>>,
    ) -> Result<()> {
        let count = entries.len();
        let key = self.queue_key(exchange, kind);
        let outcome = self.backend.push(&key, entries, self.max_depth).await?;

        if outcome.evicted > 0 {
            warn!(
                exchange = %exchange,
                kind = %kind,
                evicted = outcome.evicted,
                max_depth = self.max_depth,
                "Queue full, dropped oldest entries"
            );
            self.metrics.record_evicted(exchange, kind, outcome.evicted);
        }
        self.metrics.record_queued(exchange, kind, count);
        self.metrics.set_queue_depth(exchange, kind, outcome.len);
        Ok(())
    }

    /// Remove and return up to `count` of the oldest entries. Entries that
    /// fail to decode are dropped.
    pub async fn pop(
        &self,
        exchange: Exchange,
        kind: MessageKind,
        count: usize,
    ) -> Result<Vec<QueueMessage>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let key = self.queue_key(exchange, kind);
        let entries = self.backend.pop(&key, count).await?;

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            match QueueMessage::decode(&entry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(key = %key, error = %e, bytes = entry.len(), "Skipping undecodable queue entry");
                    self.metrics.record_error(exchange.as_str(), "decode");
                }
            }
        }
        debug!(key = %key, popped = messages.len(), "Popped queue entries");
        Ok(messages)
    }

    pub async fn size(&self, exchange: Exchange, kind: MessageKind) -> Result<usize> {
        let len = self.backend.len(&self.queue_key(exchange, kind)).await?;
        self.metrics.set_queue_depth(exchange, kind, len);
        Ok(len)
    }

    /// Depth of every list, keyed by (exchange, kind)
    pub async fn size_all(&self) -> Result<BTreeMap<(Exchange, MessageKind), usize>> {
        let mut depths = BTreeMap::new();
        for exchange in Exchange::ALL {
            for kind in MessageKind::ALL {
                let len = self.backend.len(&self.queue_key(exchange, kind)).await?;
                depths.insert((exchange, kind), len);
            }
        }
        self.metrics.set_queue_depths(&depths);
        Ok(depths)
    }

    pub async fn clear(&self, exchange: Exchange, kind: MessageKind) -> Result<()> {
        self.backend.delete(&self.queue_key(exchange, kind)).await?;
        self.metrics.set_queue_depth(exchange, kind, 0);
        Ok(())
    }

    /// Overwrite the latest snapshot hash of `snapshot.symbol`
    pub async fn store_orderbook_snapshot(
        &self,
        exchange: Exchange,
        snapshot: &BookSnapshot,
    ) -> Result<()> {
        let fields = vec![
            ("data".to_string(), serde_json::to_vec(snapshot)?),
            (
                "timestamp".to_string(),
                Utc::now().timestamp_millis().to_string().into_bytes(),
            ),
            ("exchange".to_string(), exchange.as_str().as_bytes().to_vec()),
        ];
        self.backend
            .set_hash(&self.snapshot_key(&snapshot.symbol), fields, SNAPSHOT_TTL)
            .await
    }

    /// Latest snapshot written by any exchange for `symbol`
    pub async fn latest_orderbook_snapshot(&self, symbol: &str) -> Result<Option<BookSnapshot>> {
        let fields = self.backend.get_hash(&self.snapshot_key(symbol)).await?;
        match fields.get("data") {
            Some(data) => Ok(Some(serde_json::from_slice(data)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PriceLevel, TradeSide};
    use rust_decimal_macros::dec;

    fn queue(max_depth: usize) -> DurableQueue {
        DurableQueue::new(
            Arc::new(MemoryBackend::new()),
            "test",
            max_depth,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    fn trade(id: u64) -> QueueMessage {
        QueueMessage::new(
            Exchange::Binance,
            Payload::Trade(Trade {
                symbol: "BTCUSDT".to_string(),
                trade_id: id.to_string(),
                price: dec!(50000.5),
                quantity: dec!(0.1),
                side: TradeSide::Buy,
                trade_time: 1_700_000_000_000 + id as i64,
            }),
        )
    }

    fn trade_ids(messages: &[QueueMessage]) -> Vec<String> {
        messages
            .iter()
            .map(|m| match m.payload() {
                Payload::Trade(t) => t.trade_id.clone(),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_message_encoding() {
        let message = trade(1);
        let decoded = QueueMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), MessageKind::Trade);
        assert!(QueueMessage::decode(b"\xc1garbage").is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(MessageKind::OrderbookSnapshot.to_string(), "orderbook_snapshot");
        assert_eq!("kline".parse::<MessageKind>().unwrap(), MessageKind::Kline);
        assert!("ticker".parse::<MessageKind>().is_err());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = queue(100);
        for id in 1..=5 {
            q.push(&trade(id)).await.unwrap();
        }
        let first = q.pop(Exchange::Binance, MessageKind::Trade, 3).await.unwrap();
        assert_eq!(trade_ids(&first), vec!["1", "2", "3"]);
        let rest = q.pop(Exchange::Binance, MessageKind::Trade, 10).await.unwrap();
        assert_eq!(trade_ids(&rest), vec!["4", "5"]);
        assert_eq!(q.size(Exchange::Binance, MessageKind::Trade).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drop_oldest_eviction() {
        let q = queue(3);
        for id in 1..=5 {
            q.push(&trade(id)).await.unwrap();
        }
        assert_eq!(q.size(Exchange::Binance, MessageKind::Trade).await.unwrap(), 3);
        assert_eq!(q.metrics.evicted(Exchange::Binance, MessageKind::Trade), 2);

        let messages = q.pop(Exchange::Binance, MessageKind::Trade, 10).await.unwrap();
        assert_eq!(trade_ids(&messages), vec!["3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_push_batch_groups_by_list() {
        let q = queue(2);
        let mut batch: Vec<QueueMessage> = (1..=3).map(trade).collect();
        batch.push(QueueMessage::new(
            Exchange::Okx,
            Payload::Liquidation(Liquidation {
                symbol: "BTCUSDT".to_string(),
                side: TradeSide::Sell,
                price: dec!(49000),
                quantity: dec!(2),
                event_time: 1,
            }),
        ));
        q.push_batch(&batch).await.unwrap();

        let depths = q.size_all().await.unwrap();
        assert_eq!(depths[&(Exchange::Binance, MessageKind::Trade)], 2);
        assert_eq!(depths[&(Exchange::Okx, MessageKind::Liquidation)], 1);
        assert_eq!(depths[&(Exchange::Bybit, MessageKind::Kline)], 0);
        assert_eq!(depths.len(), Exchange::ALL.len() * MessageKind::ALL.len());
    }

    #[tokio::test]
    async fn test_undecodable_entries_are_skipped() {
        let backend = Arc::new(MemoryBackend::new());
        let q = DurableQueue::new(backend.clone(), "test", 10, Arc::new(Metrics::new().unwrap()));
        q.push(&trade(1)).await.unwrap();
        backend
            .push(&q.queue_key(Exchange::Binance, MessageKind::Trade), vec![b"junk".to_vec()], 10)
            .await
            .unwrap();
        q.push(&trade(2)).await.unwrap();

        let messages = q.pop(Exchange::Binance, MessageKind::Trade, 10).await.unwrap();
        assert_eq!(trade_ids(&messages), vec!["1", "2"]);
        assert_eq!(q.metrics.errors("binance", "decode"), 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let q = queue(10);
        q.push(&trade(1)).await.unwrap();
        q.clear(Exchange::Binance, MessageKind::Trade).await.unwrap();
        assert_eq!(q.size(Exchange::Binance, MessageKind::Trade).await.unwrap(), 0);
        assert!(q.pop(Exchange::Binance, MessageKind::Trade, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_snapshot_hash() {
        let q = queue(10);
        assert_eq!(q.latest_orderbook_snapshot("BTCUSDT").await.unwrap(), None);

        let snapshot = BookSnapshot {
            symbol: "BTCUSDT".to_string(),
            event_time: 1,
            sequence: 42,
            bids: vec![PriceLevel::new(dec!(100), dec!(1))],
            asks: vec![PriceLevel::new(dec!(101), dec!(1))],
        };
        q.store_orderbook_snapshot(Exchange::Bybit, &snapshot).await.unwrap();
        assert_eq!(q.snapshot_key("BTCUSDT"), "test:orderbook:BTCUSDT");
        assert_eq!(
            q.latest_orderbook_snapshot("BTCUSDT").await.unwrap(),
            Some(snapshot)
        );
    }
}
