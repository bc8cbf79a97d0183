//! PostgreSQL time-series store
//!
//! Connects lazily, creates the schema and prepares statements on first use
//! and writes each batch in one transaction. Messages that cannot be converted
//! to rows are skipped before the transaction opens. Inserts are idempotent so a batch replayed after a crash
//! does not duplicate rows. Any error drops the connection; the next batch
//! reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio_postgres::{Client, NoTls, Statement, Transaction};
use tracing::{debug, info, warn};

use super::TimeSeriesStore;
use crate::error::{IngestError, Result};
use crate::exchange::Exchange;
use crate::metrics::Metrics;
use crate::queue::{MessageKind, Payload, QueueMessage};
use crate::symbol::{self, Symbol};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS markets (
    id          SERIAL PRIMARY KEY,
    exchange    TEXT NOT NULL,
    symbol      TEXT NOT NULL,
    base_asset  TEXT NOT NULL,
    quote_asset TEXT NOT NULL,
    UNIQUE (exchange, symbol)
);

CREATE TABLE IF NOT EXISTS trades (
    market_id   INTEGER NOT NULL REFERENCES markets (id),
    event_time  TIMESTAMPTZ NOT NULL,
    trade_id    TEXT NOT NULL,
    price       NUMERIC NOT NULL,
    quantity    NUMERIC NOT NULL,
    side        TEXT NOT NULL,
    PRIMARY KEY (market_id, event_time, trade_id)
);

CREATE TABLE IF NOT EXISTS orderbook_snapshots (
    market_id   INTEGER NOT NULL REFERENCES markets (id),
    event_time  TIMESTAMPTZ NOT NULL,
    sequence    BIGINT NOT NULL,
    bids        JSONB NOT NULL,
    asks        JSONB NOT NULL,
    PRIMARY KEY (market_id, event_time)
);

CREATE TABLE IF NOT EXISTS orderbook_updates (
    market_id   INTEGER NOT NULL REFERENCES markets (id),
    event_time  TIMESTAMPTZ NOT NULL,
    first_seq   BIGINT NOT NULL,
    last_seq    BIGINT NOT NULL,
    bids        JSONB NOT NULL,
    asks        JSONB NOT NULL,
    PRIMARY KEY (market_id, event_time, last_seq)
);

CREATE TABLE IF NOT EXISTS kline (
    market_id      INTEGER NOT NULL REFERENCES markets (id),
    kline_interval TEXT NOT NULL,
    open_time      TIMESTAMPTZ NOT NULL,
    close_time     TIMESTAMPTZ NOT NULL,
    open           NUMERIC NOT NULL,
    high           NUMERIC NOT NULL,
    low            NUMERIC NOT NULL,
    close          NUMERIC NOT NULL,
    volume         NUMERIC NOT NULL,
    trade_count    BIGINT,
    is_closed      BOOLEAN NOT NULL,
    PRIMARY KEY (market_id, kline_interval, open_time)
);

CREATE TABLE IF NOT EXISTS liquidations (
    market_id   INTEGER NOT NULL REFERENCES markets (id),
    event_time  TIMESTAMPTZ NOT NULL,
    side        TEXT NOT NULL,
    price       NUMERIC NOT NULL,
    quantity    NUMERIC NOT NULL,
    PRIMARY KEY (market_id, event_time, side, price)
);
"#;

const UPSERT_MARKET: &str = "INSERT INTO markets (exchange, symbol, base_asset, quote_asset) \
     VALUES ($1, $2, $3, $4) \
     ON CONFLICT (exchange, symbol) DO UPDATE SET base_asset = EXCLUDED.base_asset \
     RETURNING id";

const INSERT_TRADE: &str = "INSERT INTO trades (market_id, event_time, trade_id, price, quantity, side) \
     VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING";

const UPSERT_SNAPSHOT: &str = "INSERT INTO orderbook_snapshots (market_id, event_time, sequence, bids, asks) \
     VALUES ($1, $2, $3, $4, $5) \
     ON CONFLICT (market_id, event_time) DO UPDATE \
     SET sequence = EXCLUDED.sequence, bids = EXCLUDED.bids, asks = EXCLUDED.asks";

const INSERT_UPDATE: &str = "INSERT INTO orderbook_updates (market_id, event_time, first_seq, last_seq, bids, asks) \
     VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING";

const UPSERT_KLINE: &str = "INSERT INTO kline \
     (market_id, kline_interval, open_time, close_time, open, high, low, close, volume, trade_count, is_closed) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
     ON CONFLICT (market_id, kline_interval, open_time) DO UPDATE \
     SET close_time = EXCLUDED.close_time, high = EXCLUDED.high, low = EXCLUDED.low, \
         close = EXCLUDED.close, volume = EXCLUDED.volume, trade_count = EXCLUDED.trade_count, \
         is_closed = EXCLUDED.is_closed";

const INSERT_LIQUIDATION: &str = "INSERT INTO liquidations (market_id, event_time, side, price, quantity) \
     VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING";

/// Statements prepared once per connection
struct Statements {
    market: Statement,
    trade: Statement,
    snapshot: Statement,
    update: Statement,
    kline: Statement,
    liquidation: Statement,
}

struct Connection {
    client: Client,
    statements: Statements,
}

impl Connection {
    async fn open(url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection closed");
            }
        });

        client.batch_execute(SCHEMA).await?;
        let statements = Statements {
            market: client.prepare(UPSERT_MARKET).await?,
            trade: client.prepare(INSERT_TRADE).await?,
            snapshot: client.prepare(UPSERT_SNAPSHOT).await?,
            update: client.prepare(INSERT_UPDATE).await?,
            kline: client.prepare(UPSERT_KLINE).await?,
            liquidation: client.prepare(INSERT_LIQUIDATION).await?,
        };
        info!("Connected to PostgreSQL, schema ready");

        Ok(Self { client, statements })
    }
}

/// Column values of one message, converted before the transaction opens so
/// a malformed message cannot abort its neighbours
#[derive(Debug, Clone, PartialEq)]
enum Row {
    Trade {
        time: DateTime<Utc>,
        trade_id: String,
        price: Decimal,
        quantity: Decimal,
        side: &'static str,
    },
    Snapshot {
        time: DateTime<Utc>,
        sequence: i64,
        bids: serde_json::Value,
        asks: serde_json::Value,
    },
    Update {
        time: DateTime<Utc>,
        first_seq: i64,
        last_seq: i64,
        bids: serde_json::Value,
        asks: serde_json::Value,
    },
    Kline {
        interval: String,
        open_time: DateTime<Utc>,
        close_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        trade_count: Option<i64>,
        is_closed: bool,
    },
    Liquidation {
        time: DateTime<Utc>,
        side: &'static str,
        price: Decimal,
        quantity: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Record {
    exchange: Exchange,
    market: Symbol,
    row: Row,
}

impl Record {
    fn from_message(message: &QueueMessage) -> Result<Self> {
        let market = symbol::parse_symbol(message.payload().symbol())?;
        let row = match message.payload() {
            Payload::Trade(t) => Row::Trade {
                time: timestamp(t.trade_time)?,
                trade_id: t.trade_id.clone(),
                price: t.price,
                quantity: t.quantity,
                side: t.side.as_str(),
            },
            Payload::OrderbookSnapshot(s) => Row::Snapshot {
                time: timestamp(s.event_time)?,
                sequence: sequence(s.sequence)?,
                bids: serde_json::to_value(&s.bids)?,
                asks: serde_json::to_value(&s.asks)?,
            },
            Payload::OrderbookUpdate(d) => Row::Update {
                time: timestamp(d.event_time)?,
                first_seq: sequence(d.first_seq)?,
                last_seq: sequence(d.last_seq)?,
                bids: serde_json::to_value(&d.bids)?,
                asks: serde_json::to_value(&d.asks)?,
            },
            Payload::Kline(k) => Row::Kline {
                interval: k.interval.clone(),
                open_time: timestamp(k.open_time)?,
                close_time: timestamp(k.close_time)?,
                open: k.open,
                high: k.high,
                low: k.low,
                close: k.close,
                volume: k.volume,
                trade_count: k.trade_count.map(sequence).transpose()?,
                is_closed: k.is_closed,
            },
            Payload::Liquidation(l) => Row::Liquidation {
                time: timestamp(l.event_time)?,
                side: l.side.as_str(),
                price: l.price,
                quantity: l.quantity,
            },
        };
        Ok(Self {
            exchange: message.exchange(),
            market,
            row,
        })
    }
}

pub struct PostgresStore {
    url: String,
    conn: Option<Connection>,
    markets: HashMap<(Exchange, String), i32>,
    metrics: Arc<Metrics>,
}

impl PostgresStore {
    pub fn new(url: &str, metrics: Arc<Metrics>) -> Self {
        Self {
            url: url.to_string(),
            conn: None,
            markets: HashMap::new(),
            metrics,
        }
    }

    /// Convert a batch, skipping messages that cannot be stored
    fn records(&self, kind: MessageKind, batch: &[QueueMessage]) -> Vec<Record> {
        let mut records = Vec::with_capacity(batch.len());
        for message in batch {
            if message.kind() != kind {
                warn!(expected = %kind, got = %message.kind(), "Skipping message of wrong kind");
                self.metrics.record_error(message.exchange().as_str(), "invalid_record");
                continue;
            }
            match Record::from_message(message) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        kind = %kind,
                        exchange = %message.exchange(),
                        symbol = %message.payload().symbol(),
                        error = %e,
                        "Skipping message that cannot be stored"
                    );
                    self.metrics.record_error(message.exchange().as_str(), "invalid_record");
                }
            }
        }
        records
    }

    async fn write(&mut self, kind: MessageKind, batch: &[QueueMessage]) -> Result<u64> {
        let records = self.records(kind, batch);
        if records.is_empty() {
            return Ok(0);
        }

        if self.conn.is_none() {
            self.conn = Some(Connection::open(&self.url).await?);
            self.markets.clear();
        }
        let Self { conn, markets, .. } = self;
        let Connection { client, statements } = conn
            .as_mut()
            .ok_or_else(|| IngestError::StoreError("not connected".to_string()))?;

        let tx = client.transaction().await?;
        let mut written = 0;
        for record in &records {
            let market_id = market_id(&tx, statements, markets, record).await?;
            written += insert(&tx, statements, market_id, &record.row).await?;
        }
        tx.commit().await?;

        debug!(kind = %kind, messages = batch.len(), rows = written, "Batch committed");
        Ok(written)
    }
}

#[async_trait]
impl TimeSeriesStore for PostgresStore {
    async fn write_batch(&mut self, kind: MessageKind, batch: &[QueueMessage]) -> Result<u64> {
        let result = self.write(kind, batch).await;
        if result.is_err() {
            self.conn = None;
            self.markets.clear();
        }
        result
    }
}

async fn market_id(
    tx: &Transaction<'_>,
    statements: &Statements,
    cache: &mut HashMap<(Exchange, String), i32>,
    record: &Record,
) -> Result<i32> {
    let key = (record.exchange, record.market.internal());
    if let Some(id) = cache.get(&key) {
        return Ok(*id);
    }

    let row = tx
        .query_one(
            &statements.market,
            &[
                &record.exchange.as_str(),
                &key.1,
                &record.market.base(),
                &record.market.quote(),
            ],
        )
        .await?;
    let id: i32 = row.get(0);
    cache.insert(key, id);
    Ok(id)
}

async fn insert(tx: &Transaction<'_>, statements: &Statements, market_id: i32, row: &Row) -> Result<u64> {
    let rows = match row {
        Row::Trade { time, trade_id, price, quantity, side } => {
            tx.execute(&statements.trade, &[&market_id, time, trade_id, price, quantity, side])
                .await?
        }
        Row::Snapshot { time, sequence, bids, asks } => {
            tx.execute(&statements.snapshot, &[&market_id, time, sequence, bids, asks])
                .await?
        }
        Row::Update { time, first_seq, last_seq, bids, asks } => {
            tx.execute(&statements.update, &[&market_id, time, first_seq, last_seq, bids, asks])
                .await?
        }
        Row::Kline {
            interval,
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            trade_count,
            is_closed,
        } => {
            tx.execute(
                &statements.kline,
                &[
                    &market_id, interval, open_time, close_time, open, high, low, close, volume,
                    trade_count, is_closed,
                ],
            )
            .await?
        }
        Row::Liquidation { time, side, price, quantity } => {
            tx.execute(&statements.liquidation, &[&market_id, time, side, price, quantity])
                .await?
        }
    };
    Ok(rows)
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| IngestError::StoreError(format!("timestamp {millis} out of range")))
}

/// BIGINT columns are signed
fn sequence(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| IngestError::StoreError(format!("sequence {value} exceeds BIGINT")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Trade, TradeSide};
    use rust_decimal_macros::dec;

    #[test]
    fn test_timestamp_conversion() {
        let ts = timestamp(1_700_000_000_123).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
        assert!(timestamp(i64::MAX).is_err());
    }

    #[test]
    fn test_sequence_bounds() {
        assert_eq!(sequence(42).unwrap(), 42);
        assert!(sequence(u64::MAX).is_err());
    }

    #[test]
    fn test_schema_names_every_table() {
        for table in ["markets", "trades", "orderbook_snapshots", "orderbook_updates", "kline", "liquidations"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")));
        }
    }

    fn trade(symbol: &str, trade_id: &str, trade_time: i64) -> QueueMessage {
        QueueMessage::new(
            Exchange::Binance,
            Payload::Trade(Trade {
                symbol: symbol.to_string(),
                trade_id: trade_id.to_string(),
                price: dec!(100.5),
                quantity: dec!(2),
                side: TradeSide::Buy,
                trade_time,
            }),
        )
    }

    fn store() -> (PostgresStore, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        (
            PostgresStore::new("postgres://nobody@127.0.0.1:1/none", metrics.clone()),
            metrics,
        )
    }

    #[test]
    fn test_record_from_trade() {
        let record = Record::from_message(&trade("BTCUSDT", "7", 1_700_000_000_000)).unwrap();
        assert_eq!(record.exchange, Exchange::Binance);
        assert_eq!((record.market.base(), record.market.quote()), ("BTC", "USDT"));
        assert_eq!(
            record.row,
            Row::Trade {
                time: timestamp(1_700_000_000_000).unwrap(),
                trade_id: "7".to_string(),
                price: dec!(100.5),
                quantity: dec!(2),
                side: "buy",
            }
        );
    }

    #[test]
    fn test_bad_messages_are_skipped_not_fatal() {
        let (store, metrics) = store();
        let batch = vec![
            trade("BTCUSDT", "1", 1_700_000_000_000),
            trade("NOPE", "2", 1_700_000_000_000),
            trade("ETHUSDT", "3", i64::MAX),
            trade("ETHUSDT", "4", 1_700_000_000_001),
        ];

        let records = store.records(MessageKind::Trade, &batch);
        let ids: Vec<_> = records
            .iter()
            .map(|r| match &r.row {
                Row::Trade { trade_id, .. } => trade_id.as_str(),
                other => panic!("Expected a trade row, got {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec!["1", "4"]);
        assert_eq!(metrics.errors("binance", "invalid_record"), 2);

        assert!(store.records(MessageKind::Kline, &batch).is_empty());
    }

    #[tokio::test]
    async fn test_batch_without_storable_rows_skips_connect() {
        let (mut store, _) = store();
        let written = store
            .write_batch(MessageKind::Trade, &[trade("NOPE", "1", 0)])
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert!(store.conn.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_database_reports_store_error() {
        let (mut store, _) = store();
        let err = store
            .write_batch(MessageKind::Trade, &[trade("BTCUSDT", "1", 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::StoreError(_)));
        assert!(store.conn.is_none());
    }
}
