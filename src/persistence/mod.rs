//! Batch persistence
//!
//! One [`DrainLoop`] per message kind pops batches off the durable queue and
//! writes them to its own [`TimeSeriesStore`]. Loops share nothing but the
//! queue, so a failing kind only affects itself.

mod postgres;
mod store;

pub use postgres::PostgresStore;
pub use store::TimeSeriesStore;

#[cfg(test)]
pub use store::MockTimeSeriesStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::exchange::Exchange;
use crate::metrics::Metrics;
use crate::queue::{DurableQueue, MessageKind, QueueMessage};

pub struct DrainLoop<S: TimeSeriesStore> {
    kind: MessageKind,
    exchanges: Vec<Exchange>,
    queue: Arc<DurableQueue>,
    store: S,
    config: PersistenceConfig,
    metrics: Arc<Metrics>,
    /// Exchange that is read first on the next flush
    cursor: usize,
}

enum Wake {
    Flush,
    Backlog,
    Shutdown,
}

impl<S: TimeSeriesStore> DrainLoop<S> {
    pub fn new(
        kind: MessageKind,
        exchanges: Vec<Exchange>,
        queue: Arc<DurableQueue>,
        store: S,
        config: PersistenceConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            kind,
            exchanges,
            queue,
            store,
            config,
            metrics,
            cursor: 0,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Pop up to one batch across all exchanges and write it. The batch is
    /// dropped if the write fails.
    ///
    /// Each exchange first gets an equal share of the batch, starting from a
    /// rotating position; room left by short queues then goes to the
    /// exchanges that filled their share.
    pub async fn flush_once(&mut self) -> Result<usize> {
        let n = self.exchanges.len();
        if n == 0 {
            return Ok(0);
        }
        let batch_size = self.config.flush_batch_size;
        let share = batch_size.div_ceil(n);
        let start = self.cursor % n;
        self.cursor = (start + 1) % n;

        let mut batch: Vec<QueueMessage> = Vec::with_capacity(batch_size);
        let mut backlogged = Vec::new();
        for offset in 0..n {
            let exchange = self.exchanges[(start + offset) % n];
            let room = share.min(batch_size - batch.len());
            if room == 0 {
                break;
            }
            let popped = self.pop_from(exchange, room).await;
            if popped.len() == room {
                backlogged.push(exchange);
            }
            batch.extend(popped);
        }
        for exchange in backlogged {
            let room = batch_size - batch.len();
            if room == 0 {
                break;
            }
            batch.extend(self.pop_from(exchange, room).await);
        }

        if batch.is_empty() {
            return Ok(0);
        }

        match self.store.write_batch(self.kind, &batch).await {
            Ok(rows) => {
                let mut per_exchange: HashMap<Exchange, u64> = HashMap::new();
                for message in &batch {
                    *per_exchange.entry(message.exchange()).or_default() += 1;
                }
                for (exchange, count) in per_exchange {
                    self.metrics.record_flushed(exchange, self.kind, count);
                }
                debug!(kind = %self.kind, messages = batch.len(), rows, "Flushed batch");
                Ok(batch.len())
            }
            Err(e) => {
                error!(
                    kind = %self.kind,
                    dropped = batch.len(),
                    error = %e,
                    "Batch write failed, dropping batch"
                );
                self.metrics.record_error("all", &format!("store_{}", self.kind));
                Err(e)
            }
        }
    }

    async fn pop_from(&self, exchange: Exchange, count: usize) -> Vec<QueueMessage> {
        match self.queue.pop(exchange, self.kind, count).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(kind = %self.kind, exchange = %exchange, error = %e, "Queue pop failed");
                self.metrics.record_error(exchange.as_str(), "queue_pop");
                Vec::new()
            }
        }
    }

    async fn backlog(&mut self) -> usize {
        let mut total = 0;
        for exchange in &self.exchanges {
            total += self.queue.size(*exchange, self.kind).await.unwrap_or(0);
        }
        total
    }

    /// Flush until the queue is drained or a write fails
    async fn drain(&mut self) {
        loop {
            match self.flush_once().await {
                Ok(n) if n >= self.config.flush_batch_size => continue,
                _ => break,
            }
        }
    }

    /// Run until `shutdown` flips, then flush once more within the grace
    /// period
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(kind = %self.kind, exchanges = ?self.exchanges, "Drain loop started");

        let mut flush_tick = interval(Duration::from_millis(self.config.flush_interval_ms));
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backlog_tick = interval(Duration::from_millis(self.config.backlog_check_interval_ms.max(1)));
        backlog_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let wake = tokio::select! {
                _ = flush_tick.tick() => Wake::Flush,
                _ = backlog_tick.tick() => Wake::Backlog,
                _ = shutdown.changed() => Wake::Shutdown,
            };

            match wake {
                Wake::Flush => {
                    let _ = self.flush_once().await;
                }
                Wake::Backlog => {
                    if self.backlog().await >= self.config.flush_batch_size {
                        self.drain().await;
                    }
                }
                Wake::Shutdown => break,
            }
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        if timeout(grace, self.drain()).await.is_err() {
            warn!(kind = %self.kind, "Final flush exceeded shutdown grace period");
        }
        info!(kind = %self.kind, "Drain loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::events::{Kline, Liquidation, Trade, TradeSide};
    use crate::queue::{MemoryBackend, Payload};
    use rust_decimal_macros::dec;

    fn config(batch: usize) -> PersistenceConfig {
        PersistenceConfig {
            database_url: None,
            flush_batch_size: batch,
            flush_interval_ms: 10,
            backlog_check_interval_ms: 5,
            shutdown_grace_secs: 1,
        }
    }

    fn trade(exchange: Exchange, id: u64) -> QueueMessage {
        QueueMessage::new(
            exchange,
            Payload::Trade(Trade {
                symbol: "BTCUSDT".to_string(),
                trade_id: id.to_string(),
                price: dec!(100),
                quantity: dec!(1),
                side: TradeSide::Buy,
                trade_time: id as i64,
            }),
        )
    }

    fn kline(open_time: i64) -> QueueMessage {
        QueueMessage::new(
            Exchange::Binance,
            Payload::Kline(Kline {
                symbol: "ETHUSDT".to_string(),
                interval: "1m".to_string(),
                open_time,
                close_time: open_time + 59_999,
                open: dec!(1),
                high: dec!(2),
                low: dec!(1),
                close: dec!(2),
                volume: dec!(10),
                trade_count: Some(3),
                is_closed: true,
            }),
        )
    }

    fn liquidation(event_time: i64) -> QueueMessage {
        QueueMessage::new(
            Exchange::Bybit,
            Payload::Liquidation(Liquidation {
                symbol: "BTCUSDT".to_string(),
                side: TradeSide::Sell,
                price: dec!(100),
                quantity: dec!(3),
                event_time,
            }),
        )
    }

    fn fixture() -> (Arc<DurableQueue>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let queue = Arc::new(DurableQueue::new(
            Arc::new(MemoryBackend::new()),
            "test",
            1000,
            metrics.clone(),
        ));
        (queue, metrics)
    }

    #[tokio::test]
    async fn test_flush_pops_across_exchanges_up_to_batch_size() {
        let (queue, metrics) = fixture();
        for id in 0..3 {
            queue.push(&trade(Exchange::Binance, id)).await.unwrap();
            queue.push(&trade(Exchange::Okx, id)).await.unwrap();
        }

        let mut store = MockTimeSeriesStore::new();
        store
            .expect_write_batch()
            .withf(|kind, batch| *kind == MessageKind::Trade && batch.len() == 4)
            .times(1)
            .returning(|_, batch| Ok(batch.len() as u64));

        let mut drain = DrainLoop::new(
            MessageKind::Trade,
            vec![Exchange::Binance, Exchange::Okx],
            queue.clone(),
            store,
            config(4),
            metrics.clone(),
        );
        assert_eq!(drain.flush_once().await.unwrap(), 4);
        assert_eq!(metrics.flushed(Exchange::Binance, MessageKind::Trade), 2);
        assert_eq!(metrics.flushed(Exchange::Okx, MessageKind::Trade), 2);
        assert_eq!(queue.size(Exchange::Okx, MessageKind::Trade).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_busy_exchange_does_not_starve_others() {
        let (queue, metrics) = fixture();
        for id in 0..3 {
            queue.push(&trade(Exchange::Okx, id)).await.unwrap();
        }

        let mut store = MockTimeSeriesStore::new();
        store
            .expect_write_batch()
            .returning(|_, batch| Ok(batch.len() as u64));
        let mut drain = DrainLoop::new(
            MessageKind::Trade,
            vec![Exchange::Binance, Exchange::Okx],
            queue.clone(),
            store,
            config(4),
            metrics.clone(),
        );

        let mut next_id = 0;
        for _ in 0..50 {
            for _ in 0..4 {
                queue.push(&trade(Exchange::Binance, next_id)).await.unwrap();
                next_id += 1;
            }
            drain.flush_once().await.unwrap();
        }

        assert_eq!(metrics.flushed(Exchange::Okx, MessageKind::Trade), 3);
        assert_eq!(queue.size(Exchange::Okx, MessageKind::Trade).await.unwrap(), 0);
        assert!(metrics.flushed(Exchange::Binance, MessageKind::Trade) >= 190);
    }

    #[tokio::test]
    async fn test_unused_share_goes_to_backlogged_exchange() {
        let (queue, metrics) = fixture();
        queue.push(&trade(Exchange::Okx, 0)).await.unwrap();
        for id in 0..10 {
            queue.push(&trade(Exchange::Binance, id)).await.unwrap();
        }

        let mut store = MockTimeSeriesStore::new();
        store
            .expect_write_batch()
            .times(1)
            .returning(|_, batch| Ok(batch.len() as u64));
        let mut drain = DrainLoop::new(
            MessageKind::Trade,
            vec![Exchange::Binance, Exchange::Okx],
            queue.clone(),
            store,
            config(6),
            metrics.clone(),
        );

        assert_eq!(drain.flush_once().await.unwrap(), 6);
        assert_eq!(metrics.flushed(Exchange::Binance, MessageKind::Trade), 5);
        assert_eq!(metrics.flushed(Exchange::Okx, MessageKind::Trade), 1);
    }

    #[tokio::test]
    async fn test_failing_kind_does_not_affect_others() {
        let (queue, metrics) = fixture();
        for id in 0..5 {
            queue.push(&trade(Exchange::Binance, id)).await.unwrap();
            queue.push(&kline(id as i64 * 60_000)).await.unwrap();
        }

        let mut trade_store = MockTimeSeriesStore::new();
        trade_store
            .expect_write_batch()
            .returning(|_, _| Err(IngestError::StoreError("disk full".to_string())));
        let mut kline_store = MockTimeSeriesStore::new();
        kline_store
            .expect_write_batch()
            .withf(|kind, _| *kind == MessageKind::Kline)
            .returning(|_, batch| Ok(batch.len() as u64));

        let mut trades = DrainLoop::new(
            MessageKind::Trade,
            vec![Exchange::Binance],
            queue.clone(),
            trade_store,
            config(100),
            metrics.clone(),
        );
        let mut klines = DrainLoop::new(
            MessageKind::Kline,
            vec![Exchange::Binance],
            queue.clone(),
            kline_store,
            config(100),
            metrics.clone(),
        );

        assert!(trades.flush_once().await.is_err());
        assert_eq!(klines.flush_once().await.unwrap(), 5);

        assert_eq!(metrics.flushed(Exchange::Binance, MessageKind::Kline), 5);
        assert_eq!(metrics.flushed(Exchange::Binance, MessageKind::Trade), 0);
        assert_eq!(metrics.errors("all", "store_trade"), 1);
        // failed batches are not re-enqueued
        assert_eq!(queue.size(Exchange::Binance, MessageKind::Trade).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_skips_store() {
        let (queue, metrics) = fixture();
        let mut store = MockTimeSeriesStore::new();
        store.expect_write_batch().never();

        let mut drain = DrainLoop::new(
            MessageKind::Liquidation,
            vec![Exchange::Bybit],
            queue,
            store,
            config(10),
            metrics,
        );
        assert_eq!(drain.flush_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_flushes_remaining_on_shutdown() {
        let (queue, metrics) = fixture();
        for id in 0..25 {
            queue.push(&trade(Exchange::Bybit, id)).await.unwrap();
        }

        let mut store = MockTimeSeriesStore::new();
        store
            .expect_write_batch()
            .returning(|_, batch| Ok(batch.len() as u64));

        let drain = DrainLoop::new(
            MessageKind::Trade,
            vec![Exchange::Bybit],
            queue.clone(),
            store,
            PersistenceConfig {
                flush_interval_ms: 60_000,
                backlog_check_interval_ms: 60_000,
                ..config(10)
            },
            metrics.clone(),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(drain.run(rx));
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(queue.size(Exchange::Bybit, MessageKind::Trade).await.unwrap(), 0);
        assert_eq!(metrics.flushed(Exchange::Bybit, MessageKind::Trade), 25);
    }

    #[tokio::test]
    async fn test_running_loops_isolate_a_failing_kind() {
        let (queue, metrics) = fixture();

        let mut liquidation_store = MockTimeSeriesStore::new();
        liquidation_store
            .expect_write_batch()
            .returning(|_, _| Err(IngestError::StoreError("relation does not exist".to_string())));
        let mut trade_store = MockTimeSeriesStore::new();
        trade_store
            .expect_write_batch()
            .returning(|_, batch| Ok(batch.len() as u64));

        let (tx, rx) = watch::channel(false);
        let liquidations = tokio::spawn(
            DrainLoop::new(
                MessageKind::Liquidation,
                vec![Exchange::Bybit],
                queue.clone(),
                liquidation_store,
                config(100),
                metrics.clone(),
            )
            .run(rx.clone()),
        );
        let trades = tokio::spawn(
            DrainLoop::new(
                MessageKind::Trade,
                vec![Exchange::Bybit],
                queue.clone(),
                trade_store,
                config(100),
                metrics.clone(),
            )
            .run(rx),
        );

        let mut flushed = 0;
        for round in 0..5u64 {
            for id in 0..3 {
                queue.push(&trade(Exchange::Bybit, round * 10 + id)).await.unwrap();
            }
            queue.push(&liquidation(round as i64)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            let now = metrics.flushed(Exchange::Bybit, MessageKind::Trade);
            assert!(now > flushed, "trade flushes stalled in round {round}");
            flushed = now;
        }

        tx.send(true).unwrap();
        liquidations.await.unwrap();
        trades.await.unwrap();

        assert_eq!(metrics.flushed(Exchange::Bybit, MessageKind::Trade), 15);
        assert_eq!(metrics.flushed(Exchange::Bybit, MessageKind::Liquidation), 0);
        assert!(metrics.errors("all", "store_liquidation") >= 5);
        assert_eq!(queue.size(Exchange::Bybit, MessageKind::Liquidation).await.unwrap(), 0);
    }
}
