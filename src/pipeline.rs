//! Pipeline wiring
//!
//! Builds one order book engine and connection task per configured exchange,
//! one drain loop per persisted message kind, the periodic snapshot timer and
//! the health server, and coordinates their shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{info, warn};

use crate::config::{Config, ExchangeConfig};
use crate::error::Result;
use crate::events::MarketEvent;
use crate::exchange::{BinanceAdapter, BybitAdapter, Exchange, ExchangeAdapter, OkxAdapter};
use crate::health::{self, HealthState};
use crate::metrics::Metrics;
use crate::orderbook::{OrderBookEngine, SequencePolicy};
use crate::persistence::{DrainLoop, PostgresStore, TimeSeriesStore};
use crate::queue::{DurableQueue, MessageKind, Payload, QueueMessage};
use crate::websocket::{ConnectionManager, ConnectionState};

/// Capacity of the in-process event broadcast
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Extra time allowed on shutdown beyond the flush grace period
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Adapter of one configured exchange, chosen once at startup
enum Adapter {
    Binance(BinanceAdapter),
    Bybit(BybitAdapter),
    Okx(OkxAdapter),
}

impl Adapter {
    fn for_config(config: &ExchangeConfig) -> Self {
        match config.name {
            Exchange::Binance => Adapter::Binance(BinanceAdapter::new(
                &config.ws_endpoint,
                config.rest_endpoint.as_deref().unwrap_or_default(),
            )),
            Exchange::Bybit => Adapter::Bybit(BybitAdapter::new(&config.ws_endpoint)),
            Exchange::Okx => {
                Adapter::Okx(OkxAdapter::new(&config.ws_endpoint, config.market, &config.symbols))
            }
        }
    }

    fn sequence_policy(&self) -> SequencePolicy {
        match self {
            Adapter::Binance(adapter) => adapter.sequence_policy(),
            Adapter::Bybit(adapter) => adapter.sequence_policy(),
            Adapter::Okx(adapter) => adapter.sequence_policy(),
        }
    }
}

/// One configured exchange: its book engine and, until its connection is
/// started, its adapter
struct Venue {
    config: ExchangeConfig,
    engine: Arc<OrderBookEngine>,
    adapter: Option<Adapter>,
}

pub struct Pipeline {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    queue: Arc<DurableQueue>,
    venues: Vec<Venue>,
    events: broadcast::Sender<(Exchange, MarketEvent)>,
    connections: Vec<(Exchange, watch::Receiver<ConnectionState>)>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(config: Config, queue: Arc<DurableQueue>, metrics: Arc<Metrics>) -> Self {
        let venues = config
            .exchanges
            .iter()
            .map(|ex| {
                let adapter = Adapter::for_config(ex);
                let engine = OrderBookEngine::new(
                    ex.name,
                    adapter.sequence_policy(),
                    config.orderbook.max_depth,
                );
                Venue {
                    config: ex.clone(),
                    engine: Arc::new(engine),
                    adapter: Some(adapter),
                }
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            metrics,
            queue,
            venues,
            events,
            connections: Vec::new(),
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Create metrics and open the configured queue backend
    pub async fn connect(config: Config) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let queue = Arc::new(DurableQueue::connect(&config.queue, metrics.clone()).await?);
        Ok(Self::new(config, queue, metrics))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn queue(&self) -> Arc<DurableQueue> {
        self.queue.clone()
    }

    pub fn engine(&self, exchange: Exchange) -> Option<Arc<OrderBookEngine>> {
        self.venues
            .iter()
            .find(|venue| venue.config.name == exchange)
            .map(|venue| venue.engine.clone())
    }

    /// Stream of every parsed event
    pub fn subscribe(&self) -> broadcast::Receiver<(Exchange, MarketEvent)> {
        self.events.subscribe()
    }

    /// Kinds with a drain loop
    pub fn persisted_kinds(&self) -> Vec<MessageKind> {
        MessageKind::ALL
            .into_iter()
            .filter(|kind| *kind != MessageKind::OrderbookUpdate || self.config.orderbook.persist_updates)
            .collect()
    }

    fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.config.queue.push_timeout_ms)
    }

    /// Spawn one connection task per configured exchange. Each exchange is
    /// started at most once.
    pub fn start_connections(&mut self) {
        let pending: Vec<_> = self
            .venues
            .iter_mut()
            .filter_map(|venue| {
                let adapter = venue.adapter.take()?;
                Some((adapter, venue.config.clone(), venue.engine.clone()))
            })
            .collect();

        for (adapter, exchange_config, engine) in pending {
            match adapter {
                Adapter::Binance(adapter) => self.launch(adapter, exchange_config, engine),
                Adapter::Bybit(adapter) => self.launch(adapter, exchange_config, engine),
                Adapter::Okx(adapter) => self.launch(adapter, exchange_config, engine),
            }
        }
    }

    fn launch<A: ExchangeAdapter>(
        &mut self,
        adapter: A,
        exchange_config: ExchangeConfig,
        engine: Arc<OrderBookEngine>,
    ) {
        let exchange = adapter.exchange();
        let manager = ConnectionManager::new(
            adapter,
            exchange_config,
            engine,
            self.queue.clone(),
            self.metrics.clone(),
            self.events.clone(),
            self.push_timeout(),
            self.config.orderbook.persist_updates,
        );
        self.connections.push((exchange, manager.state()));
        self.tasks
            .push(tokio::spawn(manager.run(self.shutdown_tx.subscribe())));
    }

    /// Spawn a drain loop for `kind` writing to `store`
    pub fn start_drain_loop<S: TimeSeriesStore + Sync + 'static>(&mut self, kind: MessageKind, store: S) {
        let drain = DrainLoop::new(
            kind,
            self.config.exchange_names(),
            self.queue.clone(),
            store,
            self.config.persistence.clone(),
            self.metrics.clone(),
        );
        self.tasks
            .push(tokio::spawn(drain.run(self.shutdown_tx.subscribe())));
    }

    /// One PostgreSQL-backed drain loop per persisted kind, each with its own
    /// connection
    pub fn start_postgres_persistence(&mut self) {
        let Some(url) = self.config.persistence.database_url.clone() else {
            warn!("No database_url configured, persistence disabled; queues will fill up to max_depth");
            return;
        };
        for kind in self.persisted_kinds() {
            self.start_drain_loop(kind, PostgresStore::new(&url, self.metrics.clone()));
        }
    }

    /// Periodically queue and publish top-N snapshots of every synced book
    pub fn start_snapshot_timer(&mut self) {
        let engines: Vec<_> = self.venues.iter().map(|venue| venue.engine.clone()).collect();
        let queue = self.queue.clone();
        let metrics = self.metrics.clone();
        let levels = self.config.orderbook.snapshot_levels;
        let push_timeout = self.push_timeout();
        let period = Duration::from_secs(self.config.orderbook.snapshot_interval_secs);
        let mut shutdown = self.shutdown_tx.subscribe();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                let stop = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = shutdown.changed() => true,
                };
                if stop {
                    break;
                }
                let emitted = emit_snapshots(&engines, &queue, &metrics, levels, push_timeout).await;
                info!(snapshots = emitted, "Periodic order book snapshots emitted");
            }
        }));
    }

    /// Serve `/health`, `/metrics` and `/queue`
    pub fn start_health_server(&mut self) {
        let state = Arc::new(HealthState {
            metrics: self.metrics.clone(),
            queue: self.queue.clone(),
            connections: self.connections.clone(),
        });
        let bind_addr = self.config.health_bind_addr.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = health::serve(&bind_addr, state, shutdown).await {
                warn!(error = %e, "Health server error");
            }
        }));
    }

    /// Queue a snapshot of every synced book now
    pub async fn emit_snapshots(&self) -> usize {
        let engines: Vec<_> = self.venues.iter().map(|venue| venue.engine.clone()).collect();
        emit_snapshots(
            &engines,
            &self.queue,
            &self.metrics,
            self.config.orderbook.snapshot_levels,
            self.push_timeout(),
        )
        .await
    }

    /// Signal every task to stop and wait for the final flush
    pub async fn shutdown(self) {
        info!("Shutting down pipeline");
        self.shutdown_tx.send_replace(true);

        let budget = Duration::from_secs(self.config.persistence.shutdown_grace_secs) + SHUTDOWN_SLACK;
        let tasks = self.tasks;
        let joined = timeout(budget, async move {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Task failed during shutdown");
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("Shutdown budget exceeded, abandoning remaining tasks");
        }
        info!("Pipeline stopped");
    }

    /// Start everything and run until `signal` resolves
    pub async fn run_until<F: Future<Output = ()>>(mut self, signal: F) {
        self.start_connections();
        self.start_postgres_persistence();
        self.start_snapshot_timer();
        self.start_health_server();

        signal.await;
        self.shutdown().await;
    }
}

async fn emit_snapshots(
    engines: &[Arc<OrderBookEngine>],
    queue: &DurableQueue,
    metrics: &Metrics,
    levels: usize,
    push_timeout: Duration,
) -> usize {
    let mut emitted = 0;
    for engine in engines {
        let exchange = engine.exchange();
        for snapshot in engine.snapshots(levels).await {
            if let Err(e) = queue.store_orderbook_snapshot(exchange, &snapshot).await {
                warn!(exchange = %exchange, symbol = %snapshot.symbol, error = %e, "Failed to store latest snapshot");
                metrics.record_error(exchange.as_str(), "snapshot_store");
            }

            let message = QueueMessage::new(exchange, Payload::OrderbookSnapshot(snapshot));
            match timeout(push_timeout, queue.push(&message)).await {
                Ok(Ok(())) => emitted += 1,
                Ok(Err(e)) => {
                    warn!(exchange = %exchange, error = %e, "Snapshot push failed");
                    metrics.record_error(exchange.as_str(), "queue_push");
                }
                Err(_) => {
                    warn!(exchange = %exchange, "Snapshot push timed out");
                    metrics.record_error(exchange.as_str(), "queue_push");
                }
            }
        }
    }
    emitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BookSnapshot, PriceLevel};
    use crate::queue::MemoryBackend;
    use rust_decimal_macros::dec;

    fn pipeline(persist_updates: bool) -> Pipeline {
        let mut config = Config::default();
        config.orderbook.persist_updates = persist_updates;
        let metrics = Arc::new(Metrics::new().unwrap());
        let queue = Arc::new(DurableQueue::new(
            Arc::new(MemoryBackend::new()),
            "test",
            100,
            metrics.clone(),
        ));
        Pipeline::new(config, queue, metrics)
    }

    #[test]
    fn test_persisted_kinds() {
        assert!(!pipeline(false)
            .persisted_kinds()
            .contains(&MessageKind::OrderbookUpdate));
        assert_eq!(pipeline(true).persisted_kinds().len(), MessageKind::ALL.len());
    }

    #[test]
    fn test_engines_follow_adapter_sequence_policy() {
        let mut config = Config::default();
        let binance = config.exchanges[0].clone();
        config.exchanges = vec![
            binance.clone(),
            ExchangeConfig {
                name: Exchange::Bybit,
                rest_endpoint: None,
                ..binance.clone()
            },
            ExchangeConfig {
                name: Exchange::Okx,
                rest_endpoint: None,
                ..binance
            },
        ];
        let metrics = Arc::new(Metrics::new().unwrap());
        let queue = Arc::new(DurableQueue::new(
            Arc::new(MemoryBackend::new()),
            "test",
            100,
            metrics.clone(),
        ));
        let pipeline = Pipeline::new(config, queue, metrics);

        for (exchange, policy) in [
            (Exchange::Binance, SequencePolicy::Range),
            (Exchange::Bybit, SequencePolicy::Consecutive),
            (Exchange::Okx, SequencePolicy::Chained),
        ] {
            assert_eq!(pipeline.engine(exchange).unwrap().policy(), policy);
        }
    }

    #[tokio::test]
    async fn test_emit_snapshots_only_for_synced_books() {
        let pipeline = pipeline(false);
        let engine = pipeline.engine(Exchange::Binance).unwrap();
        engine
            .apply_snapshot(&BookSnapshot {
                symbol: "BTCUSDT".to_string(),
                event_time: 1,
                sequence: 5,
                bids: vec![PriceLevel::new(dec!(100), dec!(1))],
                asks: vec![PriceLevel::new(dec!(101), dec!(1))],
            })
            .await;
        engine.begin_resync("ETHUSDT").await;

        assert_eq!(pipeline.emit_snapshots().await, 1);
        let queue = pipeline.queue();
        assert_eq!(
            queue.size(Exchange::Binance, MessageKind::OrderbookSnapshot).await.unwrap(),
            1
        );
        assert!(queue.latest_orderbook_snapshot("BTCUSDT").await.unwrap().is_some());
        assert!(queue.latest_orderbook_snapshot("ETHUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_with_no_tasks() {
        let pipeline = pipeline(false);
        assert!(pipeline.engine(Exchange::Okx).is_none());
        let _events = pipeline.subscribe();
        pipeline.shutdown().await;
    }
}
