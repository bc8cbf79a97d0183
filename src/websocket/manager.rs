//! Exchange connection manager
//!
//! Owns one WebSocket connection: reconnection with capped exponential
//! backoff, keep-alive, frame parsing and dispatch to the order book engine
//! and the durable queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use super::{ConnectionState, Inbound, WebSocketClient};
use crate::config::ExchangeConfig;
use crate::error::{IngestError, Result};
use crate::events::MarketEvent;
use crate::exchange::{Exchange, ExchangeAdapter, Frame, ResyncRequest, StreamKind};
use crate::metrics::Metrics;
use crate::orderbook::{OrderBookEngine, UpdateOutcome};
use crate::queue::{DurableQueue, Payload, QueueMessage};

/// Backoff exponent cap; the delay stops doubling after 2^6 x base
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// REST snapshot request timeout
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before reconnect attempt `attempt` (1-based)
pub fn reconnect_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.pow(attempt.min(MAX_BACKOFF_EXPONENT));
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

/// Failed snapshot fetches of one symbol
#[derive(Debug, Clone, Copy)]
struct SnapshotRetry {
    failures: u32,
    retry_at: Instant,
}

enum Step {
    Shutdown,
    Heartbeat,
    PongOverdue,
    Inbound(Result<Inbound>),
}

/// Manages one exchange connection with automatic reconnection
pub struct ConnectionManager<A: ExchangeAdapter> {
    adapter: Arc<A>,
    config: ExchangeConfig,
    engine: Arc<OrderBookEngine>,
    queue: Arc<DurableQueue>,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<(Exchange, MarketEvent)>,
    state_tx: watch::Sender<ConnectionState>,
    http: reqwest::Client,
    client: WebSocketClient,
    push_timeout: Duration,
    persist_updates: bool,
    snapshot_depth: usize,
    reconnect_attempts: u32,
    connected_at: Option<Instant>,
    snapshot_retries: HashMap<String, SnapshotRetry>,
}

impl<A: ExchangeAdapter> ConnectionManager<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: A,
        config: ExchangeConfig,
        engine: Arc<OrderBookEngine>,
        queue: Arc<DurableQueue>,
        metrics: Arc<Metrics>,
        events: broadcast::Sender<(Exchange, MarketEvent)>,
        push_timeout: Duration,
        persist_updates: bool,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let http = reqwest::Client::builder()
            .timeout(SNAPSHOT_TIMEOUT)
            .build()
            .unwrap_or_default();
        let snapshot_depth = engine.max_depth();

        Self {
            adapter: Arc::new(adapter),
            config,
            engine,
            queue,
            metrics,
            events,
            state_tx,
            http,
            client: WebSocketClient::new(),
            push_timeout,
            persist_updates,
            snapshot_depth,
            reconnect_attempts: 0,
            connected_at: None,
            snapshot_retries: HashMap::new(),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.adapter.exchange()
    }

    /// Watch connection state transitions
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(exchange = %self.exchange(), from = ?previous, to = ?state, "Connection state changed");
        }
        self.metrics.set_connection_state(self.exchange(), state.code());
        let since = (state == ConnectionState::Connected).then(|| chrono::Utc::now().timestamp());
        self.metrics.set_connected_since(self.exchange(), since);
    }

    /// Run until `shutdown` flips, reconnecting forever
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            exchange = %self.exchange(),
            symbols = ?self.config.symbols,
            streams = ?self.config.streams,
            "Starting connection manager"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            match self.connect_and_process(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    error!(exchange = %self.exchange(), error = %e, "Connection lost");
                    self.metrics.record_error(self.exchange().as_str(), "connection");
                    self.metrics.record_reconnect(self.exchange());
                    self.client.close().await;

                    // Only a connection that stayed up long enough clears the
                    // attempt counter, so a server that accepts and then drops
                    // us still ends up degraded
                    if let Some(since) = self.connected_at.take() {
                        if since.elapsed() >= self.config.reconnect_reset_window() {
                            if self.reconnect_attempts > 0 {
                                info!(
                                    exchange = %self.exchange(),
                                    previous_attempts = self.reconnect_attempts,
                                    "Connection was stable, resetting reconnect attempts"
                                );
                            }
                            self.reconnect_attempts = 0;
                        }
                    }

                    self.reconnect_attempts += 1;
                    let degraded = self.reconnect_attempts > self.config.max_reconnect_attempts;
                    let delay = if degraded {
                        self.set_state(ConnectionState::Degraded);
                        Duration::from_millis(self.config.max_reconnect_delay_ms)
                    } else {
                        self.set_state(ConnectionState::Reconnecting);
                        reconnect_delay(
                            self.config.reconnect_delay_ms,
                            self.config.max_reconnect_delay_ms,
                            self.reconnect_attempts,
                        )
                    };

                    warn!(
                        exchange = %self.exchange(),
                        attempt = self.reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        degraded,
                        "Reconnecting after error..."
                    );

                    let stop = tokio::select! {
                        _ = sleep(delay) => false,
                        _ = shutdown.changed() => true,
                    };
                    if stop {
                        break;
                    }
                }
            }
        }

        self.client.close().await;
        self.set_state(ConnectionState::Closed);
        info!(exchange = %self.exchange(), "Connection manager stopped");
    }

    /// Connect, subscribe and process frames. Returns `Ok` only on shutdown.
    async fn connect_and_process(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let url = self.adapter.stream_url(&self.config.symbols, &self.config.streams);
        self.client.connect(&url).await?;
        for message in self.adapter.subscribe_messages(&self.config.symbols, &self.config.streams) {
            self.client.send_text(&message).await?;
        }

        self.connected_at = Some(Instant::now());
        self.set_state(ConnectionState::Connected);

        // Stream continuity is lost across connections
        self.engine.invalidate_all().await;
        if self.config.wants(&StreamKind::Depth) {
            for symbol in self.config.symbols.clone() {
                if self.adapter.resync_request(&symbol) == ResyncRequest::FetchSnapshot {
                    self.resync(&symbol).await?;
                }
            }
        }

        let heartbeat_every = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let step = tokio::select! {
                _ = shutdown.changed() => Step::Shutdown,
                _ = heartbeat.tick() => Step::Heartbeat,
                _ = wait_until(pong_deadline) => Step::PongOverdue,
                inbound = self.client.recv() => Step::Inbound(inbound),
            };

            match step {
                Step::Shutdown => return Ok(()),
                Step::Heartbeat => {
                    self.client.ping(&self.adapter.ping_payload()).await?;
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout());
                    }
                }
                Step::PongOverdue => {
                    warn!(exchange = %self.exchange(), "Pong overdue, forcing reconnect");
                    return Err(IngestError::HeartbeatTimeout(self.config.pong_timeout()));
                }
                Step::Inbound(inbound) => match inbound? {
                    Inbound::Text(text) => {
                        if self.handle_text(&text).await? {
                            pong_deadline = None;
                        }
                    }
                    Inbound::Pong => pong_deadline = None,
                    Inbound::Other => {}
                },
            }
        }
    }

    /// Process one text frame. Returns true if it answered our ping.
    async fn handle_text(&mut self, text: &str) -> Result<bool> {
        match self.adapter.parse_frame(text) {
            Ok(Frame::Events(events)) => {
                for event in events {
                    self.handle_event(event).await?;
                }
                Ok(false)
            }
            Ok(Frame::Pong) => Ok(true),
            Ok(Frame::Control) => {
                debug!(exchange = %self.exchange(), message = %text, "Control message");
                Ok(false)
            }
            Ok(Frame::Unrecognized) => {
                trace!(exchange = %self.exchange(), message = %text, "Unknown message type");
                Ok(false)
            }
            Err(e) => {
                warn!(exchange = %self.exchange(), error = %e, "Failed to parse message");
                self.metrics.record_error(self.exchange().as_str(), "parse");
                Ok(false)
            }
        }
    }

    async fn handle_event(&mut self, event: MarketEvent) -> Result<()> {
        let exchange = self.exchange();
        self.metrics.record_received(exchange, event.label());
        if self.events.receiver_count() > 0 {
            let _ = self.events.send((exchange, event.clone()));
        }

        match event {
            MarketEvent::DepthDiff(diff) => match self.engine.apply_update(&diff).await {
                UpdateOutcome::Applied => {
                    if self.persist_updates {
                        self.enqueue(Payload::OrderbookUpdate(diff)).await;
                    }
                }
                UpdateOutcome::ResyncRequired(_) => self.resync(&diff.symbol).await?,
                UpdateOutcome::Stale | UpdateOutcome::Discarded => {}
            },
            MarketEvent::BookSnapshot(snapshot) => self.engine.apply_snapshot(&snapshot).await,
            other => self.enqueue(Payload::from(other)).await,
        }
        Ok(())
    }

    /// Queue a message without ever blocking ingestion for long
    async fn enqueue(&self, payload: Payload) {
        let message = QueueMessage::new(self.exchange(), payload);
        match timeout(self.push_timeout, self.queue.push(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(exchange = %self.exchange(), kind = %message.kind(), error = %e, "Queue push failed, dropping event");
                self.metrics.record_error(self.exchange().as_str(), "queue_push");
            }
            Err(_) => {
                warn!(exchange = %self.exchange(), kind = %message.kind(), "Queue push timed out, dropping event");
                self.metrics.record_error(self.exchange().as_str(), "queue_push");
            }
        }
    }

    /// Obtain a fresh snapshot for `symbol`. Errors only when the connection
    /// itself fails.
    async fn resync(&mut self, symbol: &str) -> Result<()> {
        match self.adapter.resync_request(symbol) {
            ResyncRequest::FetchSnapshot => self.fetch_snapshot(symbol).await,
            ResyncRequest::Resubscribe { unsubscribe, subscribe } => {
                self.metrics.record_resync(self.exchange());
                self.engine.begin_resync(symbol).await;
                info!(exchange = %self.exchange(), symbol = %symbol, "Resubscribing order book");
                self.client.send_text(&unsubscribe).await?;
                self.client.send_text(&subscribe).await?;
            }
        }
        Ok(())
    }

    /// Fetch a REST snapshot unless an earlier failure is still backing off.
    /// While backing off the book stays awaiting a snapshot and the next diff
    /// after the deadline triggers the retry.
    async fn fetch_snapshot(&mut self, symbol: &str) {
        if let Some(retry) = self.snapshot_retries.get(symbol) {
            if Instant::now() < retry.retry_at {
                trace!(exchange = %self.exchange(), symbol = %symbol, "Snapshot retry backing off");
                self.engine.resync_failed(symbol).await;
                return;
            }
        }

        self.metrics.record_resync(self.exchange());
        self.engine.begin_resync(symbol).await;
        info!(exchange = %self.exchange(), symbol = %symbol, "Fetching order book snapshot");
        match self
            .adapter
            .fetch_snapshot(&self.http, symbol, self.snapshot_depth)
            .await
        {
            Ok(snapshot) => {
                self.snapshot_retries.remove(symbol);
                self.engine.apply_snapshot(&snapshot).await;
            }
            Err(e) => {
                let failures = self
                    .snapshot_retries
                    .get(symbol)
                    .map_or(1, |retry| retry.failures.saturating_add(1));
                let delay = reconnect_delay(
                    self.config.reconnect_delay_ms,
                    self.config.max_reconnect_delay_ms,
                    failures,
                );
                warn!(
                    exchange = %self.exchange(),
                    symbol = %symbol,
                    error = %e,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Snapshot fetch failed"
                );
                self.metrics.record_error(self.exchange().as_str(), "snapshot");
                self.snapshot_retries.insert(
                    symbol.to_string(),
                    SnapshotRetry {
                        failures,
                        retry_at: Instant::now() + delay,
                    },
                );
                self.engine.resync_failed(symbol).await;
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
