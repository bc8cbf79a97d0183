//! Prometheus metrics for the ingestion pipeline
//!
//! Everything is registered on one explicitly constructed [`Registry`] that
//! is shared through an `Arc`; nothing touches the prometheus default
//! registry.

use std::collections::BTreeMap;

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::Result;
use crate::exchange::Exchange;
use crate::queue::MessageKind;

pub struct Metrics {
    registry: Registry,
    received: IntCounterVec,
    queued: IntCounterVec,
    evicted: IntCounterVec,
    flushed: IntCounterVec,
    errors: IntCounterVec,
    reconnects: IntCounterVec,
    resyncs: IntCounterVec,
    connection_state: IntGaugeVec,
    connected_since: IntGaugeVec,
    queue_depth: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("ingest".to_string()), None)?;

        let received = counter(&registry, "events_received_total", "Parsed events per exchange and kind", &["exchange", "kind"])?;
        let queued = counter(&registry, "events_queued_total", "Messages pushed to the durable queue", &["exchange", "kind"])?;
        let evicted = counter(&registry, "queue_evicted_total", "Messages dropped by drop-oldest eviction", &["exchange", "kind"])?;
        let flushed = counter(&registry, "rows_flushed_total", "Messages persisted by the drain loops", &["exchange", "kind"])?;
        let errors = counter(&registry, "errors_total", "Errors by pipeline stage", &["exchange", "stage"])?;
        let reconnects = counter(&registry, "reconnects_total", "WebSocket reconnect attempts", &["exchange"])?;
        let resyncs = counter(&registry, "orderbook_resyncs_total", "Order book resynchronizations", &["exchange"])?;
        let connection_state = gauge(&registry, "connection_state", "Connection state code (see ConnectionState)", &["exchange"])?;
        let connected_since = gauge(&registry, "connected_since_seconds", "Unix time the current connection was established, 0 when down", &["exchange"])?;
        let queue_depth = gauge(&registry, "queue_depth", "Durable queue length", &["exchange", "kind"])?;

        Ok(Self {
            registry,
            received,
            queued,
            evicted,
            flushed,
            errors,
            reconnects,
            resyncs,
            connection_state,
            connected_since,
            queue_depth,
        })
    }

    pub fn record_received(&self, exchange: Exchange, kind: &str) {
        self.received.with_label_values(&[exchange.as_str(), kind]).inc();
    }

    pub fn record_queued(&self, exchange: Exchange, kind: MessageKind, count: usize) {
        self.queued
            .with_label_values(&[exchange.as_str(), kind.as_str()])
            .inc_by(count as u64);
    }

    pub fn record_evicted(&self, exchange: Exchange, kind: MessageKind, count: usize) {
        self.evicted
            .with_label_values(&[exchange.as_str(), kind.as_str()])
            .inc_by(count as u64);
    }

    pub fn record_flushed(&self, exchange: Exchange, kind: MessageKind, count: u64) {
        self.flushed
            .with_label_values(&[exchange.as_str(), kind.as_str()])
            .inc_by(count);
    }

    /// `exchange` is `"all"` for errors not tied to one venue
    pub fn record_error(&self, exchange: &str, stage: &str) {
        self.errors.with_label_values(&[exchange, stage]).inc();
    }

    pub fn record_reconnect(&self, exchange: Exchange) {
        self.reconnects.with_label_values(&[exchange.as_str()]).inc();
    }

    pub fn record_resync(&self, exchange: Exchange) {
        self.resyncs.with_label_values(&[exchange.as_str()]).inc();
    }

    pub fn set_connection_state(&self, exchange: Exchange, code: i64) {
        self.connection_state
            .with_label_values(&[exchange.as_str()])
            .set(code);
    }

    /// Unix seconds of the current connection, or `None` when disconnected
    pub fn set_connected_since(&self, exchange: Exchange, since: Option<i64>) {
        self.connected_since
            .with_label_values(&[exchange.as_str()])
            .set(since.unwrap_or(0));
    }

    pub fn set_queue_depth(&self, exchange: Exchange, kind: MessageKind, depth: usize) {
        self.queue_depth
            .with_label_values(&[exchange.as_str(), kind.as_str()])
            .set(depth as i64);
    }

    pub fn set_queue_depths(&self, depths: &BTreeMap<(Exchange, MessageKind), usize>) {
        for ((exchange, kind), depth) in depths {
            self.set_queue_depth(*exchange, *kind, *depth);
        }
    }

    pub fn received(&self, exchange: Exchange, kind: &str) -> u64 {
        self.received.with_label_values(&[exchange.as_str(), kind]).get()
    }

    pub fn flushed(&self, exchange: Exchange, kind: MessageKind) -> u64 {
        self.flushed
            .with_label_values(&[exchange.as_str(), kind.as_str()])
            .get()
    }

    pub fn evicted(&self, exchange: Exchange, kind: MessageKind) -> u64 {
        self.evicted
            .with_label_values(&[exchange.as_str(), kind.as_str()])
            .get()
    }

    pub fn errors(&self, exchange: &str, stage: &str) -> u64 {
        self.errors.with_label_values(&[exchange, stage]).get()
    }

    pub fn reconnects(&self, exchange: Exchange) -> u64 {
        self.reconnects.with_label_values(&[exchange.as_str()]).get()
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::IngestError::MetricsError(e.to_string()))
    }
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntGaugeVec> {
    let g = IntGaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}
