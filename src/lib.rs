//! Market Ingest Library
//!
//! Connects to exchange WebSocket streams, normalizes trades, depth, klines
//! and liquidations, reconstructs local order books, buffers everything in a
//! bounded durable queue and drains it in batches to a time-series store.

pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod health;
pub mod metrics;
pub mod orderbook;
pub mod persistence;
pub mod pipeline;
pub mod queue;
pub mod symbol;
pub mod websocket;

pub use config::Config;
pub use error::{IngestError, Result};
pub use events::MarketEvent;
pub use exchange::{Exchange, ExchangeAdapter};
pub use metrics::Metrics;
pub use orderbook::{OrderBook, OrderBookEngine};
pub use pipeline::Pipeline;
pub use queue::{DurableQueue, MessageKind, QueueMessage};
