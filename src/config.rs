//! Configuration for the ingestion pipeline
//!
//! Loaded once at startup from an optional file (`INGEST_CONFIG`, default
//! `config/ingest.{toml,yaml,json}`) overlaid with `INGEST__*` environment
//! variables, e.g. `INGEST__QUEUE__URL=redis://cache:6379`. The resulting
//! [`Config`] is immutable and handed to constructors explicitly.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{IngestError, Result};
use crate::exchange::{Exchange, MarketType, StreamKind};
use crate::symbol;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchanges: Vec<ExchangeConfig>,
    pub queue: QueueConfig,
    pub persistence: PersistenceConfig,
    pub orderbook: OrderBookConfig,
    /// Address of the health/metrics server
    pub health_bind_addr: String,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
}

/// One exchange connection
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub name: Exchange,
    #[serde(default)]
    pub market: MarketType,
    pub ws_endpoint: String,
    /// REST base URL; required when the exchange resyncs over REST
    #[serde(default)]
    pub rest_endpoint: Option<String>,
    /// Symbols in any supported notation; normalized by [`Config::validate`]
    pub symbols: Vec<String>,
    pub streams: Vec<StreamKind>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    /// Attempts before the connection is reported as degraded
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Uptime after which a connection counts as stable and the attempt
    /// counter starts over
    #[serde(default = "default_reconnect_reset_secs")]
    pub reconnect_reset_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// `redis://...` or `memory://`
    pub url: String,
    pub key_prefix: String,
    /// Hard bound of every (exchange, kind) list
    pub max_depth: usize,
    /// Upper bound for one push before the event is dropped
    pub push_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// PostgreSQL connection string; drain loops are disabled when unset
    pub database_url: Option<String>,
    pub flush_batch_size: usize,
    pub flush_interval_ms: u64,
    /// Backlog check interval, shorter than the flush interval
    pub backlog_check_interval_ms: u64,
    /// Budget for the final flush on shutdown
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderBookConfig {
    /// Levels kept per side
    pub max_depth: usize,
    /// Periodic snapshot timer
    pub snapshot_interval_secs: u64,
    /// Levels per side in periodic snapshots
    pub snapshot_levels: usize,
    /// Queue every applied diff as an orderbook_update
    pub persist_updates: bool,
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_pong_timeout_secs() -> u64 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    60_000
}

fn default_reconnect_reset_secs() -> u64 {
    300
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "ingest".to_string(),
            max_depth: 100_000,
            push_timeout_ms: 250,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            flush_batch_size: 1000,
            flush_interval_ms: 5000,
            backlog_check_interval_ms: 500,
            shutdown_grace_secs: 10,
        }
    }
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            max_depth: 1000,
            snapshot_interval_secs: 60,
            snapshot_levels: 20,
            persist_updates: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchanges: vec![ExchangeConfig::binance_default()],
            queue: QueueConfig::default(),
            persistence: PersistenceConfig::default(),
            orderbook: OrderBookConfig::default(),
            health_bind_addr: "0.0.0.0:9090".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl ExchangeConfig {
    fn binance_default() -> Self {
        Self {
            name: Exchange::Binance,
            market: MarketType::Spot,
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: Some("https://api.binance.com/api/v3".to_string()),
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            streams: vec![StreamKind::Trade, StreamKind::Depth],
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_reset_secs: default_reconnect_reset_secs(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn reconnect_reset_window(&self) -> Duration {
        Duration::from_secs(self.reconnect_reset_secs)
    }

    pub fn wants(&self, stream: &StreamKind) -> bool {
        self.streams.contains(stream)
    }
}

impl Config {
    /// Load from the optional config file and `INGEST__*` environment
    /// variables, then validate
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var("INGEST_CONFIG").unwrap_or_else(|_| "config/ingest".to_string());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("INGEST")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()
    }

    /// Normalize symbols and reject unusable settings
    pub fn validate(mut self) -> Result<Self> {
        if self.exchanges.is_empty() {
            return Err(IngestError::ConfigError("no exchanges configured".to_string()));
        }
        if self.queue.max_depth == 0 {
            return Err(IngestError::ConfigError("queue.max_depth must be positive".to_string()));
        }
        if self.persistence.flush_batch_size == 0 || self.persistence.flush_interval_ms == 0 {
            return Err(IngestError::ConfigError(
                "persistence flush batch size and interval must be positive".to_string(),
            ));
        }
        if self.orderbook.max_depth == 0 || self.orderbook.snapshot_interval_secs == 0 {
            return Err(IngestError::ConfigError(
                "orderbook.max_depth and snapshot_interval_secs must be positive".to_string(),
            ));
        }

        let mut seen = Vec::new();
        for exchange in &mut self.exchanges {
            if seen.contains(&exchange.name) {
                return Err(IngestError::ConfigError(format!(
                    "exchange {} configured twice",
                    exchange.name
                )));
            }
            seen.push(exchange.name);

            if exchange.symbols.is_empty() || exchange.streams.is_empty() {
                return Err(IngestError::ConfigError(format!(
                    "{}: symbols and streams must not be empty",
                    exchange.name
                )));
            }
            if exchange.heartbeat_interval_secs == 0 || exchange.reconnect_delay_ms == 0 {
                return Err(IngestError::ConfigError(format!(
                    "{}: heartbeat interval and reconnect delay must be positive",
                    exchange.name
                )));
            }
            if exchange.name == Exchange::Binance
                && exchange.wants(&StreamKind::Depth)
                && exchange.rest_endpoint.is_none()
            {
                return Err(IngestError::ConfigError(
                    "binance depth streams need rest_endpoint for snapshots".to_string(),
                ));
            }

            let mut symbols = Vec::with_capacity(exchange.symbols.len());
            for raw in &exchange.symbols {
                let normalized = symbol::normalize(raw)?;
                if !symbols.contains(&normalized) {
                    symbols.push(normalized);
                }
            }
            exchange.symbols = symbols;
            exchange.max_reconnect_delay_ms =
                exchange.max_reconnect_delay_ms.max(exchange.reconnect_delay_ms);
        }

        Ok(self)
    }

    pub fn exchange_names(&self) -> Vec<Exchange> {
        self.exchanges.iter().map(|e| e.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(name: Exchange, symbols: &[&str]) -> ExchangeConfig {
        ExchangeConfig {
            name,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..ExchangeConfig::binance_default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default().validate().unwrap();
        assert_eq!(config.orderbook.snapshot_interval_secs, 60);
        assert_eq!(config.exchange_names(), vec![Exchange::Binance]);
    }

    #[test]
    fn test_validate_normalizes_symbols() {
        let config = Config {
            exchanges: vec![exchange(Exchange::Okx, &["btc-usdt", "BTC/USDT", "eth_usdc"])],
            ..Config::default()
        }
        .validate()
        .unwrap();
        assert_eq!(config.exchanges[0].symbols, vec!["BTCUSDT", "ETHUSDC"]);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let bad_symbol = Config {
            exchanges: vec![exchange(Exchange::Bybit, &["BTCXYZ"])],
            ..Config::default()
        };
        assert!(bad_symbol.validate().is_err());

        let unknown_quote = Config {
            exchanges: vec![exchange(Exchange::Okx, &["ABC/XYZ"])],
            ..Config::default()
        };
        assert!(unknown_quote.validate().is_err());

        let duplicate = Config {
            exchanges: vec![
                exchange(Exchange::Bybit, &["BTCUSDT"]),
                exchange(Exchange::Bybit, &["ETHUSDT"]),
            ],
            ..Config::default()
        };
        assert!(duplicate.validate().is_err());

        let mut zero_batch = Config::default();
        zero_batch.persistence.flush_batch_size = 0;
        assert!(zero_batch.validate().is_err());

        let mut no_rest = Config::default();
        no_rest.exchanges[0].rest_endpoint = None;
        assert!(no_rest.validate().is_err());
    }

    #[test]
    fn test_deserialize_exchange_with_defaults() {
        let raw = r#"{
            "name": "bybit",
            "market": "perpetual",
            "ws_endpoint": "wss://stream.bybit.com/v5/public/linear",
            "symbols": ["BTCUSDT"],
            "streams": ["trade", "depth", "kline_1h", "liquidation"]
        }"#;
        let exchange: ExchangeConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(exchange.name, Exchange::Bybit);
        assert_eq!(exchange.market, MarketType::Perpetual);
        assert_eq!(exchange.streams[2], StreamKind::Kline("1h".to_string()));
        assert_eq!(exchange.heartbeat_interval_secs, 20);
        assert_eq!(exchange.rest_endpoint, None);
    }
}
