//! Error types for the ingestion pipeline

use thiserror::Error;

use crate::symbol::SymbolError;

/// Ingestion pipeline errors
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Symbol error: {0}")]
    Symbol(#[from] SymbolError),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("{exchange} does not serve order book snapshots over REST")]
    SnapshotUnsupported { exchange: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("No pong received within {0:?}")]
    HeartbeatTimeout(std::time::Duration),
}

impl From<tokio_tungstenite::tungstenite::Error> for IngestError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        IngestError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::RestApiError(err.to_string())
    }
}

impl From<redis::RedisError> for IngestError {
    fn from(err: redis::RedisError) -> Self {
        IngestError::QueueError(err.to_string())
    }
}

impl From<tokio_postgres::Error> for IngestError {
    fn from(err: tokio_postgres::Error) -> Self {
        IngestError::StoreError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for IngestError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        IngestError::SerializationError(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for IngestError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        IngestError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for IngestError {
    fn from(err: config::ConfigError) -> Self {
        IngestError::ConfigError(err.to_string())
    }
}

impl From<prometheus::Error> for IngestError {
    fn from(err: prometheus::Error) -> Self {
        IngestError::MetricsError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
