//! Exchange connection management

mod client;
mod manager;

pub use client::{Inbound, WebSocketClient};
pub use manager::{reconnect_delay, ConnectionManager};

use serde::Serialize;

/// Lifecycle of one exchange connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; still retrying at the maximum delay
    Degraded,
    /// Shut down on request
    Closed,
}

impl ConnectionState {
    /// Numeric value exported as the connection state gauge
    pub fn code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Degraded => 4,
            ConnectionState::Closed => 5,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Closed)
    }
}
