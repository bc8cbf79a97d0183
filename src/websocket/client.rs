//! WebSocket client for a single exchange stream
//!
//! Handles connection, outbound text frames, keep-alive pings and message
//! reception.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, Result};
use crate::exchange::PingPayload;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake budget, including TLS
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// One received frame, reduced to what the connection manager cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// WebSocket-level pong
    Pong,
    /// Ping, raw frame or anything else without payload for us
    Other,
}

/// WebSocket client for a single connection
#[derive(Default)]
pub struct WebSocketClient {
    stream: Option<WsStream>,
}

impl WebSocketClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to `url`, replacing any previous stream
    pub async fn connect(&mut self, url: &str) -> Result<()> {
        self.close().await;
        info!(url = %url, "Connecting to WebSocket");

        let (ws_stream, response) = timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| IngestError::ConnectionTimeout)?
            .map_err(|e| IngestError::WebSocketConnection(format!("Failed to connect: {}", e)))?;

        info!(status = ?response.status(), "WebSocket connected");
        self.stream = Some(ws_stream);

        Ok(())
    }

    fn stream(&mut self) -> Result<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| IngestError::WebSocketConnection("Not connected".to_string()))
    }

    /// Send a text frame
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        debug!(len = text.len(), "Sending text frame");
        self.stream()?
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| IngestError::WebSocketMessage(e.to_string()))
    }

    /// Send a keep-alive in the exchange's format
    pub async fn ping(&mut self, payload: &PingPayload) -> Result<()> {
        let message = match payload {
            PingPayload::Text(text) => Message::Text(text.clone()),
            PingPayload::WebSocketPing => Message::Ping(vec![]),
        };
        self.stream()?
            .send(message)
            .await
            .map_err(|e| IngestError::WebSocketMessage(e.to_string()))
    }

    /// Receive the next message. Errors mean the connection is gone.
    pub async fn recv(&mut self) -> Result<Inbound> {
        let stream = self.stream()?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Inbound::Text(text)),
            Some(Ok(Message::Binary(data))) => {
                Ok(Inbound::Text(String::from_utf8_lossy(&data).into_owned()))
            }
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Err(e) = stream.send(Message::Pong(data)).await {
                    warn!(error = %e, "Failed to answer ping");
                }
                Ok(Inbound::Other)
            }
            Some(Ok(Message::Pong(_))) => Ok(Inbound::Pong),
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(IngestError::WebSocketConnection(
                    "Connection closed".to_string(),
                ))
            }
            Some(Ok(Message::Frame(_))) => Ok(Inbound::Other),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(IngestError::WebSocketMessage(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(IngestError::WebSocketConnection(
                    "Stream ended".to_string(),
                ))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
