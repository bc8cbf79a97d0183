//! HTTP health and metrics endpoints

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{IngestError, Result};
use crate::exchange::Exchange;
use crate::metrics::Metrics;
use crate::queue::DurableQueue;
use crate::websocket::ConnectionState;

/// Shared state behind the health endpoints
pub struct HealthState {
    pub metrics: Arc<Metrics>,
    pub queue: Arc<DurableQueue>,
    pub connections: Vec<(Exchange, watch::Receiver<ConnectionState>)>,
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/queue", get(queue_depths))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` flips
pub async fn serve(
    bind_addr: &str,
    state: Arc<HealthState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| IngestError::ConfigError(format!("invalid health_bind_addr '{bind_addr}': {e}")))?;
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

async fn health_check(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    let mut connections = BTreeMap::new();
    let mut degraded = false;
    for (exchange, rx) in &state.connections {
        let current = *rx.borrow();
        degraded |= current == ConnectionState::Degraded;
        connections.insert(exchange.as_str(), current);
    }

    let status = if degraded { "degraded" } else { "healthy" };
    let code = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(json!({
            "status": status,
            "component": "market-ingest",
            "connections": connections,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn metrics(State(state): State<Arc<HealthState>>) -> (StatusCode, String) {
    match state.metrics.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn queue_depths(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    match state.queue.size_all().await {
        Ok(depths) => {
            let mut body: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
            for ((exchange, kind), depth) in depths {
                body.entry(exchange.as_str())
                    .or_default()
                    .insert(kind.as_str(), depth);
            }
            (StatusCode::OK, Json(json!(body)))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}
