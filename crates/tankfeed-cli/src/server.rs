//! HTTP servers for the live channel, health and metrics endpoints.

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tankfeed_core::broadcast::{ChannelSink, Frame, InboundMessage};
use tankfeed_core::engine::IngestionEngine;
use tankfeed_core::health::{ComponentReport, HealthStatus};
use tankfeed_core::source::SourceStatus;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub engine: Arc<IngestionEngine>,
}

/// Health response structure.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentReport>,
    pub sources: Vec<SourceStatus>,
    pub subscribers: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Bound listeners, acquired before the engine starts so bind failures are
/// reported up front.
pub struct Listeners {
    live: TcpListener,
    health: TcpListener,
    metrics: TcpListener,
}

async fn bind(host: &str, port: u16, name: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind {} server on {}:{}", name, host, port))?;
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(server = name, address = ?addr, "Server listening");
    Ok(listener)
}

/// Bind the live channel, health and metrics listeners.
pub async fn bind_all(state: &ServerState) -> Result<Listeners> {
    let config = state.engine.config();
    let host = config.server.bind_address.as_str();
    Ok(Listeners {
        live: bind(host, config.server.port, "live").await?,
        health: bind(host, config.monitoring.health_port, "health").await?,
        metrics: bind(host, config.monitoring.metrics_port, "metrics").await?,
    })
}

/// Serve every router until shutdown or until one of them fails.
pub async fn serve(
    state: Arc<ServerState>,
    listeners: Listeners,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let live = axum::serve(listeners.live, live_router(Arc::clone(&state)));
    let health = axum::serve(listeners.health, health_router(Arc::clone(&state)));
    let metrics = axum::serve(listeners.metrics, metrics_router(state));

    tokio::select! {
        result = live => result.context("Live channel server error")?,
        result = health => result.context("Health server error")?,
        result = metrics => result.context("Metrics server error")?,
        _ = shutdown_rx.recv() => {
            info!("HTTP servers shutting down");
        }
    }
    Ok(())
}

pub fn live_router(state: Arc<ServerState>) -> Router {
    let path = state.engine.config().server.path.clone();
    Router::new()
        .route(&path, get(live_handler))
        .with_state(state)
}

pub fn health_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

pub fn metrics_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn live_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bridge one WebSocket to the hub: hub frames go out through a bounded
/// channel, inbound traffic refreshes liveness.
async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let hub = Arc::clone(state.engine.hub());
    let (sink, mut frames) = ChannelSink::new(state.engine.config().broadcast.subscriber_buffer);

    let id = match hub.subscribe(sink) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Failed to register subscriber");
            return;
        }
    };

    let (mut outbound, mut inbound) = socket.split();

    let writer = async {
        while let Some(frame) = frames.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text.to_string()),
                Frame::Ping => Message::Ping(Vec::new()),
                Frame::Close => {
                    let _ = outbound.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = outbound.send(message).await {
                debug!(subscriber_id = id, error = %e, "Socket write failed");
                break;
            }
        }
    };

    let reader = async {
        while let Some(message) = inbound.next().await {
            match message {
                Ok(Message::Pong(_)) => hub.acknowledge(id),
                Ok(Message::Text(text)) => match InboundMessage::parse(&text) {
                    Some(InboundMessage::Pong) => hub.acknowledge(id),
                    _ => hub.touch(id),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => hub.touch(id),
                Err(e) => {
                    debug!(subscriber_id = id, error = %e, "Socket read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    hub.unsubscribe(id);
}

/// Health endpoint handler.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let engine = &state.engine;
    let overall = engine.health().overall_status();

    let response = HealthResponse {
        status: overall,
        components: engine.health().get_all_statuses(),
        sources: engine.registry().status(),
        subscribers: engine.hub().subscriber_count(),
        last_sync: engine.hub().last_sync(),
    };

    let status_code = match overall {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

/// Kubernetes liveness probe handler.
async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.engine.health().overall_status() != HealthStatus::Unhealthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Kubernetes readiness probe handler.
async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.engine.health().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.engine.metrics().export_prometheus_text(),
    )
}

/// Log a server failure without tearing down the engine.
pub fn report(result: Result<()>) {
    if let Err(e) = result {
        error!(error = format!("{:#}", e), "HTTP server stopped");
    }
}
