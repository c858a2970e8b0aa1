//! Beach call switchboard: a relay that keeps the roster of reachable
//! endpoints and routes offers, answers and network candidates between them.

pub mod config;
pub mod negotiation;
pub mod probe;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod websocket;

use std::{future::Future, time::Instant};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use switchboard_core::EndpointId;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::negotiation::NegotiationState;
use crate::registry::{EndpointSnapshot, SessionRegistry};
use crate::router::SignalingRouter;
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub router: SignalingRouter,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(router: SignalingRouter, metrics: Option<PrometheusHandle>) -> Self {
        Self { router, metrics }
    }

    fn stats(&self) -> StatsResponse {
        let endpoints = self.router.registry().snapshot();
        let now = Instant::now();
        let calls: Vec<CallStatsEntry> = self
            .router
            .negotiations()
            .snapshot()
            .into_iter()
            .map(|negotiation| CallStatsEntry {
                id: negotiation.id,
                caller: negotiation.caller,
                callee: negotiation.callee,
                state: negotiation.state,
                age_ms: now.saturating_duration_since(negotiation.offered_at).as_millis() as u64,
            })
            .collect();
        StatsResponse {
            active_endpoints: endpoints.len(),
            negotiations: calls.len(),
            endpoints,
            calls,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_endpoints: usize,
    negotiations: usize,
    endpoints: Vec<EndpointSnapshot>,
    calls: Vec<CallStatsEntry>,
}

#[derive(Debug, Serialize)]
struct CallStatsEntry {
    id: Uuid,
    caller: EndpointId,
    callee: EndpointId,
    state: NegotiationState,
    age_ms: u64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    config: RelayConfig,
    metrics: Option<PrometheusHandle>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = SignalingRouter::new(SessionRegistry::new(), config.offer_timeout);
    let reaper = router.spawn_reaper(config.sweep_interval, config.idle_timeout);
    let app = build_router(AppState::new(router, metrics));

    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(
        %local_addr,
        offer_timeout_secs = config.offer_timeout.map(|timeout| timeout.as_secs()).unwrap_or(0),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "beach-switchboard listening"
    );

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error");
    reaper.abort();
    result
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            String::from("metrics recorder not installed\n"),
        ),
    }
}
