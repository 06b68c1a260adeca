use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::pipe::{
    telemetry::{self, TrafficRecord, TrafficTotals},
    tunnel::{forwards::ForwardRegistry, pending::PendingConns},
};

/// Read-only view of the engine's state. Handlers only take snapshots.
#[derive(Clone)]
pub struct AdminState {
    pub prom: Option<telemetry::SharedPrometheusHandle>,
    pub forwards: Arc<ForwardRegistry>,
    pub pending: Arc<PendingConns>,
    pub traffic: telemetry::SharedTraffic,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/forwards", get(forwards))
        .route("/traffic", get(traffic))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let body = st.prom.as_ref().map(|p| p.render()).unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn forwards(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.forwards.snapshot()))
}

#[derive(Debug, Serialize)]
struct TrafficResponse {
    totals: TrafficTotals,
    pending: usize,
    recent: Vec<TrafficRecord>,
}

async fn traffic(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(TrafficResponse {
            totals: st.traffic.totals(),
            pending: st.pending.len(),
            recent: st.traffic.recent(),
        }),
    )
}
