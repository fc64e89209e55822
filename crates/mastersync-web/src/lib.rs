//! HTTP surface: change-event hooks, booking actions, and manual reconciliation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use mastersync_core::{BookingRecord, DealerRecord, DocumentChange};
use mastersync_sync::{
    build_services, maybe_build_scheduler, run_pass_with_timeout, PointSync, Reconciler, SyncConfig,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "mastersync-web";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub point_sync: Arc<PointSync>,
    /// When set, every route except `/healthz` needs `Authorization: Bearer <token>`.
    pub api_token: Option<String>,
    pub pass_timeout: Duration,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>, point_sync: Arc<PointSync>) -> Self {
        Self {
            reconciler,
            point_sync,
            api_token: None,
            pass_timeout: Duration::from_secs(540),
        }
    }

    pub fn with_api_token(mut self, token: Option<String>) -> Self {
        self.api_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncRunQuery {
    #[serde(default)]
    force: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync/status", get(sync_status_handler))
        .route("/sync/run", post(sync_run_handler))
        .route("/events/dealers", post(dealer_event_handler))
        .route("/events/bookings", post(booking_event_handler))
        .route("/bookings/{id}/approve", post(approve_booking_handler))
        .route("/bookings/{id}", delete(delete_booking_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("MASTERSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let services = build_services(&config).await?;

    let scheduler = maybe_build_scheduler(&config, services.reconciler.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "reconciliation scheduler started");
    }

    let state = AppState::new(services.reconciler, services.point_sync)
        .with_api_token(std::env::var("MASTERSYNC_API_TOKEN").ok())
        .with_pass_timeout(config.pass_timeout());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response())
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn sync_status_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match state.reconciler.read_checkpoint().await {
        Ok(checkpoint) => Json(json!({ "checkpoint": checkpoint })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_run_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SyncRunQuery>,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match run_pass_with_timeout(&state.reconciler, query.force, state.pass_timeout).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn dealer_event_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(change): Json<DocumentChange<DealerRecord>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match state.point_sync.sync_dealer_change(&change).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn booking_event_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(change): Json<DocumentChange<BookingRecord>>,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match state.point_sync.sync_booking_change(&change).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn approve_booking_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    Json(state.point_sync.approve_booking(&id).await).into_response()
}

async fn delete_booking_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    Json(state.point_sync.delete_booking(&id).await).into_response()
}
