use crate::alerts::AlertDecision;
use crate::collectors::{SystemSample, UserSample};
use crate::metrics::Metrics;
use crate::state::State as DaemonState;
use crate::status::SystemStatus;
use crate::tracker::PersistentUsageEvent;
use crate::ws::{self, WsHub};
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<DaemonState>>,
    pub hub: WsHub,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub started_at_unix: i64,
    pub last_cycle_unix: i64,
    pub host_name: Option<String>,
    pub status: SystemStatus,
    pub system: Option<SystemSample>,
    pub disk_percent: f64,
    pub uptime_secs: u64,
    pub users: Vec<UserSample>,
    pub persistent: Vec<PersistentUsageEvent>,
    pub last_alert: Option<AlertDecision>,
    pub cycle_count: u64,
    pub cycle_errors: u64,
}

impl From<&DaemonState> for ApiState {
    fn from(value: &DaemonState) -> Self {
        Self {
            started_at_unix: value.started_at_unix,
            last_cycle_unix: value.last_cycle_unix,
            host_name: value.host_name.clone(),
            status: value.status,
            system: value.system.clone(),
            disk_percent: value.disk_percent,
            uptime_secs: value.uptime_secs,
            users: value.users.clone(),
            persistent: value.persistent.clone(),
            last_alert: value.last_alert.clone(),
            cycle_count: value.cycle_count,
            cycle_errors: value.cycle_errors,
        }
    }
}

pub fn build_router(
    metrics: Arc<Metrics>,
    state: Arc<RwLock<DaemonState>>,
    hub: WsHub,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/ws", get(ws_handler))
        .with_state(HttpAppState {
            metrics,
            state,
            hub,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(ApiState::from(&*guard))
}

async fn ws_handler(State(state): State<HttpAppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| ws::handle_socket(socket, state.hub.clone()))
}
