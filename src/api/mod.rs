//! The management HTTP API (spec.md §6, expanded in SPEC_FULL.md §4.13):
//! session reflection, settings CRUD, warehouse capture/playback control,
//! and liveness/readiness, behind a thin cookie-session auth layer.

mod auth;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};

use crate::dispatcher::Dispatcher;
use crate::metrics::Metrics;
use crate::settings::SettingsStore;
use crate::sources::warehouse::{self, SharedCapture, WarehouseWriter};

#[derive(Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Shared application state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub settings: Arc<SettingsStore>,
    pub metrics: Arc<Metrics>,
    /// Set once the kernel sources have attached successfully; read by
    /// `/api/health`.
    pub kernel_ready: Arc<AtomicBool>,
    /// Shared with the kernel source loops so capture can be toggled
    /// without restarting them.
    pub capture: SharedCapture,
    runs: Arc<DashMap<String, RunStatus>>,
    next_run_id: Arc<std::sync::atomic::AtomicU64>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, settings: Arc<SettingsStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            dispatcher,
            settings,
            metrics,
            kernel_ready: Arc::new(AtomicBool::new(false)),
            capture: Arc::new(tokio::sync::Mutex::new(None)),
            runs: Arc::new(DashMap::new()),
            next_run_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    fn new_run_id(&self, prefix: &str) -> String {
        let n = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}")
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/status/sessions", get(status_sessions))
        .route("/api/settings/{*path}", get(get_settings).put(put_settings))
        .route("/api/warehouse/capture", axum::routing::post(warehouse_capture))
        .route("/api/warehouse/playback", axum::routing::post(warehouse_playback))
        .route("/api/warehouse/{id}", get(warehouse_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_session));

    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn ping() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let kernel_ready = state.kernel_ready.load(Ordering::Relaxed);
    let status = if kernel_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "kernel_sources_attached": kernel_ready,
            "sessions_active": state.dispatcher.sessions.len(),
            "uptime_secs": state.metrics.uptime_secs(),
        })),
    )
}

#[derive(Serialize)]
struct SessionSummary {
    conntrack_id: u32,
    client_addr: String,
    client_port: u16,
    server_addr: String,
    server_port: u16,
    protocol: u8,
    packet_count: u64,
    age_secs: u64,
    attachment_keys: Vec<String>,
}

async fn status_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let refs = state.dispatcher.sessions.snapshot_refs();
    let mut summaries = Vec::with_capacity(refs.len());
    for session_ref in refs {
        let guard = session_ref.lock().await;
        summaries.push(SessionSummary {
            conntrack_id: guard.conntrack_id,
            client_addr: guard.client_side_tuple.client_addr.to_string(),
            client_port: guard.client_side_tuple.client_port,
            server_addr: guard.client_side_tuple.server_addr.to_string(),
            server_port: guard.client_side_tuple.server_port,
            protocol: guard.client_side_tuple.protocol,
            packet_count: guard.packet_count,
            age_secs: guard.creation_time.elapsed().as_secs(),
            attachment_keys: guard.attachments.keys().map(str::to_string).collect(),
        });
    }
    Json(summaries)
}

async fn get_settings(State(state): State<AppState>, Path(path): Path<String>) -> impl IntoResponse {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match state.settings.get(&segments).await {
        Some(value) => (StatusCode::OK, Json(value)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response(),
    }
}

async fn put_settings(State(state): State<AppState>, Path(path): Path<String>, Json(value): Json<Value>) -> impl IntoResponse {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "empty settings path"}))).into_response();
    }
    match state.settings.set(&segments, value).await {
        Ok(document) => (StatusCode::OK, Json(document)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(serde::Deserialize)]
struct CaptureRequest {
    path: String,
}

async fn warehouse_capture(State(state): State<AppState>, Json(req): Json<CaptureRequest>) -> impl IntoResponse {
    match WarehouseWriter::create(std::path::Path::new(&req.path)).await {
        Ok(writer) => {
            let id = state.new_run_id("capture");
            *state.capture.lock().await = Some(writer);
            state.runs.insert(id.clone(), RunStatus::Running);
            (StatusCode::OK, Json(json!({"id": id}))).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(serde::Deserialize)]
struct PlaybackRequest {
    path: String,
    #[serde(default = "default_speed")]
    speed: u32,
}

fn default_speed() -> u32 {
    1
}

async fn warehouse_playback(State(state): State<AppState>, Json(req): Json<PlaybackRequest>) -> impl IntoResponse {
    let id = state.new_run_id("playback");
    state.runs.insert(id.clone(), RunStatus::Running);

    let dispatcher = state.dispatcher.clone();
    let runs = state.runs.clone();
    let run_id = id.clone();
    let path = req.path.clone();
    tokio::spawn(async move {
        let outcome = warehouse::playback(std::path::Path::new(&path), dispatcher, req.speed).await;
        runs.insert(run_id, if outcome.is_ok() { RunStatus::Completed } else { RunStatus::Failed });
    });

    (StatusCode::ACCEPTED, Json(json!({"id": id}))).into_response()
}

async fn warehouse_status(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.runs.get(&id) {
        Some(status) => (StatusCode::OK, Json(json!({"id": id, "status": *status}))).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown run id"}))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Registry;

    #[tokio::test]
    async fn new_run_id_is_unique_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::load(dir.path().join("settings.json")).await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let state = AppState::new(Arc::new(Dispatcher::new(Registry::new(), metrics.clone())), settings, metrics);
        let a = state.new_run_id("capture");
        let b = state.new_run_id("capture");
        assert_ne!(a, b);
    }
}
