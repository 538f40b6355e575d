use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::classify::ErrorBoard;
use crate::config::{ProxyMode, Settings};
use crate::domain::{OpenapiEndpoint, ProxyType, RunState, ServerSpec, ServerStatus};
use crate::health::HealthHistory;
use crate::modes::multi::GatewayStatus;
use crate::modes::{UnifiedHandle, UnifiedState};
use crate::ports::{PoolStats, PortPool};
use crate::secrets::SecretStore;
use crate::supervisor::{Shared, SupervisorHandle};

/// Everything the management routes read or poke. Reads come from shared
/// snapshots; mutations go through the owning actor's command channel.
#[derive(Clone)]
pub struct ApiState {
    pub mode: ProxyMode,
    pub settings: Arc<Settings>,
    pub secrets: Arc<SecretStore>,
    /// Nudges the reload loop (same path as a file change).
    pub reload_tx: mpsc::UnboundedSender<()>,
    /// Last successfully loaded catalog.
    pub catalog: Arc<RwLock<Vec<ServerSpec>>>,
    pub view: ModeView,
}

#[derive(Clone)]
pub enum ModeView {
    Individual {
        shared: Arc<Shared>,
        board: Arc<ErrorBoard>,
        history: Arc<HealthHistory>,
        supervisor: SupervisorHandle,
    },
    Unified {
        unified: Arc<RwLock<UnifiedState>>,
        gateways: Option<Arc<RwLock<Vec<GatewayStatus>>>>,
        handle: UnifiedHandle,
        ports: Arc<Mutex<PortPool>>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub mode: &'static str,
    pub servers: Vec<ServerStatus>,
    pub counts: StatusCounts,
    pub ports: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unified: Option<UnifiedState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateways: Option<Vec<GatewayStatus>>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub total: usize,
    pub running: usize,
    pub healthy: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
struct SecretValueBody {
    value: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/endpoints", get(get_endpoints))
        .route("/api/config", get(get_config))
        .route("/api/reload", post(post_reload))
        .route("/api/servers/{id}/start", post(post_start))
        .route("/api/servers/{id}/stop", post(post_stop))
        .route("/api/servers/{id}/restart", post(post_restart))
        .route("/api/servers/{id}/health", get(get_server_health))
        .route("/api/servers/{id}/secrets", get(get_secrets_summary))
        .route("/api/servers/{id}/secrets", delete(delete_secrets))
        .route("/api/servers/{id}/secrets/{key}", put(put_secret))
        .route("/api/servers/{id}/secrets/{key}", delete(delete_secret))
        .with_state(state)
}

pub fn build_status(state: &ApiState) -> StatusReply {
    let catalog = state.catalog.read().clone();
    match &state.view {
        ModeView::Individual { shared, board, .. } => {
            let mut servers = Vec::new();
            let registry = shared.registry.read();
            let failed = shared.failed.read();
            for spec in &catalog {
                let record = board.get(&spec.id);
                let (last_error, error_type) = match &record {
                    Some(r) => (Some(r.message.clone()), Some(r.error_type)),
                    None => (None, None),
                };
                let row = if let Some(entry) = registry.get(&spec.id) {
                    ServerStatus {
                        server_id: spec.id.clone(),
                        configured: true,
                        needs_proxy: spec.needs_proxy,
                        healthy: entry.healthy,
                        auth_error: entry.auth_error,
                        port: Some(entry.port),
                        proxy_type_used: Some(entry.proxy_type),
                        fallback_used: entry.fallback_used,
                        started_at: Some(entry.started_at),
                        uptime_secs: Some(entry.uptime_secs()),
                        restart_count: entry.restart_count,
                        endpoint: Some(format!("http://127.0.0.1:{}", entry.port)),
                        status: RunState::Running,
                        last_error,
                        error_type,
                    }
                } else {
                    let status = if failed.contains(&spec.id) {
                        RunState::Failed
                    } else {
                        RunState::Skipped
                    };
                    ServerStatus {
                        server_id: spec.id.clone(),
                        configured: true,
                        needs_proxy: spec.needs_proxy,
                        healthy: false,
                        auth_error: false,
                        port: None,
                        proxy_type_used: None,
                        fallback_used: false,
                        started_at: None,
                        uptime_secs: None,
                        restart_count: 0,
                        endpoint: None,
                        status,
                        last_error,
                        error_type,
                    }
                };
                servers.push(row);
            }
            let counts = count(&servers);
            let ports = shared.ports.lock().stats();
            StatusReply {
                mode: state.mode.as_str(),
                servers,
                counts,
                ports,
                unified: None,
                gateways: None,
            }
        }
        ModeView::Unified {
            unified,
            gateways,
            ports,
            ..
        } => {
            let unified_state = unified.read().clone();
            let mut servers = Vec::new();
            for spec in &catalog {
                let healthy = unified_state
                    .per_server_healthy
                    .get(&spec.id)
                    .copied()
                    .unwrap_or(false);
                let status = if unified_state.running {
                    RunState::Running
                } else if unified_state.gave_up {
                    RunState::Failed
                } else {
                    RunState::Skipped
                };
                servers.push(ServerStatus {
                    server_id: spec.id.clone(),
                    configured: true,
                    needs_proxy: spec.needs_proxy,
                    healthy,
                    auth_error: false,
                    port: unified_state.port,
                    proxy_type_used: Some(ProxyType::Mcpo),
                    fallback_used: false,
                    started_at: unified_state.started_at,
                    uptime_secs: None,
                    restart_count: unified_state.consecutive_restarts,
                    endpoint: unified_state
                        .port
                        .map(|p| format!("http://127.0.0.1:{p}/{}", spec.id)),
                    status,
                    last_error: None,
                    error_type: None,
                });
            }
            let counts = count(&servers);
            StatusReply {
                mode: state.mode.as_str(),
                servers,
                counts,
                ports: ports.lock().stats(),
                unified: Some(unified_state),
                gateways: gateways.as_ref().map(|g| g.read().clone()),
            }
        }
    }
}

fn count(servers: &[ServerStatus]) -> StatusCounts {
    StatusCounts {
        total: servers.len(),
        running: servers
            .iter()
            .filter(|s| s.status == RunState::Running)
            .count(),
        healthy: servers.iter().filter(|s| s.healthy).count(),
        failed: servers
            .iter()
            .filter(|s| s.status == RunState::Failed)
            .count(),
        skipped: servers
            .iter()
            .filter(|s| s.status == RunState::Skipped)
            .count(),
    }
}

pub fn build_endpoints(state: &ApiState) -> Vec<OpenapiEndpoint> {
    match &state.view {
        ModeView::Individual { shared, .. } => {
            let registry = shared.registry.read();
            let mut out: Vec<OpenapiEndpoint> = registry
                .values()
                .filter(|e| e.healthy)
                .map(|e| {
                    let base = format!("http://127.0.0.1:{}", e.port);
                    OpenapiEndpoint {
                        server_id: e.server_id.clone(),
                        openapi_url: format!("{base}/openapi.json"),
                        docs_url: format!("{base}/docs"),
                        base_url: base,
                        proxy_type: e.proxy_type,
                    }
                })
                .collect();
            out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
            out
        }
        ModeView::Unified { unified, .. } => {
            let unified_state = unified.read();
            let Some(port) = unified_state.port else {
                return Vec::new();
            };
            let mut out: Vec<OpenapiEndpoint> = unified_state
                .per_server_healthy
                .iter()
                .filter(|(_, healthy)| **healthy)
                .map(|(id, _)| {
                    let base = format!("http://127.0.0.1:{port}/{id}");
                    OpenapiEndpoint {
                        server_id: id.clone(),
                        openapi_url: format!("{base}/openapi.json"),
                        docs_url: format!("{base}/docs"),
                        base_url: base,
                        proxy_type: ProxyType::Mcpo,
                    }
                })
                .collect();
            out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
            out
        }
    }
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusReply> {
    Json(build_status(&state))
}

async fn get_endpoints(State(state): State<ApiState>) -> Json<Vec<OpenapiEndpoint>> {
    Json(build_endpoints(&state))
}

async fn get_config(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let s = &state.settings;
    Json(json!({
        "mode": state.mode.as_str(),
        "defaultProxyType": s.default_proxy_type.as_str(),
        "portRangeStart": s.port_range_start,
        "portRangeEnd": s.port_range_end,
        "configPath": s.config_path.display().to_string(),
        "managerPort": s.manager_listen.port(),
    }))
}

async fn post_reload(State(state): State<ApiState>) -> StatusCode {
    match state.reload_tx.send(()) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn known_server(state: &ApiState, id: &str) -> bool {
    state.catalog.read().iter().any(|s| s.id == id)
}

async fn post_start(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match &state.view {
        ModeView::Individual { supervisor, .. } => match supervisor.start(&id).await {
            Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
            Err(err) => (
                StatusCode::CONFLICT,
                Json(json!({"ok": false, "error": err})),
            ),
        },
        ModeView::Unified { .. } => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "per-server start is unavailable in unified mode"})),
        ),
    }
}

async fn post_stop(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match &state.view {
        ModeView::Individual { supervisor, .. } => {
            let stopped = supervisor.stop(&id).await;
            if stopped {
                (StatusCode::OK, Json(json!({"ok": true})))
            } else {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"ok": false, "error": "not running"})),
                )
            }
        }
        ModeView::Unified { .. } => (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "per-server stop is unavailable in unified mode"})),
        ),
    }
}

async fn post_restart(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match &state.view {
        ModeView::Individual { supervisor, .. } => match supervisor.restart(&id).await {
            Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
            Err(err) => (
                StatusCode::CONFLICT,
                Json(json!({"ok": false, "error": err})),
            ),
        },
        // In unified mode any restart request bounces the one bridge.
        ModeView::Unified { handle, .. } => match handle.restart().await {
            Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
            Err(err) => (
                StatusCode::CONFLICT,
                Json(json!({"ok": false, "error": err})),
            ),
        },
    }
}

async fn get_server_health(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !known_server(&state, &id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown server"})),
        );
    }
    match &state.view {
        ModeView::Individual { history, .. } => {
            let records = history.records(&id);
            let metrics = history.metrics(&id);
            (
                StatusCode::OK,
                Json(json!({"serverId": id, "metrics": metrics, "records": records})),
            )
        }
        ModeView::Unified { unified, .. } => {
            let healthy = unified
                .read()
                .per_server_healthy
                .get(&id)
                .copied()
                .unwrap_or(false);
            (
                StatusCode::OK,
                Json(json!({"serverId": id, "healthy": healthy})),
            )
        }
    }
}

async fn get_secrets_summary(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let summary = state.secrets.summary(&id);
    Json(json!({"serverId": id, "keys": summary}))
}

async fn put_secret(
    State(state): State<ApiState>,
    Path((id, key)): Path<(String, String)>,
    Json(body): Json<SecretValueBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.secrets.set(&id, &key, &body.value) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": err.to_string()})),
        ),
    }
}

async fn delete_secret(
    State(state): State<ApiState>,
    Path((id, key)): Path<(String, String)>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.secrets.unset(&id, &key) {
        Ok(true) => (StatusCode::OK, Json(json!({"ok": true}))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"ok": false, "error": "unknown key"})),
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": err.to_string()})),
        ),
    }
}

async fn delete_secrets(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.secrets.delete(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "error": err.to_string()})),
        ),
    }
}
