use super::ports::{listening_ports, ListeningPorts};
use crate::manager::PipelineManager;
use crate::metrics::MetricSnapshot;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared state for the control API
pub struct ControlState {
    pub manager: Arc<PipelineManager>,
    pub version: String,
    pub start_time: std::time::Instant,
    /// Directory holding the `tcp`, `tcp6`, `udp` and `udp6` tables.
    pub proc_net: PathBuf,
}

impl ControlState {
    pub fn new(manager: Arc<PipelineManager>) -> Self {
        Self {
            manager,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
            proc_net: PathBuf::from("/proc/net"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct PipelinesResponse {
    pub live: Vec<String>,
    pub disabled: Vec<String>,
    pub always_online: Vec<String>,
}

/// GET /health
pub async fn get_health(State(state): State<Arc<ControlState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// GET /export/port
pub async fn get_ports(
    State(state): State<Arc<ControlState>>,
) -> Result<Json<ListeningPorts>, ApiError> {
    let root = state.proc_net.clone();
    let ports = tokio::task::spawn_blocking(move || listening_ports(&root))
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(Json(ports))
}

/// GET /pipelines
pub async fn get_pipelines(State(state): State<Arc<ControlState>>) -> Json<PipelinesResponse> {
    Json(PipelinesResponse {
        live: state.manager.names().await,
        disabled: state.manager.disabled_names(),
        always_online: state.manager.always_online().names(),
    })
}

/// GET /metrics
pub async fn get_metrics(State(state): State<Arc<ControlState>>) -> Json<Vec<MetricSnapshot>> {
    Json(state.manager.export_metrics().await)
}

#[derive(Debug)]
pub enum ApiError {
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
