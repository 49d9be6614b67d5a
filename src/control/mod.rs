//! HTTP control surface: health, listening ports, pipeline names and metrics.

pub mod api;
pub mod ports;

pub use api::ControlState;
pub use ports::{listening_ports, ListeningPorts};

use api::{get_health, get_metrics, get_pipelines, get_ports};
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("control server io error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/export/port", get(get_ports))
        .route("/pipelines", get(get_pipelines))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the control API on `listen` until `shutdown` is cancelled.
pub async fn start_server(
    listen: &str,
    state: Arc<ControlState>,
    shutdown: CancellationToken,
) -> Result<(), ControlError> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ControlError::InvalidAddress(listen.to_string()))?;
    let app = router(state);

    info!(addr = %addr, "Starting control HTTP server");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::config::{CheckpointSettings, GlobalConfig, RuntimeSettings};
    use crate::manager::PipelineManager;
    use crate::plugin::PluginRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> Arc<ControlState> {
        let manager = PipelineManager::new(
            PluginRegistry::with_builtins(),
            Arc::new(CheckpointStore::in_memory().unwrap()),
            GlobalConfig::default(),
            RuntimeSettings::default(),
            &CheckpointSettings::default(),
        );
        Arc::new(ControlState::new(Arc::new(manager)))
    }

    async fn get_json(state: Arc<ControlState>, uri: &str) -> serde_json::Value {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let body = get_json(state(), "/health").await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_pipelines_lists_live_names() {
        let state = state();
        state
            .manager
            .load("app", r#"{"inputs": [{"type": "metric_mock"}]}"#)
            .await
            .unwrap();
        let body = get_json(state, "/pipelines").await;
        assert_eq!(body["live"], serde_json::json!(["app"]));
        assert_eq!(body["disabled"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_ports_from_custom_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tcp"),
            "header\n   0: 00000000:1F90 00000000:0000 0A rest\n",
        )
        .unwrap();
        let mut state = ControlState::new(state().manager.clone());
        state.proc_net = dir.path().to_path_buf();

        let body = get_json(Arc::new(state), "/export/port").await;
        assert_eq!(body["tcp"], serde_json::json!([8080]));
        assert_eq!(body["udp"], serde_json::json!([]));
    }
}
