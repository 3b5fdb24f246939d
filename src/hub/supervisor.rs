//! Supervisor endpoints
//!
//! Lifecycle control and status of the proxy core.

use super::common::{ApiError, ApiResult};
use super::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::info;

/// GET /status - Current supervisor snapshot
pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let snapshot = state.supervisor.snapshot();
    let mut body = serde_json::to_value(&snapshot).map_err(|e| ApiError::internal(e.to_string()))?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("socksPort".into(), json!(state.supervisor.socks_port()));
    }
    Ok(Json(body))
}

/// GET /health - 200 when the local proxy is ready, 503 otherwise
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let ready = state.supervisor.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready })))
}

/// POST /start - Launch a bootstrap run
pub async fn start(State(state): State<AppState>) -> ApiResult<StatusCode> {
    info!("Start requested via API");
    state
        .supervisor
        .start()
        .await
        .map_err(|e| ApiError::from_error(&e))?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /stop - Tear down the proxy core
pub async fn stop(State(state): State<AppState>) -> StatusCode {
    info!("Stop requested via API");
    state.supervisor.stop().await;
    StatusCode::NO_CONTENT
}

/// GET /ip - Direct public address and the recorded exit address
pub async fn get_ip(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let direct = state
        .echo
        .direct()
        .await
        .map_err(|e| ApiError::from_error(&e))?;
    let snapshot = state.supervisor.snapshot();

    Ok(Json(json!({
        "direct": direct,
        "exitIp": snapshot.exit_ip,
    })))
}
