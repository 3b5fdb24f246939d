//! Routing endpoints

use super::common::{ApiError, ApiResult, PreferencesPatch, RouteParams};
use super::AppState;
use crate::routing::{ProxyPreferences, Route};
use axum::{
    extract::{Query, State},
    Json,
};
use serde_json::{json, Value};
use tracing::info;

/// GET /route?host= - Decision for a host right now
pub async fn get_route(
    State(state): State<AppState>,
    Query(params): Query<RouteParams>,
) -> ApiResult<Json<Route>> {
    let host = params.host.trim();
    if host.is_empty() {
        return Err(ApiError::bad_request("host must not be empty"));
    }
    Ok(Json(state.decider.decide(host)))
}

/// GET /preferences
pub async fn get_preferences(State(state): State<AppState>) -> Json<Value> {
    Json(preferences_json(&state))
}

/// PATCH /preferences - Update the enable flag and proxied-host list
pub async fn patch_preferences(
    State(state): State<AppState>,
    Json(patch): Json<PreferencesPatch>,
) -> Json<Value> {
    if let Some(enabled) = patch.enabled {
        info!("Local proxy {}", if enabled { "enabled" } else { "disabled" });
        state.preferences.set_enabled(enabled);
    }
    if let Some(hosts) = patch.proxied_hosts {
        info!("Proxied host list updated ({} entries)", hosts.len());
        state.preferences.set_proxied_hosts(hosts);
    }
    Json(preferences_json(&state))
}

fn preferences_json(state: &AppState) -> Value {
    json!({
        "enabled": state.preferences.enabled(),
        "proxiedHosts": state.preferences.proxied_hosts(),
    })
}
