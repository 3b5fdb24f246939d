//! Control API (hub)
//!
//! Small REST surface over the supervisor and the routing decider, for host
//! applications that run the bootstrap as a sidecar daemon.

mod auth;
mod common;

// Endpoint modules
mod routing;
mod supervisor;

pub use auth::auth_middleware;
pub use common::{ApiError, ApiResult};

use crate::routing::{RoutingDecider, SharedPreferences};
use crate::supervisor::{EchoCheck, ProxySupervisor};
use crate::{Result, VERSION};

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// API secret, empty disables auth
    pub secret: String,
    pub supervisor: Arc<ProxySupervisor>,
    pub decider: Arc<RoutingDecider>,
    pub preferences: Arc<SharedPreferences>,
    /// Used for the direct (unproxied) address lookup
    pub echo: Arc<EchoCheck>,
}

impl AppState {
    pub fn new(
        secret: String,
        supervisor: Arc<ProxySupervisor>,
        decider: Arc<RoutingDecider>,
        preferences: Arc<SharedPreferences>,
        echo: Arc<EchoCheck>,
    ) -> Self {
        AppState {
            secret,
            supervisor,
            decider,
            preferences,
            echo,
        }
    }
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(hello))
        .route("/version", get(version))
        .route("/status", get(supervisor::get_status))
        .route("/health", get(supervisor::health))
        .route("/start", post(supervisor::start))
        .route("/stop", post(supervisor::stop))
        .route("/ip", get(supervisor::get_ip))
        .route("/route", get(routing::get_route))
        .route(
            "/preferences",
            get(routing::get_preferences).patch(routing::patch_preferences),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the control API until `shutdown` fires
pub async fn start_server(state: AppState, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control API listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn hello() -> Json<Value> {
    Json(json!({ "hello": "proxy-bootstrap" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": VERSION }))
}
