//! HTTP route handlers and router assembly.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require authentication via the [`crate::auth::require_api_key`]
//! middleware. The WebSocket upgrades check the same key themselves, since
//! they also accept it as `?token=`.

pub mod gateways;
pub mod health;
pub mod sessions;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::ws;
use crate::AppState;

/// Build the full application router for `state`.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route(
            "/api/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/api/sessions/{id}",
            get(sessions::get_session).delete(sessions::kill_session),
        )
        .route("/api/gateways", get(gateways::list_gateways))
        .route(
            "/api/gateways/{id}/reconnect",
            post(gateways::reconnect_gateway),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new()
        .route("/api/ws/tunnel/{session_id}", get(ws::tunnel_upgrade))
        .route("/api/ws/monitor/{session_id}", get(ws::monitor_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey::new(state.config.auth.api_key.as_str())))
        .layer(GlobalConcurrencyLimitLayer::new(
            state.config.server.max_connections,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
