//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, live session count and how many gateways
/// are connected. No authentication required, suitable for load-balancer
/// health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.sessions.len().await;
    let gateways = state.gateways.list().await;
    let connected = gateways.iter().filter(|g| g.connected).count();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "gateways": {
            "total": gateways.len(),
            "connected": connected,
        },
    }))
}
