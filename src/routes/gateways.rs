//! REST endpoints for jump hosts.
//!
//! - `GET  /api/gateways`                 — status of every gateway
//! - `POST /api/gateways/{id}/reconnect`  — drop tunnels and re-probe

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::AppState;

/// `GET /api/gateways`.
pub async fn list_gateways(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "gateways": state.gateways.list().await,
    }))
}

/// `POST /api/gateways/{id}/reconnect` — tear down every tunnel through the
/// gateway and probe it once. Sessions relayed through it are cut off.
pub async fn reconnect_gateway(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.gateways.reconnect(&id).await {
        Ok(status) => Ok(Json(json!(status))),
        Err(GatewayError::NotFound(_)) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Gateway {id} not found"), "code": "GATEWAY_NOT_FOUND"})),
        )),
        Err(e) => Err((
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": e.to_string(), "code": "GATEWAY_UNAVAILABLE"})),
        )),
    }
}
