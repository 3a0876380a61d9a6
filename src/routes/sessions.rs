//! REST endpoints for session management.
//!
//! - `POST   /api/sessions`       — create a session for an asset
//! - `GET    /api/sessions`       — list stored sessions with live state
//! - `GET    /api/sessions/{id}`  — one session
//! - `DELETE /api/sessions/{id}`  — force-disconnect a live session

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::relay;
use crate::sessions::{Disconnect, DisconnectCode};
use crate::store::SessionRecord;
use crate::AppState;

type ApiError = (StatusCode, Json<Value>);

fn not_found(id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("Session {id} not found"), "code": "SESSION_NOT_FOUND"})),
    )
}

/// Record plus what the registry knows about it right now.
async fn describe(state: &AppState, record: &SessionRecord) -> Value {
    let live = state.sessions.get(&record.id).await;
    let observers = match &live {
        Some(s) => s.observers().len().await,
        None => 0,
    };
    let mut obj = json!(record);
    obj["live"] = json!(live.is_some());
    obj["observers"] = json!(observers);
    obj
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub asset_id: String,
}

/// `POST /api/sessions` — create a `not_connected` session for an asset.
pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let asset = state.catalog.asset(&payload.asset_id).await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("Asset {} not found", payload.asset_id),
                "code": "ASSET_NOT_FOUND",
            })),
        )
    })?;
    let record = state.store.create(&asset).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string(), "code": "STORE_ERROR"})),
        )
    })?;
    info!(session_id = %record.id, asset = %asset.id, "session created");
    Ok((StatusCode::CREATED, Json(json!(record))))
}

/// `GET /api/sessions` — every stored session, oldest first.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let records = state.store.list().await;
    let mut sessions = Vec::with_capacity(records.len());
    for record in &records {
        sessions.push(describe(&state, record).await);
    }
    Json(json!({
        "sessions": sessions,
    }))
}

/// `GET /api/sessions/{id}`.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.get(&id).await.ok_or_else(|| not_found(&id))?;
    Ok(Json(describe(&state, &record).await))
}

/// `DELETE /api/sessions/{id}` — disconnect a live session, its observers
/// included. The client receives code 801.
pub async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let disconnect = Disconnect::new(DisconnectCode::ForcedDisconnect, "disconnected by operator");
    if !relay::finish(&state, &id, Some(disconnect)).await {
        return Err(not_found(&id));
    }
    Ok(Json(json!({
        "ok": true,
        "session_id": id,
    })))
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::routes::build_router;
    use crate::store::SessionStatus;
    use crate::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    fn state() -> AppState {
        let config = Config::parse(
            r#"
            [auth]
            api_key = "k"

            [[assets]]
            id = "shell-01"
            host = "10.0.0.11"
            protocol = "ssh"
            mode = "terminal"
            "#,
        )
        .unwrap();
        AppState::from_config(config)
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", "Bearer k");
        if body.is_some() {
            req = req.header("content-type", "application/json");
        }
        let req = req
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let state = state();
        let (status, created) =
            call(&state, "POST", "/api/sessions", Some(r#"{"asset_id":"shell-01"}"#)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "not_connected");
        assert_eq!(created["mode"], "terminal");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, got) = call(&state, "GET", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(got["live"], false);
        assert_eq!(got["observers"], 0);

        let (_, list) = call(&state, "GET", "/api/sessions", None).await;
        assert_eq!(list["sessions"].as_array().unwrap().len(), 1);
        assert_eq!(
            state.store.get(&id).await.unwrap().status,
            SessionStatus::NotConnected
        );
    }

    #[tokio::test]
    async fn test_unknown_asset_and_session() {
        let state = state();
        let (status, body) =
            call(&state, "POST", "/api/sessions", Some(r#"{"asset_id":"nope"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "ASSET_NOT_FOUND");

        let (status, _) = call(&state, "GET", "/api/sessions/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, "DELETE", "/api/sessions/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_requires_api_key() {
        let state = state();
        let req = Request::builder()
            .uri("/api/sessions")
            .body(Body::empty())
            .unwrap();
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let resp = build_router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
