//! WebSocket endpoints for remote sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client creates a session with `POST /api/sessions`, then connects to
//!    `GET /api/ws/tunnel/{session_id}?token=<api_key>` (or sends the key as a
//!    bearer header). The key is checked before the upgrade completes.
//! 2. The relay opens the transport (through a gateway when the asset has
//!    one). guacd clients first receive the tunnel id as an internal
//!    instruction (`0.,<len>.<id>;`).
//! 3. Frames are relayed both ways until either side leaves, the client goes
//!    idle, or an operator deletes the session. The relay's last frame is a
//!    coded disconnect notice.
//!
//! Observers connect to `GET /api/ws/monitor/{session_id}?token=<api_key>`
//! and receive the session's output read-only.
//!
//! ## Frames (guacd mode)
//!
//! Text frames carry Guacamole instructions verbatim. `0.,4.ping,<ts>;` is
//! answered by the relay itself and never reaches guacd.
//!
//! ## Frames (terminal mode)
//!
//! | Direction | Frame                                        |
//! |-----------|----------------------------------------------|
//! | → relay   | binary: raw keystrokes                       |
//! | → relay   | `{"type":"data","data":"..."}`               |
//! | → relay   | `{"type":"resize","cols":120,"rows":40}`     |
//! | ← relay   | binary: raw shell output                     |
//! | ← relay   | `{"type":"closed","code":806,"reason":"..."}` |

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocket, Path, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Extension,
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info};

use crate::auth::{upgrade_credential, ApiKey};
use crate::relay::{self, DisplayHints, Rejection};
use crate::sessions::ClientSocket;
use crate::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// API key for clients that cannot set headers on the upgrade.
    pub token: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub dpi: Option<u32>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
}

impl WsQuery {
    fn hints(&self) -> DisplayHints {
        DisplayHints {
            width: self.width,
            height: self.height,
            dpi: self.dpi,
            cols: self.cols,
            rows: self.rows,
        }
    }
}

/// `GET /api/ws/tunnel/{session_id}?token=<key>` — primary connection.
///
/// Returns `401` without a key and `403` with a wrong one.
pub async fn tunnel_upgrade(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKey>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = key.verify(upgrade_credential(&headers, query.token.as_deref())) {
        return e.into_response();
    }
    let hints = query.hints();
    ws.protocols(["guacamole"])
        .on_upgrade(move |socket| handle_tunnel(socket, state, session_id, hints))
}

/// `GET /api/ws/monitor/{session_id}?token=<key>` — read-only observer.
pub async fn monitor_upgrade(
    State(state): State<AppState>,
    Extension(key): Extension<ApiKey>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = key.verify(upgrade_credential(&headers, query.token.as_deref())) {
        return e.into_response();
    }
    let hints = query.hints();
    ws.protocols(["guacamole"])
        .on_upgrade(move |socket| handle_monitor(socket, state, session_id, hints))
}

async fn reject(socket: &ClientSocket, session_id: &str, rejection: Rejection) {
    info!(
        session_id = %session_id,
        code = rejection.disconnect.code.as_u16(),
        reason = %rejection.disconnect.reason,
        "connection rejected"
    );
    socket
        .close(Some(rejection.disconnect.to_message(rejection.mode)))
        .await;
}

async fn handle_tunnel(socket: WebSocket, state: AppState, session_id: String, hints: DisplayHints) {
    let (sink, stream) = socket.split();
    let client = Arc::new(ClientSocket::new(sink));

    let session = match relay::open_primary(&state, &session_id, hints, client.clone()).await {
        Ok(s) => s,
        Err(rejection) => {
            reject(&client, &session_id, rejection).await;
            return;
        }
    };

    let keepalive = relay::spawn_keepalive(
        client.clone(),
        Duration::from_secs(state.config.server.keepalive_interval_secs),
    );
    let output = relay::spawn_output_pump(state.clone(), session.clone());

    let end = relay::pump_client_input(
        &session,
        stream,
        Duration::from_secs(state.config.server.idle_timeout_secs),
    )
    .await;
    relay::finish(&state, &session_id, end).await;

    let _ = output.await;
    if let Some(keepalive) = keepalive {
        keepalive.abort();
    }
    debug!(session_id = %session_id, "tunnel websocket closed");
}

async fn handle_monitor(socket: WebSocket, state: AppState, session_id: String, hints: DisplayHints) {
    let (sink, stream) = socket.split();
    let client = Arc::new(ClientSocket::new(sink));

    let (parent, observer) =
        match relay::open_observer(&state, &session_id, hints, client.clone()).await {
            Ok(pair) => pair,
            Err(rejection) => {
                reject(&client, &session_id, rejection).await;
                return;
            }
        };

    let keepalive = relay::spawn_keepalive(
        client.clone(),
        Duration::from_secs(state.config.server.keepalive_interval_secs),
    );
    let pump = relay::spawn_observer_pump(parent.clone(), observer.clone());

    // Observers never type; they live as long as the session does.
    relay::pump_client_input(&observer, stream, Duration::MAX).await;

    if parent.observers().del(&observer.id).await.is_some() {
        info!(session_id = %session_id, observer_id = %observer.id, "observer left");
    }
    if let Some(pump) = pump {
        let _ = pump.await;
    }
    if let Some(keepalive) = keepalive {
        keepalive.abort();
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::guacd::InstructionReader;
    use crate::store::SessionStatus;
    use crate::AppState;
    use futures::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    async fn fake_guacd() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut reader = InstructionReader::new(r);
            reader.read_instruction().await.unwrap();
            w.write_all(b"4.args,8.hostname;").await.unwrap();
            while let Some(ins) = reader.read_instruction().await.unwrap() {
                if ins.opcode == "connect" {
                    break;
                }
            }
            w.write_all(b"5.ready,5.$e2e1;").await.unwrap();
            w.write_all(b"4.sync,1.1;").await.unwrap();
            // Echo one client instruction back, then hang up.
            let mut r = reader.into_inner();
            let mut buf = vec![0u8; 11];
            r.read_exact(&mut buf).await.unwrap();
            w.write_all(&buf).await.unwrap();
        });
        addr
    }

    async fn serve(state: AppState) -> String {
        let app = crate::routes::build_router(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn state(guacd: String) -> AppState {
        let mut config = Config::parse(
            r#"
            [auth]
            api_key = "k"

            [[assets]]
            id = "vnc-01"
            host = "10.0.0.12"
            protocol = "vnc"
            "#,
        )
        .unwrap();
        config.guacd.address = guacd;
        AppState::from_config(config)
    }

    fn text(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.as_str().to_string(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_token_forbidden() {
        let addr = serve(state("127.0.0.1:1".into())).await;
        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws/tunnel/x?token=bad"))
            .await
            .unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                assert_eq!(resp.status(), 403);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_token_unauthorized() {
        let addr = serve(state("127.0.0.1:1".into())).await;
        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws/monitor/x"))
            .await
            .unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                assert_eq!(resp.status(), 401);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_bearer_header_accepted_on_upgrade() {
        let addr = serve(state("127.0.0.1:1".into())).await;
        let mut request = format!("ws://{addr}/api/ws/tunnel/nope")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("authorization", "Bearer k".parse().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        let msg = ws.next().await.unwrap().unwrap();
        assert_eq!(text(msg), "5.error,17.session not found,3.804;");
    }

    #[tokio::test]
    async fn test_unknown_session_gets_error_instruction() {
        let addr = serve(state("127.0.0.1:1".into())).await;
        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws/tunnel/nope?token=k"))
                .await
                .unwrap();
        let msg = ws.next().await.unwrap().unwrap();
        assert_eq!(text(msg), "5.error,17.session not found,3.804;");
    }

    #[tokio::test]
    async fn test_tunnel_end_to_end() {
        let state = state(fake_guacd().await);
        let asset = state.catalog.asset("vnc-01").await.unwrap();
        let record = state.store.create(&asset).await.unwrap();
        let addr = serve(state.clone()).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!(
            "ws://{addr}/api/ws/tunnel/{}?token=k&width=800&height=600",
            record.id
        ))
        .await
        .unwrap();

        assert_eq!(text(ws.next().await.unwrap().unwrap()), "0.,5.$e2e1;");
        assert_eq!(text(ws.next().await.unwrap().unwrap()), "4.sync,1.1;");

        ws.send(Message::Text("4.sync,1.2;".into())).await.unwrap();
        assert_eq!(text(ws.next().await.unwrap().unwrap()), "4.sync,1.2;");

        // guacd hung up after the echo.
        let last = text(ws.next().await.unwrap().unwrap());
        assert_eq!(last, "5.error,24.remote connection closed,3.806;");

        let mut tries = 0;
        while state.store.get(&record.id).await.unwrap().status != SessionStatus::Disconnected {
            tries += 1;
            assert!(tries < 50, "record never marked disconnected");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(state.sessions.is_empty().await);
    }
}
