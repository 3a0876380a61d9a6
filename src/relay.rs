//! The relay loop: connect a client to its asset, pump both directions, tear
//! down once.
//!
//! ```text
//!  client ws ──input pump──▶ transport (guacd tunnel | ssh shell)
//!      ▲                          │
//!      └────── broadcast ◀──output pump──▶ observers, recorder
//! ```
//!
//! Whichever side ends first calls [`finish`]. Only the call that removes the
//! session from the registry runs the teardown: close the gateway tunnel,
//! finish the recording and mark the stored record disconnected.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, SessionError, TerminalError, TunnelError};
use crate::gateway::ssh::SshAuth;
use crate::guacd::params::observer_join;
use crate::guacd::{ConnectionParams, Instruction, Tunnel, INTERNAL_OPCODE};
use crate::sessions::{
    AccessMode, ClientSocket, Disconnect, DisconnectCode, Session, SessionRole, Transport,
};
use crate::state::AppState;
use crate::store::Asset;
use crate::terminal::{Terminal, TerminalParams};

/// Client display hints sent with the upgrade request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayHints {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub dpi: Option<u32>,
    pub cols: Option<u32>,
    pub rows: Option<u32>,
}

/// Why a connection attempt was refused, and how to tell the client.
#[derive(Debug)]
pub struct Rejection {
    pub disconnect: Disconnect,
    pub mode: AccessMode,
}

impl Rejection {
    fn new(mode: AccessMode, code: DisconnectCode, reason: impl Into<String>) -> Self {
        Self {
            disconnect: Disconnect::new(code, reason),
            mode,
        }
    }
}

/// Establish the transport for stored session `session_id` and register it.
pub async fn open_primary(
    state: &AppState,
    session_id: &str,
    hints: DisplayHints,
    socket: Arc<ClientSocket>,
) -> Result<Arc<Session>, Rejection> {
    let Some(record) = state.store.get(session_id).await else {
        return Err(Rejection::new(
            AccessMode::Guacd,
            DisconnectCode::SessionNotFound,
            "session not found",
        ));
    };
    let mode = record.mode;

    let Some(asset) = state.catalog.asset(&record.asset_id).await else {
        return Err(Rejection::new(
            mode,
            DisconnectCode::AssetNotFound,
            format!("asset {} not found", record.asset_id),
        ));
    };

    let session = Arc::new(
        Session::new(
            session_id,
            asset.protocol().as_str(),
            mode,
            SessionRole::Primary,
            Some(socket.clone()),
        )
        .with_gateway(asset.gateway.clone())
        .with_observer_write_timeout(Duration::from_millis(
            state.config.server.observer_write_timeout_ms,
        )),
    );

    // Claim the id before dialing; a refused duplicate never releases
    // anything the live session holds.
    if let Err(e) = state
        .sessions
        .reserve(session.clone(), state.config.server.max_sessions)
        .await
    {
        return Err(match e {
            SessionError::Full(_) => {
                Rejection::new(mode, DisconnectCode::TunnelFailed, "too many sessions")
            }
            _ => Rejection::new(
                mode,
                DisconnectCode::SessionNotFound,
                "session already connected",
            ),
        });
    }

    if let Err(e) = state.store.mark_connecting(session_id).await {
        warn!(session_id = %session_id, error = %e, "failed to mark session connecting");
    }

    let connected = connect_transport(state, session_id, &asset, hints).await;
    let (transport, recording) = match connected {
        Ok(t) => t,
        Err(rejection) => {
            state.sessions.forget(&session).await;
            release(state, session_id, asset.gateway.as_deref(), mode, &rejection.disconnect.reason)
                .await;
            return Err(rejection);
        }
    };

    session.attach_transport(transport.clone());
    if !session.activate() {
        // Finished while connecting: drop what was opened since.
        transport.close().await;
        release(state, session_id, asset.gateway.as_deref(), mode, "closed while connecting").await;
        return Err(Rejection::new(
            mode,
            DisconnectCode::ForcedDisconnect,
            "session closed while connecting",
        ));
    }

    let connection_id = transport.connection_id().map(str::to_string);
    if let Transport::Tunnel(tunnel) = &transport {
        if socket
            .send_text(tunnel.uuid_instruction().encode())
            .await
            .is_err()
        {
            debug!(session_id = %session_id, "client left before the tunnel id was sent");
        }
    }

    if let Err(e) = state
        .store
        .mark_connected(session_id, connection_id.clone(), recording)
        .await
    {
        warn!(session_id = %session_id, error = %e, "failed to mark session connected");
    }

    info!(
        session_id = %session_id,
        asset = %asset.id,
        protocol = %asset.protocol(),
        mode = mode.as_str(),
        connection_id = connection_id.as_deref().unwrap_or("-"),
        "session connected"
    );
    Ok(session)
}

/// Open the gateway tunnel (if any) and the transport.
async fn connect_transport(
    state: &AppState,
    session_id: &str,
    asset: &Asset,
    hints: DisplayHints,
) -> Result<(Transport, Option<String>), Rejection> {
    let mode = asset.mode;
    let server = &state.config.server;

    let (host, port) = match asset.gateway.as_deref() {
        Some(gateway_id) => state
            .gateways
            .open_tunnel(gateway_id, session_id, &asset.host, asset.port())
            .await
            .map_err(|e| {
                let code = match &e {
                    GatewayError::Bind(_) => DisconnectCode::GatewayTunnelFailed,
                    GatewayError::NotFound(_) | GatewayError::Unavailable(_) => {
                        DisconnectCode::GatewayUnavailable
                    }
                };
                Rejection::new(mode, code, e.to_string())
            })?,
        None => (asset.host.clone(), asset.port()),
    };

    match mode {
        AccessMode::Guacd => {
            let recording_dir = state
                .config
                .recording
                .enabled
                .then(|| format!("{}/{session_id}", state.config.recording.path));
            let params = ConnectionParams {
                hostname: &host,
                port,
                username: asset.username.as_deref(),
                password: asset.password.as_deref(),
                private_key: asset.private_key.as_deref(),
                passphrase: asset.passphrase.as_deref(),
                width: hints.width.unwrap_or(server.default_width),
                height: hints.height.unwrap_or(server.default_height),
                dpi: hints.dpi.unwrap_or(server.default_dpi),
                timezone: &state.config.guacd.timezone,
                recording: recording_dir.as_deref().map(|dir| (dir, "recording")),
            };
            let config = params.build(&asset.options);
            let tunnel = Tunnel::connect(
                &state.config.guacd.address,
                &config,
                Duration::from_secs(state.config.guacd.connect_timeout_secs),
            )
            .await
            .map_err(|e| {
                warn!(session_id = %session_id, error = %e, "guacd tunnel failed");
                Rejection::new(mode, DisconnectCode::TunnelFailed, e.to_string())
            })?;
            let recording = recording_dir.map(|dir| format!("{dir}/recording"));
            Ok((Transport::Tunnel(Arc::new(tunnel)), recording))
        }
        AccessMode::Terminal => {
            let auth = match &asset.private_key {
                Some(key) if !key.is_empty() => SshAuth::PrivateKey {
                    key_pem: key.clone(),
                    passphrase: asset.passphrase.clone(),
                },
                _ => SshAuth::Password(asset.password.clone().unwrap_or_default()),
            };
            let params = TerminalParams {
                host,
                port,
                username: asset.username.clone().unwrap_or_default(),
                auth,
                host_key_fingerprint: asset.host_key_fingerprint.clone(),
                cols: hints.cols.unwrap_or(server.default_cols),
                rows: hints.rows.unwrap_or(server.default_rows),
                term: "xterm-256color".to_string(),
                connect_timeout: Duration::from_secs(state.config.guacd.connect_timeout_secs),
            };
            let terminal = Terminal::connect(&params).await.map_err(|e| {
                warn!(session_id = %session_id, error = %e, "terminal connect failed");
                Rejection::new(mode, DisconnectCode::TerminalFailed, e.to_string())
            })?;
            let recording = state
                .recorder
                .as_ref()
                .map(|r| r.path_for(session_id).display().to_string());
            Ok((Transport::Terminal(Arc::new(terminal)), recording))
        }
    }
}

/// Undo a half-established connection.
async fn release(
    state: &AppState,
    session_id: &str,
    gateway: Option<&str>,
    mode: AccessMode,
    reason: &str,
) {
    if let Some(gateway_id) = gateway {
        state.gateways.close_tunnel(gateway_id, session_id).await;
    }
    if mode == AccessMode::Terminal {
        if let Some(recorder) = &state.recorder {
            recorder.finish(session_id).await;
        }
    }
    if let Err(e) = state.store.mark_disconnected(session_id, reason).await {
        warn!(session_id = %session_id, error = %e, "failed to mark session disconnected");
    }
}

/// Remove `session_id` and, if this call removed it, release everything it
/// held. `None` means the client went away on its own.
///
/// Returns false if the session was not live (or another caller got there
/// first).
pub async fn finish(state: &AppState, session_id: &str, disconnect: Option<Disconnect>) -> bool {
    let removed = match &disconnect {
        Some(d) => state.sessions.del_with(session_id, d).await,
        None => state.sessions.del(session_id).await,
    };
    let Some(session) = removed else {
        return false;
    };
    let reason = disconnect
        .as_ref()
        .map_or("client disconnected", |d| d.reason.as_str());
    release(state, session_id, session.gateway.as_deref(), session.mode, reason).await;
    info!(session_id = %session_id, reason = %reason, "session disconnected");
    true
}

/// Forward transport output to the client, observers and recorder until
/// either end fails.
pub fn spawn_output_pump(state: AppState, session: Arc<Session>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(transport) = session.transport() else {
            return;
        };
        let end = match transport {
            Transport::Tunnel(tunnel) => pump_tunnel(&session, &tunnel).await,
            Transport::Terminal(terminal) => pump_terminal(&state, &session, &terminal).await,
        };
        finish(&state, &session.id, end).await;
    })
}

async fn pump_tunnel(session: &Session, tunnel: &Tunnel) -> Option<Disconnect> {
    loop {
        let raw = match tunnel.read().await {
            Ok(raw) if raw.is_empty() => continue,
            Ok(raw) => raw,
            Err(TunnelError::Closed) => {
                return Some(Disconnect::new(
                    DisconnectCode::RemoteClosed,
                    "remote connection closed",
                ))
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "guacd read failed");
                return Some(Disconnect::new(DisconnectCode::TunnelFailed, e.to_string()));
            }
        };
        let text = match String::from_utf8(raw) {
            Ok(t) => t,
            Err(e) => {
                return Some(Disconnect::new(DisconnectCode::TunnelFailed, e.to_string()));
            }
        };
        if session.broadcast(Message::Text(text.into())).await.is_err() {
            return None;
        }
    }
}

async fn pump_terminal(state: &AppState, session: &Session, terminal: &Terminal) -> Option<Disconnect> {
    loop {
        let chunk = match terminal.read().await {
            Ok(c) => c,
            Err(TerminalError::Closed) => {
                return Some(Disconnect::new(
                    DisconnectCode::RemoteClosed,
                    "remote connection closed",
                ))
            }
            Err(e) => return Some(Disconnect::new(DisconnectCode::TerminalFailed, e.to_string())),
        };
        if let Some(recorder) = &state.recorder {
            recorder.append(&session.id, &chunk).await;
        }
        if session.broadcast(Message::Binary(chunk.into())).await.is_err() {
            return None;
        }
    }
}

/// Terminal-mode control messages sent as JSON text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TerminalControl {
    Resize { cols: u32, rows: u32 },
    Data { data: String },
}

/// Read client frames into the transport until the client leaves, goes
/// idle, or the transport fails.
///
/// Observers may only ping; everything else they send is dropped.
pub async fn pump_client_input<S>(
    session: &Session,
    mut stream: S,
    idle_timeout: Duration,
) -> Option<Disconnect>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        let msg = match tokio::time::timeout(idle_timeout, stream.next()).await {
            Err(_) => {
                info!(session_id = %session.id, "client idle timeout");
                return Some(Disconnect::new(DisconnectCode::IdleTimeout, "idle timeout"));
            }
            Ok(None | Some(Err(_)) | Some(Ok(Message::Close(_)))) => return None,
            Ok(Some(Ok(msg))) => msg,
        };

        let result = match (session.mode, msg) {
            (AccessMode::Guacd, Message::Text(text)) => {
                if let Some(ping) = internal_ping(text.as_str()) {
                    echo(session, ping).await;
                    continue;
                }
                if session.role == SessionRole::Observer {
                    continue;
                }
                write_tunnel(session, text.as_str().as_bytes()).await
            }
            (AccessMode::Terminal, _) if session.role == SessionRole::Observer => continue,
            (AccessMode::Terminal, Message::Binary(data)) => write_terminal(session, &data).await,
            (AccessMode::Terminal, Message::Text(text)) => {
                match serde_json::from_str::<TerminalControl>(text.as_str()) {
                    Ok(TerminalControl::Resize { cols, rows }) => resize_terminal(session, cols, rows).await,
                    Ok(TerminalControl::Data { data }) => write_terminal(session, data.as_bytes()).await,
                    Err(_) => write_terminal(session, text.as_str().as_bytes()).await,
                }
            }
            _ => Ok(()),
        };
        if let Err(d) = result {
            return Some(d);
        }
    }
}

fn internal_ping(text: &str) -> Option<String> {
    if !text.starts_with("0.,") {
        return None;
    }
    Instruction::parse(text)
        .ok()
        .filter(Instruction::is_internal_ping)
        .map(|ins| ins.encode())
}

async fn echo(session: &Session, ping: String) {
    if let Some(socket) = session.socket() {
        let _ = socket.send_text(ping).await;
    }
}

async fn write_tunnel(session: &Session, data: &[u8]) -> Result<(), Disconnect> {
    let Some(Transport::Tunnel(tunnel)) = session.transport() else {
        return Ok(());
    };
    tunnel.write_and_flush(data).await.map_err(|e| match e {
        TunnelError::Closed => Disconnect::new(DisconnectCode::RemoteClosed, "remote connection closed"),
        e => Disconnect::new(DisconnectCode::TunnelFailed, e.to_string()),
    })
}

async fn write_terminal(session: &Session, data: &[u8]) -> Result<(), Disconnect> {
    let Some(Transport::Terminal(terminal)) = session.transport() else {
        return Ok(());
    };
    terminal.write(data).await.map_err(terminal_disconnect)
}

async fn resize_terminal(session: &Session, cols: u32, rows: u32) -> Result<(), Disconnect> {
    let Some(Transport::Terminal(terminal)) = session.transport() else {
        return Ok(());
    };
    terminal.resize(cols, rows).await.map_err(terminal_disconnect)
}

fn terminal_disconnect(e: TerminalError) -> Disconnect {
    match e {
        TerminalError::Closed => Disconnect::new(DisconnectCode::RemoteClosed, "remote connection closed"),
        e => Disconnect::new(DisconnectCode::TerminalFailed, e.to_string()),
    }
}

/// Ping the client every `interval` so idle proxies keep the socket open.
pub fn spawn_keepalive(socket: Arc<ClientSocket>, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                break;
            }
        }
    }))
}

/// Join `parent_id` as a read-only observer.
///
/// guacd sessions get their own read-only join tunnel; terminal sessions are
/// fed by the parent's broadcast.
pub async fn open_observer(
    state: &AppState,
    parent_id: &str,
    hints: DisplayHints,
    socket: Arc<ClientSocket>,
) -> Result<(Arc<Session>, Arc<Session>), Rejection> {
    let Some(parent) = state.sessions.get(parent_id).await.filter(|p| p.is_active()) else {
        return Err(Rejection::new(
            AccessMode::Guacd,
            DisconnectCode::SessionNotFound,
            "session not found",
        ));
    };
    let mode = parent.mode;
    let server = &state.config.server;

    let observer = Session::new(
        Uuid::new_v4().to_string(),
        parent.protocol.clone(),
        mode,
        SessionRole::Observer,
        Some(socket.clone()),
    );

    let mut join_tunnel = None;
    if mode == AccessMode::Guacd {
        let connection_id = parent
            .transport()
            .and_then(|t| t.connection_id().map(str::to_string))
            .ok_or_else(|| Rejection::new(mode, DisconnectCode::SessionNotFound, "session not found"))?;
        let config = observer_join(
            &connection_id,
            hints.width.unwrap_or(server.default_width),
            hints.height.unwrap_or(server.default_height),
            hints.dpi.unwrap_or(server.default_dpi),
        );
        let tunnel = Tunnel::connect(
            &state.config.guacd.address,
            &config,
            Duration::from_secs(state.config.guacd.connect_timeout_secs),
        )
        .await
        .map_err(|e| Rejection::new(mode, DisconnectCode::TunnelFailed, e.to_string()))?;
        let tunnel = Arc::new(tunnel);
        observer.attach_transport(Transport::Tunnel(tunnel.clone()));
        join_tunnel = Some(tunnel);
    }

    observer.activate();
    let observer = Arc::new(observer);
    let parent = match state.sessions.join(parent_id, observer.clone()).await {
        Ok(p) => p,
        Err(e) => {
            observer.close(None).await;
            return Err(Rejection::new(mode, DisconnectCode::SessionNotFound, e.to_string()));
        }
    };

    if let Some(tunnel) = join_tunnel {
        let _ = socket
            .send_text(Instruction::new(INTERNAL_OPCODE, [tunnel.uuid()]).encode())
            .await;
    }
    Ok((parent, observer))
}

/// Pump an observer's own join tunnel to its socket. Removes the observer
/// from its parent when either side ends.
pub fn spawn_observer_pump(parent: Arc<Session>, observer: Arc<Session>) -> Option<JoinHandle<()>> {
    let Some(Transport::Tunnel(tunnel)) = observer.transport() else {
        return None;
    };
    let socket = observer.socket()?.clone();
    Some(tokio::spawn(async move {
        loop {
            let raw = match tunnel.read().await {
                Ok(raw) if raw.is_empty() => continue,
                Ok(raw) => raw,
                Err(_) => break,
            };
            let Ok(text) = String::from_utf8(raw) else {
                break;
            };
            if socket.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        parent.observers().del(&observer.id).await;
    }))
}
