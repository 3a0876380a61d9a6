//! A relayed session: one client socket, one transport, any number of
//! observers.
//!
//! ## State machine
//!
//! ```text
//! Created ──activate──▶ Active ──close──▶ Closed
//!    └──────────────close───────────────────▲
//! ```
//!
//! `Closed` is terminal. Only the call that performs the transition does any
//! teardown, so closing twice (or from two tasks at once) is harmless.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::socket::{ClientSocket, Disconnect};
use super::Registry;
use crate::error::SocketError;
use crate::guacd::Tunnel;
use crate::terminal::Terminal;

/// How the client talks to the asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Guacamole instructions relayed through guacd.
    #[default]
    Guacd,
    /// Raw terminal bytes over an SSH shell channel.
    Terminal,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guacd => "guacd",
            Self::Terminal => "terminal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Primary,
    Observer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Active,
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

/// The connection a session pumps output from.
#[derive(Clone)]
pub enum Transport {
    Tunnel(Arc<Tunnel>),
    Terminal(Arc<Terminal>),
}

impl Transport {
    pub async fn close(&self) {
        match self {
            Self::Tunnel(t) => t.close().await,
            Self::Terminal(t) => t.close().await,
        }
    }

    /// guacd connection id, if this is a tunnel.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Self::Tunnel(t) => Some(t.uuid()),
            Self::Terminal(_) => None,
        }
    }
}

pub struct Session {
    pub id: String,
    pub protocol: String,
    pub mode: AccessMode,
    pub role: SessionRole,
    /// Gateway the transport was opened through.
    pub gateway: Option<String>,
    /// Epoch milliseconds.
    pub created_at: u64,
    state: AtomicU8,
    transport: Mutex<Option<Transport>>,
    socket: Option<Arc<ClientSocket>>,
    observers: Registry,
    observer_write_timeout: Duration,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        protocol: impl Into<String>,
        mode: AccessMode,
        role: SessionRole,
        socket: Option<Arc<ClientSocket>>,
    ) -> Self {
        Self {
            id: id.into(),
            protocol: protocol.into(),
            mode,
            role,
            gateway: None,
            created_at: epoch_ms(),
            state: AtomicU8::new(0),
            transport: Mutex::new(None),
            socket,
            observers: Registry::default(),
            observer_write_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_gateway(mut self, gateway: Option<String>) -> Self {
        self.gateway = gateway;
        self
    }

    #[must_use]
    pub fn with_observer_write_timeout(mut self, timeout: Duration) -> Self {
        self.observer_write_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Created → Active`. False if the session was not in `Created`.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn attach_transport(&self, transport: Transport) {
        if let Ok(mut slot) = self.transport.lock() {
            *slot = Some(transport);
        }
    }

    pub fn transport(&self) -> Option<Transport> {
        self.transport.lock().ok().and_then(|t| t.clone())
    }

    pub fn socket(&self) -> Option<&Arc<ClientSocket>> {
        self.socket.as_ref()
    }

    pub fn observers(&self) -> &Registry {
        &self.observers
    }

    /// Close transport, socket and every observer. Returns false if the
    /// session was already closed.
    pub async fn close(&self, disconnect: Option<&Disconnect>) -> bool {
        if !self.close_own(disconnect).await {
            return false;
        }
        for observer in self.observers.drain().await {
            observer.close_own(disconnect).await;
        }
        true
    }

    /// Close this session's own resources, leaving observers alone.
    async fn close_own(&self, disconnect: Option<&Disconnect>) -> bool {
        if self.state.swap(2, Ordering::AcqRel) == 2 {
            return false;
        }
        let transport = self.transport.lock().ok().and_then(|mut t| t.take());
        if let Some(transport) = transport {
            transport.close().await;
        }
        if let Some(socket) = &self.socket {
            socket.close(disconnect.map(|d| d.to_message(self.mode))).await;
        }
        debug!(session_id = %self.id, role = ?self.role, "session closed");
        true
    }

    /// Send `msg` to the client, then to each observer without a transport
    /// of its own. Observers holding a join tunnel are fed by that tunnel.
    ///
    /// A primary write failure is returned. An observer that fails or takes
    /// longer than the observer write timeout is removed on its own.
    pub async fn broadcast(&self, msg: Message) -> Result<(), SocketError> {
        if let Some(socket) = &self.socket {
            socket.send(msg.clone()).await?;
        }
        for observer in self.observers.snapshot().await {
            if !observer.is_active() || observer.transport().is_some() {
                continue;
            }
            let Some(socket) = observer.socket() else {
                continue;
            };
            if let Err(e) = socket
                .send_timeout(msg.clone(), self.observer_write_timeout)
                .await
            {
                warn!(
                    session_id = %self.id,
                    observer_id = %observer.id,
                    error = %e,
                    "dropping observer"
                );
                self.observers.del(&observer.id).await;
            }
        }
        Ok(())
    }
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
