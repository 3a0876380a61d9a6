//! Error types for the relay.
//!
//! Each layer has its own enum so callers can tell a handshake failure from a
//! closed transport or an unreachable jump host. [`crate::sessions::Disconnect`]
//! turns these into the coded messages clients see.

use std::io;

use thiserror::Error;

/// Errors raised while framing or parsing gateway daemon instructions.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The bytes on the wire do not form a valid instruction.
    #[error("malformed instruction: {0}")]
    Malformed(String),

    /// A single instruction grew past the framing limit.
    #[error("instruction exceeds {0} bytes")]
    TooLong(usize),

    /// The underlying socket failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from a [`crate::guacd::Tunnel`].
#[derive(Debug, Error)]
pub enum TunnelError {
    /// TCP dial to the daemon failed.
    #[error("failed to connect to guacd at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// TCP dial to the daemon did not complete in time.
    #[error("timed out connecting to guacd at {0}")]
    ConnectTimeout(String),

    /// The daemon answered a handshake step with the wrong instruction.
    #[error("handshake failed: expected '{expected}', got '{got}'")]
    UnexpectedOpcode { expected: String, got: String },

    /// `ready` arrived without a connection identifier.
    #[error("handshake failed: no connection id received")]
    NoConnectionId,

    /// The daemon hung up before the handshake finished.
    #[error("handshake failed: connection closed while waiting for '{expected}'")]
    HandshakeClosed { expected: String },

    /// The daemon went silent during the handshake.
    #[error("handshake with {0} timed out")]
    HandshakeTimeout(String),

    /// The tunnel was closed locally or the daemon hung up.
    #[error("tunnel closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Whether this error belongs to the handshake phase.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedOpcode { .. }
                | Self::NoConnectionId
                | Self::HandshakeClosed { .. }
                | Self::HandshakeTimeout(_)
        )
    }
}

/// Errors from the jump-host tunnel manager.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No gateway registered under this id.
    #[error("gateway {0} not found")]
    NotFound(String),

    /// SSH connect or authentication to the jump host failed. The gateway is
    /// kept and the next call retries.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    /// The local forwarding listener could not be bound.
    #[error("failed to bind local forwarding port: {0}")]
    Bind(#[source] io::Error),
}

/// API key rejections.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing API key")]
    Missing,

    #[error("invalid API key")]
    Invalid,
}

/// Errors from the session registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// No active primary session with this id.
    #[error("session {0} not found")]
    NotFound(String),

    /// A session with this id is already registered.
    #[error("session {0} already exists")]
    AlreadyExists(String),

    /// The session was closed before the operation completed.
    #[error("session {0} is closed")]
    Closed(String),

    /// The registry already holds its maximum number of sessions.
    #[error("session limit of {0} reached")]
    Full(usize),
}

/// Errors writing to a client-facing socket.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket closed")]
    Closed,

    #[error("socket write timed out")]
    Timeout,

    #[error("socket write failed: {0}")]
    Send(#[from] axum::Error),
}

/// Errors from the raw SSH terminal transport.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("SSH authentication failed: {0}")]
    Auth(String),

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("terminal closed")]
    Closed,
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors from collaborator stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(String),

    #[error("record {0} already exists")]
    Duplicate(String),
}
