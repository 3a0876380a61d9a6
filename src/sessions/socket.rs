//! Client-facing WebSocket writer shared by several tasks.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use serde_json::json;
use tokio::sync::Mutex;

use super::session::AccessMode;
use crate::error::SocketError;
use crate::guacd::Instruction;

type BoxSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// How long a closing socket waits for its final frame to go out.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Write half of a client WebSocket.
///
/// The output pump, the input pump (ping echoes) and the keepalive task all
/// write here; the mutex keeps their frames from interleaving.
pub struct ClientSocket {
    sink: Mutex<Option<BoxSink>>,
    closed: AtomicBool,
}

impl ClientSocket {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        Self {
            sink: Mutex::new(Some(Box::pin(sink))),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, msg: Message) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SocketError::Closed)?;
        sink.send(msg).await?;
        Ok(())
    }

    /// [`send`](Self::send) bounded by `timeout`, including the wait for the
    /// lock.
    pub async fn send_timeout(&self, msg: Message, timeout: Duration) -> Result<(), SocketError> {
        tokio::time::timeout(timeout, self.send(msg))
            .await
            .map_err(|_| SocketError::Timeout)?
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SocketError> {
        self.send(Message::Text(text.into().into())).await
    }

    /// Close the socket, sending `last` first when given. Idempotent.
    pub async fn close(&self, last: Option<Message>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(mut guard) = tokio::time::timeout(CLOSE_TIMEOUT, self.sink.lock()).await else {
            // A writer is stuck; the sink goes away when the socket is dropped.
            return;
        };
        if let Some(mut sink) = guard.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                if let Some(msg) = last {
                    sink.send(msg).await?;
                }
                sink.close().await
            })
            .await;
        }
    }
}

/// Reason codes sent to clients when the relay ends a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCode {
    TunnelFailed = 800,
    ForcedDisconnect = 801,
    GatewayUnavailable = 802,
    GatewayTunnelFailed = 803,
    SessionNotFound = 804,
    TerminalFailed = 805,
    RemoteClosed = 806,
    AssetNotFound = 807,
    IdleTimeout = 808,
    ServerShutdown = 809,
}

impl DisconnectCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// A coded disconnect notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub code: DisconnectCode,
    pub reason: String,
}

impl Disconnect {
    pub fn new(code: DisconnectCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Frame for a client in `mode`: an `error` instruction for guacd
    /// clients, a JSON `closed` message for terminal clients.
    pub fn to_message(&self, mode: AccessMode) -> Message {
        let text = match mode {
            AccessMode::Guacd => Instruction::new(
                "error",
                [self.reason.clone(), self.code.as_u16().to_string()],
            )
            .encode(),
            AccessMode::Terminal => json!({
                "type": "closed",
                "code": self.code.as_u16(),
                "reason": self.reason,
            })
            .to_string(),
        };
        Message::Text(text.into())
    }
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.code.as_u16())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_send_and_close_once() {
        let (socket, mut rx) = channel_socket();
        socket.send_text("4.sync,1.1;").await.unwrap();
        assert_eq!(text(&rx.next().await.unwrap()), "4.sync,1.1;");

        let notice = Disconnect::new(DisconnectCode::ForcedDisconnect, "kicked");
        socket.close(Some(notice.to_message(AccessMode::Guacd))).await;
        socket.close(Some(notice.to_message(AccessMode::Guacd))).await;
        assert!(socket.is_closed());

        assert_eq!(text(&rx.next().await.unwrap()), "5.error,6.kicked,3.801;");
        assert!(rx.next().await.is_none());
        assert!(matches!(socket.send_text("x").await, Err(SocketError::Closed)));
    }

    #[tokio::test]
    async fn test_terminal_disconnect_is_json() {
        let notice = Disconnect::new(DisconnectCode::IdleTimeout, "idle");
        let value: serde_json::Value =
            serde_json::from_str(&text(&notice.to_message(AccessMode::Terminal))).unwrap();
        assert_eq!(value["type"], "closed");
        assert_eq!(value["code"], 808);
        assert_eq!(value["reason"], "idle");
    }

    #[tokio::test]
    async fn test_send_timeout() {
        let socket = stalled_socket();
        // The first message fills the zero-capacity buffer's sender slot.
        let _ = socket
            .send_timeout(Message::Text("a".into()), Duration::from_millis(50))
            .await;
        let res = socket
            .send_timeout(Message::Text("b".into()), Duration::from_millis(50))
            .await;
        assert!(matches!(res, Err(SocketError::Timeout)));
    }

    #[tokio::test]
    async fn test_broken_socket_errors() {
        let socket = broken_socket();
        assert!(matches!(
            socket.send_text("x").await,
            Err(SocketError::Send(_))
        ));
    }
}
