//! Live session registry and observer fan-out.
//!
//! [`Registry`] maps session ids to [`Session`]s. The relay keeps one for
//! primaries, and every session owns another for its observers. Removal is
//! the only way a session is torn down, and only the caller whose `del`
//! actually removed the entry gets the session back, so teardown side effects
//! (gateway tunnel, recording, store update) run exactly once.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock`. Iteration takes a snapshot under the read
//! lock and releases it before touching any session, so `add`/`del` from
//! other tasks never wait on a slow socket.

pub mod session;
pub mod socket;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::SessionError;
pub use session::{AccessMode, Session, SessionRole, SessionState, Transport};
pub use socket::{ClientSocket, Disconnect, DisconnectCode};

/// Concurrency-safe id → session map.
///
/// Cloneable; all clones share the same map.
#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(SessionError::AlreadyExists(session.id.clone()));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Like [`add`](Self::add), but also refuses once `limit` entries exist.
    /// Both checks happen under one write lock, so a session can be
    /// registered before its transport exists to claim the id.
    pub async fn reserve(&self, session: Arc<Session>, limit: usize) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(SessionError::AlreadyExists(session.id.clone()));
        }
        if sessions.len() >= limit {
            return Err(SessionError::Full(limit));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Drop `session`'s entry without closing it. Does nothing if the id now
    /// maps to another session or was already removed.
    pub(crate) async fn forget(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove and close `id`. Returns the session only to the caller that
    /// removed it.
    pub async fn del(&self, id: &str) -> Option<Arc<Session>> {
        self.remove_and_close(id, None).await
    }

    /// Like [`del`](Self::del), telling the client and observers why first.
    pub async fn del_with(&self, id: &str, disconnect: &Disconnect) -> Option<Arc<Session>> {
        self.remove_and_close(id, Some(disconnect)).await
    }

    async fn remove_and_close(
        &self,
        id: &str,
        disconnect: Option<&Disconnect>,
    ) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(id)?;
        session.close(disconnect).await;
        Some(session)
    }

    /// Remove every entry without closing them.
    pub(crate) async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect()
    }

    /// Point-in-time copy of the entries.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Visit each entry of a snapshot until `f` returns false.
    pub async fn range<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Session>) -> bool,
    {
        for session in self.snapshot().await {
            if !f(&session) {
                break;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove and close everything, sending `disconnect` to each client.
    pub async fn clear(&self, disconnect: &Disconnect) {
        let sessions = self.drain().await;
        if !sessions.is_empty() {
            info!(count = sessions.len(), reason = %disconnect, "closing all sessions");
        }
        for session in sessions {
            session.close(Some(disconnect)).await;
        }
    }

    /// Attach `observer` to the active primary `parent_id`.
    pub async fn join(
        &self,
        parent_id: &str,
        observer: Arc<Session>,
    ) -> Result<Arc<Session>, SessionError> {
        let parent = self
            .get(parent_id)
            .await
            .filter(|p| p.role == SessionRole::Primary && p.is_active())
            .ok_or_else(|| SessionError::NotFound(parent_id.to_string()))?;

        parent.observers().add(observer.clone()).await?;

        // The parent may have closed between the lookup and the insert; its
        // observer drain has then already run.
        if parent.state() == SessionState::Closed {
            parent.observers().del(&observer.id).await;
            return Err(SessionError::Closed(parent_id.to_string()));
        }
        info!(session_id = %parent_id, observer_id = %observer.id, "observer joined");
        Ok(parent)
    }
}

#[cfg(test)]
mod tests {
    use super::socket::testing::{broken_socket, channel_socket, stalled_socket, text};
    use super::*;
    use axum::extract::ws::Message;
    use futures::StreamExt;
    use std::time::Duration;

    fn primary(id: &str) -> (Arc<Session>, futures::channel::mpsc::UnboundedReceiver<Message>) {
        let (socket, rx) = channel_socket();
        let session = Arc::new(Session::new(
            id,
            "rdp",
            AccessMode::Guacd,
            SessionRole::Primary,
            Some(Arc::new(socket)),
        ));
        session.activate();
        (session, rx)
    }

    fn observer_with(id: &str, socket: ClientSocket) -> Arc<Session> {
        let session = Arc::new(Session::new(
            id,
            "rdp",
            AccessMode::Guacd,
            SessionRole::Observer,
            Some(Arc::new(socket)),
        ));
        session.activate();
        session
    }

    #[tokio::test]
    async fn test_add_duplicate() {
        let registry = Registry::new();
        let (s, _rx) = primary("a");
        registry.add(s.clone()).await.unwrap();
        assert_eq!(
            registry.add(s).await,
            Err(SessionError::AlreadyExists("a".into()))
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_reserve_claims_id_and_honours_limit() {
        let registry = Registry::new();
        let pending = Arc::new(Session::new("a", "rdp", AccessMode::Guacd, SessionRole::Primary, None));
        registry.reserve(pending.clone(), 2).await.unwrap();

        let (dup, _rx) = primary("a");
        assert_eq!(
            registry.reserve(dup.clone(), 2).await,
            Err(SessionError::AlreadyExists("a".into()))
        );
        // A stranger holding the same id cannot drop the reservation.
        assert!(!registry.forget(&dup).await);

        let (b, _rxb) = primary("b");
        registry.reserve(b, 2).await.unwrap();
        let (c, _rxc) = primary("c");
        assert_eq!(registry.reserve(c, 2).await, Err(SessionError::Full(2)));

        assert!(registry.forget(&pending).await);
        assert!(registry.get("a").await.is_none());
        // Forgetting leaves the session itself untouched.
        assert_eq!(pending.state(), SessionState::Created);
    }

    #[tokio::test]
    async fn test_join_unknown_or_inactive_parent() {
        let registry = Registry::new();
        let (socket, _rx) = channel_socket();
        let obs = observer_with("o1", socket);
        assert!(matches!(
            registry.join("missing", obs.clone()).await,
            Err(SessionError::NotFound(ref id)) if id == "missing"
        ));

        let created = Arc::new(Session::new(
            "p",
            "rdp",
            AccessMode::Guacd,
            SessionRole::Primary,
            None,
        ));
        registry.add(created).await.unwrap();
        assert!(matches!(
            registry.join("p", obs).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_primary_and_observers() {
        let registry = Registry::new();
        let (parent, mut parent_rx) = primary("p");
        registry.add(parent.clone()).await.unwrap();

        let (s1, mut rx1) = channel_socket();
        let (s2, mut rx2) = channel_socket();
        registry.join("p", observer_with("o1", s1)).await.unwrap();
        registry.join("p", observer_with("o2", s2)).await.unwrap();

        parent
            .broadcast(Message::Text("4.sync,1.5;".into()))
            .await
            .unwrap();
        assert_eq!(text(&parent_rx.next().await.unwrap()), "4.sync,1.5;");
        assert_eq!(text(&rx1.next().await.unwrap()), "4.sync,1.5;");
        assert_eq!(text(&rx2.next().await.unwrap()), "4.sync,1.5;");
    }

    #[tokio::test]
    async fn test_failing_observer_removed_alone() {
        let registry = Registry::new();
        let (parent, mut parent_rx) = primary("p");
        registry.add(parent.clone()).await.unwrap();

        let (good, mut good_rx) = channel_socket();
        registry.join("p", observer_with("good", good)).await.unwrap();
        registry
            .join("p", observer_with("broken", broken_socket()))
            .await
            .unwrap();

        parent.broadcast(Message::Text("x".into())).await.unwrap();
        assert_eq!(parent.observers().len().await, 1);
        assert!(parent.observers().get("good").await.is_some());
        assert!(parent.is_active());
        assert_eq!(text(&parent_rx.next().await.unwrap()), "x");
        assert_eq!(text(&good_rx.next().await.unwrap()), "x");
    }

    #[tokio::test]
    async fn test_slow_observer_times_out() {
        let (socket, _rx) = channel_socket();
        let parent = Arc::new(
            Session::new("p", "ssh", AccessMode::Terminal, SessionRole::Primary, Some(Arc::new(socket)))
                .with_observer_write_timeout(Duration::from_millis(30)),
        );
        parent.activate();
        let registry = Registry::new();
        registry.add(parent.clone()).await.unwrap();
        registry
            .join("p", observer_with("slow", stalled_socket()))
            .await
            .unwrap();

        for _ in 0..3 {
            parent.broadcast(Message::Binary(vec![1u8].into())).await.unwrap();
        }
        assert!(parent.observers().is_empty().await);
    }

    #[tokio::test]
    async fn test_del_cascades_exactly_once() {
        let registry = Registry::new();
        let (parent, mut parent_rx) = primary("p");
        registry.add(parent.clone()).await.unwrap();
        let (s1, mut rx1) = channel_socket();
        let obs = observer_with("o1", s1);
        registry.join("p", obs.clone()).await.unwrap();

        let notice = Disconnect::new(DisconnectCode::ForcedDisconnect, "bye");
        let (a, b) = tokio::join!(registry.del_with("p", &notice), registry.del("p"));
        assert!(a.is_some() ^ b.is_some());
        assert!(registry.get("p").await.is_none());
        assert_eq!(parent.state(), SessionState::Closed);
        assert_eq!(obs.state(), SessionState::Closed);
        assert!(parent.observers().is_empty().await);

        // Second close is a no-op.
        assert!(!parent.close(None).await);

        // Whichever call won, the sockets got at most one disconnect frame
        // and are then closed.
        let frames: Vec<Message> = parent_rx.by_ref().collect().await;
        assert!(frames.len() <= 1);
        let obs_frames: Vec<Message> = rx1.by_ref().collect().await;
        assert!(obs_frames.len() <= 1);
    }

    #[tokio::test]
    async fn test_join_after_close_fails() {
        let registry = Registry::new();
        let (parent, _rx) = primary("p");
        registry.add(parent.clone()).await.unwrap();
        parent.close(None).await;

        let (s, _orx) = channel_socket();
        assert!(registry.join("p", observer_with("o", s)).await.is_err());
    }

    #[tokio::test]
    async fn test_range_and_clear() {
        let registry = Registry::new();
        let mut rxs = Vec::new();
        for id in ["a", "b", "c"] {
            let (s, rx) = primary(id);
            registry.add(s).await.unwrap();
            rxs.push(rx);
        }
        let mut seen = 0;
        registry
            .range(|_| {
                seen += 1;
                seen < 2
            })
            .await;
        assert_eq!(seen, 2);

        registry
            .clear(&Disconnect::new(DisconnectCode::ServerShutdown, "shutdown"))
            .await;
        assert!(registry.is_empty().await);
        for mut rx in rxs {
            assert_eq!(
                text(&rx.next().await.unwrap()),
                "5.error,8.shutdown,3.809;"
            );
        }
    }
}
