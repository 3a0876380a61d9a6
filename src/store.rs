//! Collaborators the relay reads from and reports to.
//!
//! - [`SessionStore`] — session metadata (which asset, status, timestamps)
//! - [`AssetCatalog`] — asset addresses, credentials and protocol options
//! - [`Recorder`] — sink for terminal-mode output
//!
//! The implementations here keep everything in memory or on local disk,
//! enough for a single relay host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::guacd::{AssetProtocol, ProtocolOptions};
use crate::sessions::session::epoch_ms;
use crate::sessions::AccessMode;

/// Lifecycle of a stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    NotConnected,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub asset_id: String,
    pub protocol: AssetProtocol,
    pub mode: AccessMode,
    pub status: SessionStatus,
    pub connection_id: Option<String>,
    pub recording: Option<String>,
    pub gateway_id: Option<String>,
    pub disconnect_reason: Option<String>,
    pub created_at: u64,
    pub connected_at: Option<u64>,
    pub disconnected_at: Option<u64>,
}

/// A remote endpoint users connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    /// Defaults to the protocol's well-known port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub mode: AccessMode,
    /// Jump host to reach the asset through.
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    /// Pinned host key for terminal-mode SSH.
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(flatten)]
    pub options: ProtocolOptions,
}

impl Asset {
    pub fn protocol(&self) -> AssetProtocol {
        self.options.protocol()
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol().default_port())
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a `not_connected` record for `asset`.
    async fn create(&self, asset: &Asset) -> Result<SessionRecord, StoreError>;

    async fn get(&self, id: &str) -> Option<SessionRecord>;

    async fn list(&self) -> Vec<SessionRecord>;

    async fn mark_connecting(&self, id: &str) -> Result<(), StoreError>;

    async fn mark_connected(
        &self,
        id: &str,
        connection_id: Option<String>,
        recording: Option<String>,
    ) -> Result<(), StoreError>;

    async fn mark_disconnected(&self, id: &str, reason: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AssetCatalog: Send + Sync {
    async fn asset(&self, id: &str) -> Option<Asset>;
}

/// Append-only session output sink.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Location of the recording for `session_id`.
    fn path_for(&self, session_id: &str) -> PathBuf;

    async fn append(&self, session_id: &str, chunk: &[u8]);

    async fn finish(&self, session_id: &str);
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut SessionRecord) + Send,
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, asset: &Asset) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            asset_id: asset.id.clone(),
            protocol: asset.protocol(),
            mode: asset.mode,
            status: SessionStatus::NotConnected,
            connection_id: None,
            recording: None,
            gateway_id: asset.gateway.clone(),
            disconnect_reason: None,
            created_at: epoch_ms(),
            connected_at: None,
            disconnected_at: None,
        };
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Option<SessionRecord> {
        self.records.read().await.get(id).cloned()
    }

    async fn list(&self) -> Vec<SessionRecord> {
        let mut out: Vec<SessionRecord> = self.records.read().await.values().cloned().collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    async fn mark_connecting(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |r| r.status = SessionStatus::Connecting).await
    }

    async fn mark_connected(
        &self,
        id: &str,
        connection_id: Option<String>,
        recording: Option<String>,
    ) -> Result<(), StoreError> {
        self.update(id, |r| {
            r.status = SessionStatus::Connected;
            r.connection_id = connection_id;
            r.recording = recording;
            r.connected_at = Some(epoch_ms());
        })
        .await
    }

    async fn mark_disconnected(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let reason = reason.to_string();
        self.update(id, |r| {
            r.status = SessionStatus::Disconnected;
            r.disconnect_reason = Some(reason);
            r.disconnected_at = Some(epoch_ms());
        })
        .await
    }
}

/// [`AssetCatalog`] over the `[[assets]]` config entries.
pub struct ConfigCatalog {
    assets: HashMap<String, Asset>,
}

impl ConfigCatalog {
    pub fn new(assets: impl IntoIterator<Item = Asset>) -> Self {
        Self {
            assets: assets.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }
}

#[async_trait]
impl AssetCatalog for ConfigCatalog {
    async fn asset(&self, id: &str) -> Option<Asset> {
        self.assets.get(id).cloned()
    }
}

/// Writes each session's output to `<root>/<session_id>/recording`.
pub struct FileRecorder {
    root: PathBuf,
    open: Mutex<HashMap<String, Arc<Mutex<tokio::fs::File>>>>,
}

impl FileRecorder {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            open: Mutex::new(HashMap::new()),
        }
    }

    async fn file_for(&self, session_id: &str) -> std::io::Result<Arc<Mutex<tokio::fs::File>>> {
        let mut open = self.open.lock().await;
        if let Some(f) = open.get(session_id) {
            return Ok(f.clone());
        }
        let path = self.path_for(session_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let file = Arc::new(Mutex::new(file));
        open.insert(session_id.to_string(), file.clone());
        Ok(file)
    }
}

#[async_trait]
impl Recorder for FileRecorder {
    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id).join("recording")
    }

    async fn append(&self, session_id: &str, chunk: &[u8]) {
        let result = async {
            let file = self.file_for(session_id).await?;
            let mut file = file.lock().await;
            file.write_all(chunk).await
        }
        .await;
        if let Err(e) = result {
            warn!(session_id = %session_id, error = %e, "recording write failed");
        }
    }

    async fn finish(&self, session_id: &str) {
        let file = self.open.lock().await.remove(session_id);
        if let Some(file) = file {
            let mut file = file.lock().await;
            if let Err(e) = file.flush().await {
                warn!(session_id = %session_id, error = %e, "recording flush failed");
            }
            debug!(session_id = %session_id, "recording finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset() -> Asset {
        toml::from_str(
            r#"
            id = "db1"
            host = "10.0.0.9"
            protocol = "ssh"
            mode = "terminal"
            username = "root"
            password = "pw"
            font_size = 14
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_asset_defaults() {
        let a = asset();
        assert_eq!(a.protocol(), AssetProtocol::Ssh);
        assert_eq!(a.port(), 22);
        assert_eq!(a.mode, AccessMode::Terminal);
        assert!(a.gateway.is_none());
        assert!(matches!(a.options, ProtocolOptions::Ssh(ref o) if o.font_size == Some(14)));
    }

    #[tokio::test]
    async fn test_store_transitions() {
        let store = MemorySessionStore::new();
        let rec = store.create(&asset()).await.unwrap();
        assert_eq!(rec.status, SessionStatus::NotConnected);

        store.mark_connecting(&rec.id).await.unwrap();
        assert_eq!(store.get(&rec.id).await.unwrap().status, SessionStatus::Connecting);

        store
            .mark_connected(&rec.id, Some("$abc".into()), None)
            .await
            .unwrap();
        let got = store.get(&rec.id).await.unwrap();
        assert_eq!(got.status, SessionStatus::Connected);
        assert_eq!(got.connection_id.as_deref(), Some("$abc"));
        assert!(got.connected_at.is_some());

        store.mark_disconnected(&rec.id, "remote closed").await.unwrap();
        let got = store.get(&rec.id).await.unwrap();
        assert_eq!(got.status, SessionStatus::Disconnected);
        assert_eq!(got.disconnect_reason.as_deref(), Some("remote closed"));

        assert!(matches!(
            store.mark_connecting("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_file_recorder_appends() {
        let root = std::env::temp_dir().join(format!("bastion-rec-{}", Uuid::new_v4()));
        let recorder = FileRecorder::new(&root);
        recorder.append("s1", b"hello ").await;
        recorder.append("s1", b"world").await;
        recorder.finish("s1").await;

        let path = recorder.path_for("s1");
        assert_eq!(path, root.join("s1").join("recording"));
        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content, b"hello world");
        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
