//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::gateway::ssh::RusshConnector;
use crate::gateway::GatewayManager;
use crate::sessions::Registry;
use crate::store::{AssetCatalog, ConfigCatalog, FileRecorder, MemorySessionStore, Recorder, SessionStore};

/// Shared application state for the relay.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live primary sessions, keyed by session id.
    pub sessions: Registry,
    /// Jump hosts and their forwarding tunnels.
    pub gateways: GatewayManager,
    /// Session metadata.
    pub store: Arc<dyn SessionStore>,
    /// Asset lookup.
    pub catalog: Arc<dyn AssetCatalog>,
    /// Recording sink, `None` when recording is disabled.
    pub recorder: Option<Arc<dyn Recorder>>,
}

impl AppState {
    /// Wire the built-in collaborators from `config`.
    pub fn from_config(config: Config) -> Self {
        let connector = Arc::new(RusshConnector {
            auth_timeout: Duration::from_secs(config.gateway.auth_timeout_secs),
        });
        let gateways = GatewayManager::new(connector, config.gateway.bind_host.clone());
        let catalog = Arc::new(ConfigCatalog::new(config.assets.clone()));
        let recorder: Option<Arc<dyn Recorder>> = config
            .recording
            .enabled
            .then(|| Arc::new(FileRecorder::new(&config.recording.path)) as Arc<dyn Recorder>);

        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            sessions: Registry::new(),
            gateways,
            store: Arc::new(MemorySessionStore::new()),
            catalog,
            recorder,
        }
    }
}
