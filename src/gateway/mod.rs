//! Jump-host tunnel manager.
//!
//! A [`Gateway`] is an SSH jump host. The first [`GatewayManager::open_tunnel`]
//! call connects and authenticates a client that every tunnel through that
//! gateway then shares; the last [`GatewayManager::close_tunnel`] disconnects
//! it again. Each tunnel is a [`Forwarder`] bound to an ephemeral local port,
//! so guacd or the terminal transport can reach an asset behind the jump host
//! as if it were local.
//!
//! ## Concurrency
//!
//! Each gateway has its own mutex guarding its client and tunnel map; it is
//! held across connect so concurrent opens authenticate once. The manager's
//! map only takes a write lock on registration, so gateways never block each
//! other.

pub mod forwarder;
pub mod ssh;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::error::GatewayError;
use forwarder::Forwarder;
use ssh::{GatewayParams, SshClient, SshConnector};

/// Published connectivity of one gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStatus {
    pub id: String,
    pub name: String,
    pub connected: bool,
    /// Last error, empty when healthy.
    pub message: String,
    pub tunnels: usize,
}

struct GatewayInner {
    /// Present iff `tunnels` is non-empty.
    client: Option<Arc<dyn SshClient>>,
    tunnels: HashMap<String, Forwarder>,
}

pub struct Gateway {
    params: GatewayParams,
    inner: Mutex<GatewayInner>,
    status: watch::Sender<GatewayStatus>,
}

impl Gateway {
    fn new(params: GatewayParams) -> Self {
        let status = GatewayStatus {
            id: params.id.clone(),
            name: params.name.clone(),
            ..GatewayStatus::default()
        };
        Self {
            params,
            inner: Mutex::new(GatewayInner {
                client: None,
                tunnels: HashMap::new(),
            }),
            status: watch::Sender::new(status),
        }
    }

    pub fn params(&self) -> &GatewayParams {
        &self.params
    }

    pub fn status(&self) -> GatewayStatus {
        self.status.borrow().clone()
    }

    /// Live status updates.
    pub fn subscribe(&self) -> watch::Receiver<GatewayStatus> {
        self.status.subscribe()
    }

    fn publish(&self, connected: bool, message: impl Into<String>, tunnels: usize) {
        let message = message.into();
        self.status.send_modify(|s| {
            s.connected = connected;
            s.message = message;
            s.tunnels = tunnels;
        });
    }
}

/// Registry of gateways plus the connector used to reach them.
///
/// Cloneable; all clones share the same gateways.
#[derive(Clone)]
pub struct GatewayManager {
    gateways: Arc<RwLock<HashMap<String, Arc<Gateway>>>>,
    connector: Arc<dyn SshConnector>,
    bind_host: String,
}

impl GatewayManager {
    pub fn new(connector: Arc<dyn SshConnector>, bind_host: impl Into<String>) -> Self {
        Self {
            gateways: Arc::new(RwLock::new(HashMap::new())),
            connector,
            bind_host: bind_host.into(),
        }
    }

    /// Add or replace a gateway. A replaced gateway is torn down.
    pub async fn register(&self, params: GatewayParams) {
        let id = params.id.clone();
        let previous = self
            .gateways
            .write()
            .await
            .insert(id.clone(), Arc::new(Gateway::new(params)));
        if let Some(old) = previous {
            teardown(&old).await;
        }
        info!(gateway = %id, "gateway registered");
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Gateway>> {
        self.gateways.read().await.get(id).cloned()
    }

    async fn require(&self, id: &str) -> Result<Arc<Gateway>, GatewayError> {
        self.get(id)
            .await
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    /// Status of every gateway, sorted by id.
    pub async fn list(&self) -> Vec<GatewayStatus> {
        let mut out: Vec<GatewayStatus> = self
            .gateways
            .read()
            .await
            .values()
            .map(|g| g.status())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Expose `remote_host:remote_port` through the gateway on a local port.
    ///
    /// Returns the local `(host, port)` to connect to. A tunnel already
    /// registered under `tunnel_id` is replaced.
    pub async fn open_tunnel(
        &self,
        gateway_id: &str,
        tunnel_id: &str,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(String, u16), GatewayError> {
        let gateway = self.require(gateway_id).await?;
        let mut inner = gateway.inner.lock().await;

        let client = if let Some(client) = &inner.client {
            client.clone()
        } else {
            match self.connector.connect(&gateway.params).await {
                Ok(client) => {
                    inner.client = Some(client.clone());
                    client
                }
                Err(e) => {
                    warn!(gateway = %gateway_id, error = %e, "gateway connect failed");
                    gateway.publish(false, e.to_string(), inner.tunnels.len());
                    return Err(e);
                }
            }
        };

        let forwarder = match TcpListener::bind((self.bind_host.as_str(), 0))
            .await
            .and_then(|listener| {
                Forwarder::spawn(
                    listener,
                    client,
                    remote_host.to_string(),
                    remote_port,
                    tunnel_id.to_string(),
                )
            }) {
            Ok(f) => f,
            Err(e) => {
                warn!(gateway = %gateway_id, error = %e, "failed to bind forwarding port");
                if inner.tunnels.is_empty() {
                    if let Some(client) = inner.client.take() {
                        client.close().await;
                    }
                    gateway.publish(false, e.to_string(), 0);
                }
                return Err(GatewayError::Bind(e));
            }
        };

        let local_port = forwarder.local_addr().port();
        info!(
            gateway = %gateway_id,
            tunnel = %tunnel_id,
            local_port,
            remote = %forwarder.remote(),
            "gateway tunnel opened"
        );
        if let Some(old) = inner.tunnels.insert(tunnel_id.to_string(), forwarder) {
            old.stop().await;
        }
        gateway.publish(true, "", inner.tunnels.len());

        Ok((self.bind_host.clone(), local_port))
    }

    /// Stop one tunnel. Disconnects the gateway client when it was the last.
    pub async fn close_tunnel(&self, gateway_id: &str, tunnel_id: &str) {
        let Some(gateway) = self.get(gateway_id).await else {
            return;
        };
        let mut inner = gateway.inner.lock().await;
        let Some(forwarder) = inner.tunnels.remove(tunnel_id) else {
            return;
        };
        forwarder.stop().await;
        info!(gateway = %gateway_id, tunnel = %tunnel_id, "gateway tunnel closed");

        if inner.tunnels.is_empty() {
            if let Some(client) = inner.client.take() {
                client.close().await;
            }
            gateway.publish(false, "", 0);
        } else {
            let status = gateway.status();
            gateway.publish(status.connected, status.message, inner.tunnels.len());
        }
    }

    /// Drop every tunnel and the client, then probe the jump host once.
    pub async fn reconnect(&self, gateway_id: &str) -> Result<GatewayStatus, GatewayError> {
        let gateway = self.require(gateway_id).await?;
        teardown(&gateway).await;

        let _inner = gateway.inner.lock().await;
        match self.connector.connect(&gateway.params).await {
            Ok(client) => {
                client.close().await;
                gateway.publish(true, "", 0);
                info!(gateway = %gateway_id, "gateway probe succeeded");
            }
            Err(e) => {
                warn!(gateway = %gateway_id, error = %e, "gateway probe failed");
                gateway.publish(false, e.to_string(), 0);
            }
        }
        Ok(gateway.status())
    }

    /// Tear down every gateway.
    pub async fn shutdown(&self) {
        let gateways: Vec<Arc<Gateway>> = self.gateways.read().await.values().cloned().collect();
        for gateway in gateways {
            teardown(&gateway).await;
        }
    }
}

async fn teardown(gateway: &Gateway) {
    let mut inner = gateway.inner.lock().await;
    for (_, forwarder) in inner.tunnels.drain() {
        forwarder.stop().await;
    }
    if let Some(client) = inner.client.take() {
        client.close().await;
    }
    gateway.publish(false, "", 0);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ssh::{GatewayParams, RemoteStream, SshClient, SshConnector};
    use crate::error::GatewayError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpStream;

    /// Connector whose clients dial targets directly.
    #[derive(Default)]
    pub struct FakeConnector {
        pub connects: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
        pub fail: AtomicBool,
    }

    pub struct FakeClient {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SshConnector for FakeConnector {
        async fn connect(
            &self,
            params: &GatewayParams,
        ) -> Result<Arc<dyn SshClient>, GatewayError> {
            // Widen the race window for concurrent opens.
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(GatewayError::Unavailable(format!(
                    "auth failed for {}",
                    params.username
                )));
            }
            Ok(Arc::new(FakeClient {
                closes: self.closes.clone(),
            }))
        }
    }

    #[async_trait]
    impl SshClient for FakeClient {
        async fn dial(&self, host: &str, port: u16) -> std::io::Result<Box<dyn RemoteStream>> {
            Ok(Box::new(TcpStream::connect((host, port)).await?))
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn params(id: &str) -> GatewayParams {
        GatewayParams {
            id: id.into(),
            name: format!("gateway {id}"),
            host: "jump.invalid".into(),
            port: 22,
            username: "ops".into(),
            password: Some("pw".into()),
            private_key: None,
            passphrase: None,
            host_key_fingerprint: None,
        }
    }
}
