//! SSH client seams and their russh implementation.
//!
//! [`SshConnector`] and [`SshClient`] are the only things the gateway manager
//! knows about SSH, so tests can swap in a client that dials locally.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::keys::{decode_secret_key, HashAlg, PublicKey};
use russh::{Disconnect, Preferred};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::GatewayError;

/// A bidirectional byte stream to a remote target.
pub trait RemoteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RemoteStream for T {}

/// Credentials for a jump host or terminal target.
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        key_pem: String,
        passphrase: Option<String>,
    },
}

/// Jump-host identity and SSH parameters, as configured under `[[gateways]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayParams {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
    /// Pinned `SHA256:<base64>` host-key fingerprint. Any key is accepted
    /// when unset.
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl GatewayParams {
    /// Private key wins over password when both are set.
    pub fn auth(&self) -> SshAuth {
        match &self.private_key {
            Some(key) if !key.is_empty() => SshAuth::PrivateKey {
                key_pem: key.clone(),
                passphrase: self.passphrase.clone(),
            },
            _ => SshAuth::Password(self.password.clone().unwrap_or_default()),
        }
    }
}

/// Establishes authenticated SSH clients.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, params: &GatewayParams) -> Result<Arc<dyn SshClient>, GatewayError>;
}

/// An authenticated SSH client able to open forwarded connections.
#[async_trait]
pub trait SshClient: Send + Sync {
    /// Open a direct-tcpip connection to `host:port` on the far side.
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<Box<dyn RemoteStream>>;

    async fn close(&self);
}

/// russh client configuration shared by gateways and terminals.
pub(crate) fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        nodelay: true,
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        preferred: Preferred {
            kex: Cow::Borrowed(&[
                russh::kex::CURVE25519,
                russh::kex::CURVE25519_PRE_RFC_8731,
                russh::kex::ECDH_SHA2_NISTP256,
                russh::kex::ECDH_SHA2_NISTP384,
                russh::kex::DH_G16_SHA512,
                russh::kex::DH_G14_SHA256,
                russh::kex::EXTENSION_SUPPORT_AS_CLIENT,
            ]),
            ..Preferred::default()
        },
        ..client::Config::default()
    })
}

/// OpenSSH-style `SHA256:<base64>` fingerprint of a public key.
pub(crate) fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Accepts the server key when it matches the pinned fingerprint, or
/// unconditionally when none is pinned.
pub(crate) struct HostKeyHandler {
    pub(crate) label: String,
    pub(crate) expected: Option<String>,
}

impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(expected) = self.expected.as_deref().map(str::trim).filter(|e| !e.is_empty())
        else {
            debug!(target_host = %self.label, "no pinned host key, accepting");
            return Ok(true);
        };
        let actual = fingerprint(server_public_key);
        if actual == expected {
            Ok(true)
        } else {
            warn!(
                target_host = %self.label,
                expected = %expected,
                actual = %actual,
                "host key mismatch"
            );
            Ok(false)
        }
    }
}

/// Connect to `host:port` and authenticate, all within `timeout`.
pub(crate) async fn connect_authenticated(
    host: &str,
    port: u16,
    username: &str,
    auth: &SshAuth,
    host_key_fingerprint: Option<String>,
    timeout: Duration,
) -> Result<Handle<HostKeyHandler>, String> {
    let handler = HostKeyHandler {
        label: format!("{host}:{port}"),
        expected: host_key_fingerprint,
    };

    let attempt = async {
        let mut handle = client::connect(client_config(), (host, port), handler)
            .await
            .map_err(|e| format!("connect to {host}:{port} failed: {e}"))?;

        let result = match auth {
            SshAuth::Password(password) => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| format!("password authentication error: {e}"))?,
            SshAuth::PrivateKey {
                key_pem,
                passphrase,
            } => {
                let key = decode_secret_key(key_pem, passphrase.as_deref())
                    .map_err(|e| format!("invalid private key: {e}"))?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| format!("key negotiation error: {e}"))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        username,
                        russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
                    .map_err(|e| format!("public key authentication error: {e}"))?
            }
        };

        match result {
            AuthResult::Success => Ok(handle),
            AuthResult::Failure { .. } => Err(format!("authentication rejected for {username}")),
        }
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| format!("timed out after {}s connecting to {host}:{port}", timeout.as_secs()))?
}

/// [`SshConnector`] backed by russh.
pub struct RusshConnector {
    pub auth_timeout: Duration,
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, params: &GatewayParams) -> Result<Arc<dyn SshClient>, GatewayError> {
        let handle = connect_authenticated(
            &params.host,
            params.port,
            &params.username,
            &params.auth(),
            params.host_key_fingerprint.clone(),
            self.auth_timeout,
        )
        .await
        .map_err(GatewayError::Unavailable)?;

        info!(gateway = %params.id, host = %params.host, "gateway SSH client connected");
        Ok(Arc::new(RusshClient { handle }))
    }
}

struct RusshClient {
    handle: Handle<HostKeyHandler>,
}

#[async_trait]
impl SshClient for RusshClient {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<Box<dyn RemoteStream>> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await
        {
            debug!(error = %e, "gateway disconnect failed");
        }
    }
}
