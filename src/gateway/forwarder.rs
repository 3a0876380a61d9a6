//! Local port forwarding through a gateway SSH client.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use super::ssh::SshClient;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts local connections and relays each to `remote_host:remote_port`
/// through the gateway.
///
/// Owns its listener; stopping the forwarder drops it and aborts every copy
/// task.
pub struct Forwarder {
    local_addr: SocketAddr,
    remote: String,
    task: JoinHandle<()>,
}

impl Forwarder {
    pub fn spawn(
        listener: TcpListener,
        client: Arc<dyn SshClient>,
        remote_host: String,
        remote_port: u16,
        tunnel_id: String,
    ) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let remote = format!("{remote_host}:{remote_port}");
        let task = tokio::spawn(accept_loop(
            listener,
            client,
            remote_host,
            remote_port,
            tunnel_id,
        ));
        Ok(Self {
            local_addr,
            remote,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Stop accepting and tear down in-flight connections.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    client: Arc<dyn SshClient>,
    remote_host: String,
    remote_port: u16,
    tunnel_id: String,
) {
    // Dropped with this task, aborting every copy task.
    let mut conns = JoinSet::new();
    let listener = &listener;
    loop {
        tokio::select! {
            (local, peer) = next_connection(move || listener.accept(), &tunnel_id) => {
                debug!(tunnel = %tunnel_id, peer = %peer, "forwarder accepted connection");
                let client = client.clone();
                let host = remote_host.clone();
                let id = tunnel_id.clone();
                conns.spawn(async move {
                    match client.dial(&host, remote_port).await {
                        Ok(remote) => relay(local, remote).await,
                        Err(e) => {
                            warn!(tunnel = %id, target = %format!("{host}:{remote_port}"), error = %e, "gateway dial failed");
                        }
                    }
                });
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    }
}

/// Call `accept` until it succeeds, sleeping [`ACCEPT_BACKOFF`] after each
/// failure.
async fn next_connection<T, A, Fut>(mut accept: A, tunnel_id: &str) -> T
where
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(tunnel = %tunnel_id, error = %e, "forwarder accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Copy both directions in independent tasks. Each direction half-closes its
/// writer when its reader hits EOF.
async fn relay<R>(local: TcpStream, remote: R)
where
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (local_read, local_write) = local.into_split();
    let (remote_read, remote_write) = tokio::io::split(remote);

    let mut copies = JoinSet::new();
    copies.spawn(pipe(local_read, remote_write));
    copies.spawn(pipe(remote_read, local_write));
    while copies.join_next().await.is_some() {}
}

async fn pipe<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}
