//! Raw terminal transport: an SSH shell channel with a PTY.
//!
//! The russh channel lives in a single actor task. [`Terminal`] talks to it
//! over two mpsc channels: input (keystrokes, resizes) in, output bytes out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use russh::ChannelMsg;
use russh::Disconnect;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::TerminalError;
use crate::gateway::ssh::{connect_authenticated, SshAuth};

const INPUT_QUEUE: usize = 256;
const OUTPUT_QUEUE: usize = 256;

/// Where and how to open the shell.
#[derive(Debug, Clone)]
pub struct TerminalParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    pub host_key_fingerprint: Option<String>,
    pub cols: u32,
    pub rows: u32,
    pub term: String,
    pub connect_timeout: Duration,
}

#[derive(Debug)]
enum TerminalInput {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
}

pub struct Terminal {
    label: String,
    input: mpsc::Sender<TerminalInput>,
    output: Mutex<mpsc::Receiver<Vec<u8>>>,
    open: AtomicBool,
    shutdown: CancellationToken,
}

impl Terminal {
    /// Connect, authenticate, request a PTY and start a shell.
    pub async fn connect(params: &TerminalParams) -> Result<Self, TerminalError> {
        let handle = connect_authenticated(
            &params.host,
            params.port,
            &params.username,
            &params.auth,
            params.host_key_fingerprint.clone(),
            params.connect_timeout,
        )
        .await
        .map_err(TerminalError::Connect)?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TerminalError::Channel(e.to_string()))?;
        channel
            .request_pty(false, &params.term, params.cols, params.rows, 0, 0, &[])
            .await
            .map_err(|e| TerminalError::Channel(e.to_string()))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| TerminalError::Channel(e.to_string()))?;

        let label = format!("{}@{}:{}", params.username, params.host, params.port);
        info!(target_host = %label, "terminal shell started");

        let (input_tx, mut input_rx) = mpsc::channel::<TerminalInput>(INPUT_QUEUE);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE);
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let task_label = label.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
                            if output_tx.send(data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!(target_host = %task_label, exit_status, "remote shell exited");
                        }
                        Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                    input = input_rx.recv() => match input {
                        Some(TerminalInput::Data(bytes)) => {
                            if channel.data(&bytes[..]).await.is_err() {
                                break;
                            }
                        }
                        Some(TerminalInput::Resize { cols, rows }) => {
                            let _ = channel.window_change(cols, rows, 0, 0).await;
                        }
                        None => break,
                    },
                    () = stop.cancelled() => break,
                }
            }
            let _ = channel.eof().await;
            let _ = handle
                .disconnect(Disconnect::ByApplication, "session closed", "en")
                .await;
            debug!(target_host = %task_label, "terminal actor stopped");
        });

        Ok(Self {
            label,
            input: input_tx,
            output: Mutex::new(output_rx),
            open: AtomicBool::new(true),
            shutdown,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Next chunk of shell output. `Closed` once the shell is gone.
    pub async fn read(&self) -> Result<Vec<u8>, TerminalError> {
        let mut output = self.output.lock().await;
        tokio::select! {
            chunk = output.recv() => chunk.ok_or(TerminalError::Closed),
            () = self.shutdown.cancelled() => Err(TerminalError::Closed),
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        self.send(TerminalInput::Data(data.to_vec())).await
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), TerminalError> {
        self.send(TerminalInput::Resize { cols, rows }).await
    }

    async fn send(&self, input: TerminalInput) -> Result<(), TerminalError> {
        if !self.is_open() {
            return Err(TerminalError::Closed);
        }
        self.input
            .send(input)
            .await
            .map_err(|_| TerminalError::Closed)
    }

    /// Stop the actor and disconnect. Idempotent.
    pub async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.shutdown.cancel();
            debug!(target_host = %self.label, "terminal closed");
        }
    }
}
