//! One TCP connection to guacd: handshake, framed reads and raw writes.
//!
//! ```text
//! relay                         guacd
//!   select <protocol|conn-id>  ->
//!                              <-  args <name>...
//!   size / audio / video /
//!   image / timezone           ->
//!   connect <values>...        ->
//!                              <-  ready <connection-id>
//! ```
//!
//! After `ready` the tunnel is a byte pipe: [`Tunnel::read`] yields one
//! complete instruction at a time and [`Tunnel::write_and_flush`] passes
//! client bytes through untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::instruction::{Instruction, InstructionReader, INTERNAL_OPCODE};
use crate::error::TunnelError;

/// Protocol version token sent for any `args` entry naming a version.
pub const PROTOCOL_VERSION: &str = "VERSION_1_5_0";

/// Default budget for the TCP dial and, separately, the handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameter value that reads back as empty.
pub const PLACEHOLDER: &str = "-";

const AUDIO_MIMETYPES: [&str; 2] = ["audio/L8", "audio/L16"];
const IMAGE_MIMETYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

const DEFAULT_WIDTH: &str = "1024";
const DEFAULT_HEIGHT: &str = "768";
const DEFAULT_DPI: &str = "96";
const DEFAULT_TIMEZONE: &str = "UTC";

/// What to ask guacd for during the handshake.
#[derive(Debug, Clone, Default)]
pub struct TunnelConfiguration {
    /// Protocol name for a new connection (`rdp`, `ssh`, ...).
    pub protocol: String,
    /// Existing connection to join instead of creating one.
    pub connection_id: Option<String>,
    pub parameters: HashMap<String, String>,
    /// Sent with the `timezone` instruction; empty means UTC.
    pub timezone: String,
}

impl TunnelConfiguration {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// Configuration joining an already running connection.
    pub fn join(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            ..Self::default()
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(name.into(), value.into());
    }

    /// Parameter value, with absent and placeholder values reading as `""`.
    pub fn get(&self, name: &str) -> &str {
        match self.parameters.get(name).map(String::as_str) {
            None | Some(PLACEHOLDER) => "",
            Some(v) => v,
        }
    }

    fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        match self.get(name) {
            "" => default,
            v => v,
        }
    }

    /// Argument for the `select` instruction.
    fn selector(&self) -> &str {
        self.connection_id.as_deref().unwrap_or(&self.protocol)
    }
}

/// A handshaken connection to guacd.
///
/// Reads and writes are each serialized by their own lock so the output pump
/// and input pump can run concurrently. After [`close`](Self::close) every
/// operation fails with [`TunnelError::Closed`].
pub struct Tunnel {
    uuid: String,
    reader: Mutex<InstructionReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    open: AtomicBool,
    shutdown: CancellationToken,
}

impl Tunnel {
    /// Dial `address` and run the handshake with the default timeouts.
    pub async fn open(address: &str, config: &TunnelConfiguration) -> Result<Self, TunnelError> {
        Self::connect(address, config, DIAL_TIMEOUT).await
    }

    /// Dial `address` and run the handshake, each bounded by `timeout`.
    pub async fn connect(
        address: &str,
        config: &TunnelConfiguration,
        timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TunnelError::ConnectTimeout(address.to_string()))?
            .map_err(|source| TunnelError::Connect {
                address: address.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = InstructionReader::new(read_half);

        // Any error drops both halves, which closes the socket.
        let uuid = tokio::time::timeout(timeout, handshake(&mut reader, &mut write_half, config))
            .await
            .map_err(|_| TunnelError::HandshakeTimeout(address.to_string()))??;
        info!(
            connection_id = %uuid,
            selector = %config.selector(),
            "guacd handshake complete"
        );

        Ok(Self {
            uuid,
            reader: Mutex::new(reader),
            writer: Mutex::new(write_half),
            open: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        })
    }

    /// Connection id returned by `ready`.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// The instruction announcing this tunnel's id to a web client.
    pub fn uuid_instruction(&self) -> Instruction {
        Instruction::new(INTERNAL_OPCODE, [self.uuid.as_str()])
    }

    /// Next complete instruction from guacd, raw bytes.
    ///
    /// An empty result means the instruction was swallowed by the audio
    /// compatibility shim and nothing should be forwarded.
    pub async fn read(&self) -> Result<Vec<u8>, TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::Closed);
        }
        let mut reader = self.reader.lock().await;
        let raw = tokio::select! {
            r = reader.read_raw() => r?,
            () = self.shutdown.cancelled() => return Err(TunnelError::Closed),
        };
        match raw {
            Some(raw) => Ok(audio_compat(raw)),
            None => {
                debug!(connection_id = %self.uuid, "guacd closed the connection");
                Err(TunnelError::Closed)
            }
        }
    }

    /// Write raw client bytes to guacd.
    pub async fn write_and_flush(&self, data: &[u8]) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::Closed);
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            r = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => r.map_err(TunnelError::from),
            () = self.shutdown.cancelled() => Err(TunnelError::Closed),
        }
    }

    pub async fn write_instruction(&self, instruction: &Instruction) -> Result<(), TunnelError> {
        self.write_and_flush(instruction.encode().as_bytes()).await
    }

    /// Close the tunnel. Unblocks pending reads and writes; safe to call more
    /// than once.
    pub async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(connection_id = %self.uuid, "guacd tunnel closed");
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, ins: &Instruction) -> Result<(), TunnelError> {
    writer.write_all(ins.encode().as_bytes()).await?;
    Ok(())
}

async fn expect<R: AsyncRead + Unpin>(
    reader: &mut InstructionReader<R>,
    opcode: &str,
) -> Result<Instruction, TunnelError> {
    match reader.read_instruction().await? {
        Some(ins) if ins.opcode == opcode => Ok(ins),
        Some(ins) => Err(TunnelError::UnexpectedOpcode {
            expected: opcode.to_string(),
            got: ins.opcode,
        }),
        None => Err(TunnelError::HandshakeClosed {
            expected: opcode.to_string(),
        }),
    }
}

async fn handshake<R, W>(
    reader: &mut InstructionReader<R>,
    writer: &mut W,
    config: &TunnelConfiguration,
) -> Result<String, TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send(writer, &Instruction::new("select", [config.selector()])).await?;
    writer.flush().await?;

    let args = expect(reader, "args").await?;

    send(
        writer,
        &Instruction::new(
            "size",
            [
                config.get_or("width", DEFAULT_WIDTH),
                config.get_or("height", DEFAULT_HEIGHT),
                config.get_or("dpi", DEFAULT_DPI),
            ],
        ),
    )
    .await?;
    send(writer, &Instruction::new("audio", AUDIO_MIMETYPES)).await?;
    send(writer, &Instruction::new("video", Vec::<String>::new())).await?;
    send(writer, &Instruction::new("image", IMAGE_MIMETYPES)).await?;
    let timezone = match config.timezone.as_str() {
        "" => DEFAULT_TIMEZONE,
        tz => tz,
    };
    send(writer, &Instruction::new("timezone", [timezone])).await?;

    send(writer, &Instruction::new("connect", connect_args(&args.args, config))).await?;
    writer.flush().await?;

    let ready = expect(reader, "ready").await?;
    match ready.args.into_iter().next() {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(TunnelError::NoConnectionId),
    }
}

/// Values for `connect`, in the order guacd listed them in `args`.
fn connect_args(names: &[String], config: &TunnelConfiguration) -> Vec<String> {
    names
        .iter()
        .map(|name| {
            if name.contains("VERSION") {
                PROTOCOL_VERSION.to_string()
            } else {
                config.get(name).to_string()
            }
        })
        .collect()
}

const AUDIO_FRAGMENT_44100: &[u8] = b"rate=44100,channels=2;";
const AUDIO_FRAGMENT_22050: &[u8] = b"rate=22050,channels=2;";
const AUDIO_L16_44100: &[u8] = b"5.audio,1.1,31.audio/L16;rate=44100,channels=2;";
const AUDIO_L16_22050: &[u8] = b"5.audio,1.1,31.audio/L16;rate=22050,channels=2;";

/// Browser audio compatibility shim.
///
/// Bare mimetype fragments are dropped, and the 16-bit PCM stream on index 1
/// is always advertised at 44.1 kHz.
fn audio_compat(raw: Vec<u8>) -> Vec<u8> {
    if raw == AUDIO_FRAGMENT_44100 || raw == AUDIO_FRAGMENT_22050 {
        return Vec::new();
    }
    if raw == AUDIO_L16_22050 {
        return AUDIO_L16_44100.to_vec();
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Fake guacd: accepts one connection, sends `args` and `ready`, then
    /// hands back what the relay sent plus the socket.
    async fn fake_daemon(
        args: &'static str,
        ready: &'static str,
    ) -> (String, tokio::task::JoinHandle<(Vec<Instruction>, TcpStream)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = InstructionReader::new(read_half);
            let mut seen = Vec::new();

            seen.push(reader.read_instruction().await.unwrap().unwrap());
            write_half.write_all(args.as_bytes()).await.unwrap();
            loop {
                let ins = reader.read_instruction().await.unwrap().unwrap();
                let done = ins.opcode == "connect";
                seen.push(ins);
                if done {
                    break;
                }
            }
            write_half.write_all(ready.as_bytes()).await.unwrap();
            let stream = reader_into_stream(reader, write_half);
            (seen, stream)
        });
        (addr, handle)
    }

    fn reader_into_stream(
        reader: InstructionReader<OwnedReadHalf>,
        write_half: OwnedWriteHalf,
    ) -> TcpStream {
        reader.into_inner().reunite(write_half).unwrap()
    }

    fn rdp_config() -> TunnelConfiguration {
        let mut config = TunnelConfiguration::new("rdp");
        config.set("hostname", "10.0.0.5");
        config.set("port", "3389");
        config.set("domain", PLACEHOLDER);
        config.timezone = "UTC".to_string();
        config
    }

    #[test]
    fn test_placeholder_reads_empty() {
        let config = rdp_config();
        assert_eq!(config.get("domain"), "");
        assert_eq!(config.get("missing"), "");
        assert_eq!(config.get("hostname"), "10.0.0.5");
    }

    #[test]
    fn test_connect_args_follow_daemon_order() {
        let names: Vec<String> = ["VERSION_1_1_0", "port", "hostname", "domain", "width"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let values = connect_args(&names, &rdp_config());
        assert_eq!(values, vec![PROTOCOL_VERSION, "3389", "10.0.0.5", "", ""]);
    }

    #[test]
    fn test_audio_shim() {
        assert!(audio_compat(AUDIO_FRAGMENT_44100.to_vec()).is_empty());
        assert!(audio_compat(AUDIO_FRAGMENT_22050.to_vec()).is_empty());
        assert_eq!(audio_compat(AUDIO_L16_22050.to_vec()), AUDIO_L16_44100);
        assert_eq!(audio_compat(b"4.sync,1.1;".to_vec()), b"4.sync,1.1;");
    }

    #[tokio::test]
    async fn test_open_handshake_sequence() {
        let (addr, daemon) = fake_daemon(
            "4.args,13.VERSION_1_5_0,8.hostname,4.port,6.domain;",
            "5.ready,37.$4b1c8f0e-1d2a-4c3b-9e8f-123456789abc;",
        )
        .await;

        let tunnel = Tunnel::open(&addr, &rdp_config()).await.unwrap();
        assert!(tunnel.is_open());
        assert_eq!(tunnel.uuid(), "$4b1c8f0e-1d2a-4c3b-9e8f-123456789abc");

        let (seen, _stream) = daemon.await.unwrap();
        let opcodes: Vec<&str> = seen.iter().map(|i| i.opcode.as_str()).collect();
        assert_eq!(
            opcodes,
            ["select", "size", "audio", "video", "image", "timezone", "connect"]
        );
        assert_eq!(seen[0].args, ["rdp"]);
        assert_eq!(seen[1].args, ["1024", "768", "96"]);
        assert_eq!(seen[2].args, ["audio/L8", "audio/L16"]);
        assert_eq!(seen[4].args, ["image/jpeg", "image/png", "image/webp"]);
        assert_eq!(seen[5].args, ["UTC"]);
        assert_eq!(seen[6].args, [PROTOCOL_VERSION, "10.0.0.5", "3389", ""]);
    }

    #[tokio::test]
    async fn test_join_selects_connection_id() {
        let (addr, daemon) = fake_daemon("4.args,9.read-only;", "5.ready,4.$abc;").await;
        let mut config = TunnelConfiguration::join("$abc");
        config.set("read-only", "true");

        let tunnel = Tunnel::open(&addr, &config).await.unwrap();
        assert_eq!(tunnel.uuid(), "$abc");

        let (seen, _stream) = daemon.await.unwrap();
        assert_eq!(seen[0].args, ["$abc"]);
        // No timezone configured: UTC is still negotiated.
        assert_eq!(seen[5].opcode, "timezone");
        assert_eq!(seen[5].args, ["UTC"]);
        assert_eq!(seen.last().unwrap().args, ["true"]);
    }

    #[tokio::test]
    async fn test_wrong_opcode_fails_and_drops_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let daemon = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"5.error,3.bad,3.256;").await.unwrap();
            // Relay must hang up after the failed handshake.
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
        });

        let err = Tunnel::open(&addr, &rdp_config()).await.err().unwrap();
        assert!(err.is_handshake());
        assert!(matches!(
            err,
            TunnelError::UnexpectedOpcode { ref expected, ref got } if expected == "args" && got == "error"
        ));
        tokio::time::timeout(Duration::from_secs(2), daemon)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_ready_without_id() {
        let (addr, _daemon) = fake_daemon("4.args,8.hostname;", "5.ready;").await;
        let err = Tunnel::open(&addr, &rdp_config()).await.err().unwrap();
        assert!(matches!(err, TunnelError::NoConnectionId));
    }

    #[tokio::test]
    async fn test_hangup_before_ready_is_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = InstructionReader::new(read_half);
            reader.read_instruction().await.unwrap();
            write_half.write_all(b"4.args,8.hostname;").await.unwrap();
            while let Some(ins) = reader.read_instruction().await.unwrap() {
                if ins.opcode == "connect" {
                    break;
                }
            }
            // Hang up without ever sending ready.
        });

        let err = Tunnel::open(&addr, &rdp_config()).await.err().unwrap();
        assert!(err.is_handshake());
        assert!(matches!(
            err,
            TunnelError::HandshakeClosed { ref expected } if expected == "ready"
        ));
    }

    #[tokio::test]
    async fn test_silent_daemon_times_out_and_drops_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let daemon = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Never answer; wait for the relay to give up and hang up.
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            Tunnel::connect(&addr, &rdp_config(), Duration::from_millis(100)),
        )
        .await
        .unwrap()
        .err()
        .unwrap();
        assert!(err.is_handshake());
        assert!(matches!(err, TunnelError::HandshakeTimeout(_)));
        tokio::time::timeout(Duration::from_secs(2), daemon)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = Tunnel::open(&addr, &rdp_config()).await.err().unwrap();
        assert!(matches!(err, TunnelError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_read_write_and_close() {
        let (addr, daemon) = fake_daemon("4.args,8.hostname;", "5.ready,4.$xyz;").await;
        let tunnel = std::sync::Arc::new(Tunnel::open(&addr, &rdp_config()).await.unwrap());
        let (_, mut stream) = daemon.await.unwrap();

        stream
            .write_all(b"4.sync,3.100;5.audio,1.1,31.audio/L16;rate=22050,channels=2;")
            .await
            .unwrap();
        assert_eq!(tunnel.read().await.unwrap(), b"4.sync,3.100;");
        assert_eq!(tunnel.read().await.unwrap(), AUDIO_L16_44100);

        tunnel.write_and_flush(b"3.key,5.65307,1.1;").await.unwrap();
        let mut buf = vec![0u8; 18];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"3.key,5.65307,1.1;");

        // A blocked read returns once the tunnel is closed.
        let reader = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tunnel.close().await;
        tunnel.close().await;
        assert!(!tunnel.is_open());
        let res = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(TunnelError::Closed)));
        assert!(matches!(
            tunnel.write_and_flush(b"x").await,
            Err(TunnelError::Closed)
        ));
    }
}
