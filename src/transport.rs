//! Socket plumbing.
//!
//! Binary channels carry length-prefixed frames: a little-endian `u32` byte count followed by the
//! message. The launcher channel carries newline-terminated text. Each socket is serviced by its
//! own task, which forwards decoded traffic to the event loop over a channel.

use crate::error::EnsembleError;
use crate::metrics;
use crate::protocol::{HandshakeRequest, HandshakeResponse, LauncherMessage};

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{event, Level};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// How long a connecting simulation waits for its handshake response.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads one frame. Returns `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Bytes>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error),
    };
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
    })?;
    writer.write_u32_le(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// A handshake waiting for the event loop's answer.
#[derive(Debug)]
pub struct ConnectionEvent {
    pub request: HandshakeRequest,
    pub reply: oneshot::Sender<HandshakeResponse>,
}

/// Accepts simulation data connections and forwards every frame.
pub fn spawn_data_listener(listener: TcpListener, frames: mpsc::Sender<Bytes>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    event!(Level::WARN, %error, "failed to accept data connection");
                    continue;
                }
            };
            let frames = frames.clone();
            tokio::spawn(async move {
                event!(Level::DEBUG, %peer, "data connection opened");
                loop {
                    match read_frame(&mut stream).await {
                        Ok(Some(frame)) => {
                            if frames.send(frame).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            event!(Level::WARN, %peer, %error, "data connection failed");
                            break;
                        }
                    }
                }
                event!(Level::DEBUG, %peer, "data connection closed");
            });
        }
    })
}

/// Accepts simulation handshakes. Each connection carries one request and one response.
pub fn spawn_connection_listener(
    listener: TcpListener,
    connections: mpsc::Sender<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    event!(Level::WARN, %error, "failed to accept connection");
                    continue;
                }
            };
            let connections = connections.clone();
            tokio::spawn(async move {
                if let Err(error) = serve_handshake(stream, connections).await {
                    event!(Level::WARN, %peer, %error, "handshake failed");
                }
            });
        }
    })
}

async fn serve_handshake(
    mut stream: TcpStream,
    connections: mpsc::Sender<ConnectionEvent>,
) -> Result<(), EnsembleError> {
    let frame = read_frame(&mut stream)
        .await?
        .ok_or_else(|| EnsembleError::protocol("connection closed before handshake"))?;
    let request = HandshakeRequest::decode(&frame)?;
    event!(
        Level::INFO,
        simu_id = request.simu_id,
        clients = request.client_comm_size(),
        "simulation connecting"
    );
    let (reply, response) = oneshot::channel();
    connections
        .send(ConnectionEvent { request, reply })
        .await
        .map_err(|_| EnsembleError::ChannelClosed {
            channel: "connection",
        })?;
    let response = response.await.map_err(|_| EnsembleError::ChannelClosed {
        channel: "handshake reply",
    })?;
    write_frame(&mut stream, &response.encode()?).await?;
    Ok(())
}

/// Performs the simulation side of the handshake.
pub async fn handshake(
    addr: SocketAddr,
    request: &HandshakeRequest,
) -> Result<HandshakeResponse, EnsembleError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, &request.encode()?).await?;
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| EnsembleError::protocol("no handshake response"))??
        .ok_or_else(|| EnsembleError::protocol("server closed connection during handshake"))?;
    HandshakeResponse::decode(&frame)
}

/// Launcher traffic as seen by the event loop.
#[derive(Debug)]
pub struct LauncherChannel {
    pub incoming: mpsc::Receiver<LauncherMessage>,
    pub outgoing: mpsc::UnboundedSender<LauncherMessage>,
}

impl LauncherChannel {
    /// Queues `message` for the launcher.
    pub fn send(&self, message: LauncherMessage) -> Result<(), EnsembleError> {
        self.outgoing
            .send(message)
            .map_err(|_| EnsembleError::ChannelClosed { channel: "launcher" })
    }
}

/// Connects to the launcher and spawns its reader and writer tasks.
pub async fn connect_launcher(addr: &str) -> Result<LauncherChannel, EnsembleError> {
    let stream = TcpStream::connect(addr).await?;
    event!(Level::INFO, addr, "connected to launcher");
    Ok(spawn_launcher_link(stream))
}

/// Splits a launcher socket into a [LauncherChannel].
pub fn spawn_launcher_link<S>(stream: S) -> LauncherChannel
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (incoming_tx, incoming) = mpsc::channel(64);
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<LauncherMessage>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(error) => {
                    event!(Level::WARN, %error, "launcher connection failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            metrics::record_launcher_message("received", &line);
            match line.parse::<LauncherMessage>() {
                Ok(message) => {
                    if incoming_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(error) => event!(Level::WARN, %error, "ignoring launcher message"),
            }
        }
        event!(Level::INFO, "launcher connection closed");
    });

    tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let line = message.to_string();
            metrics::record_launcher_message("sent", &line);
            let written = async {
                write_half.write_all(line.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
                write_half.flush().await
            };
            if let Err(error) = written.await {
                event!(Level::WARN, %error, "failed to write to launcher");
                break;
            }
        }
    });

    LauncherChannel { incoming, outgoing }
}
