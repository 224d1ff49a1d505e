//! Length-prefixed sockets over any byte stream, and TCP on top of them.
//!
//! Each frame on the wire is:
//!
//! ```text
//! [len: u32 LE][kind: u8][body: len bytes]
//! ```
//!
//! where `kind` is `0` for binary and `1` for UTF-8 text.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Acceptor;
use crate::transport::Connector;
use crate::transport::Inbound;
use crate::transport::PeerInfo;
use crate::transport::Socket;

const KIND_BINARY: u8 = 0;
const KIND_TEXT: u8 = 1;
const HEADER_LEN: usize = 5;

/// Framing limits for stream sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Largest frame body accepted or sent, in bytes.
    pub max_frame_len: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self { max_frame_len: 16 * 1024 * 1024 }
    }
}

impl StreamOptions {
    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }
}

type Reader = Box<dyn AsyncRead + Unpin + Send + Sync>;
type Writer = Box<dyn AsyncWrite + Unpin + Send + Sync>;

pub struct StreamSocket {
    reader: AsyncMutex<Reader>,
    writer: AsyncMutex<Writer>,
    closed: watch::Sender<bool>,
    options: StreamOptions,
}

impl std::fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSocket").field("options", &self.options).finish_non_exhaustive()
    }
}

impl StreamSocket {
    pub fn new<S>(stream: S, options: StreamOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: AsyncMutex::new(Box::new(reader)),
            writer: AsyncMutex::new(Box::new(writer)),
            closed: watch::Sender::new(false),
            options,
        }
    }

    /// Sends a text frame. Text carries no RPC traffic.
    pub async fn send_text(&self, text: &str) -> transport::Result<()> {
        self.write_frame(KIND_TEXT, text.as_bytes()).await
    }

    async fn write_frame(&self, kind: u8, body: &[u8]) -> transport::Result<()> {
        if self.is_closed() {
            return Err(transport::Error::Closed);
        }
        if body.len() > self.options.max_frame_len {
            return Err(transport::Error::PayloadTooLarge { len: body.len(), max: self.options.max_frame_len });
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.push(kind);
        buf.extend_from_slice(body);

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_frame(reader: &mut Reader, max: usize) -> transport::Result<Option<Inbound>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > max {
        return Err(transport::Error::PayloadTooLarge { len, max });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    match header[4] {
        KIND_BINARY => Ok(Some(Inbound::Binary(body))),
        KIND_TEXT => String::from_utf8(body)
            .map(|text| Some(Inbound::Text(text)))
            .map_err(|_| transport::Error::Io("text frame is not valid UTF-8".into())),
        kind => Err(transport::Error::Io(format!("unknown frame kind {}", kind))),
    }
}

#[async_trait::async_trait]
impl Socket for StreamSocket {
    async fn send(&self, bytes: &[u8]) -> transport::Result<()> {
        self.write_frame(KIND_BINARY, bytes).await
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        tokio::select! {
            frame = read_frame(&mut *reader, self.options.max_frame_len) => frame,
            _ = closed.wait_for(|c| *c) => Ok(None),
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // Shutting down the write half is what the peer observes as EOF.
        let _ = self.writer.lock().await.shutdown().await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Accepts TCP connections as `StreamSocket`s.
pub struct TcpAcceptor {
    listener: TcpListener,
    options: StreamOptions,
}

impl TcpAcceptor {
    pub async fn bind(addr: impl ToSocketAddrs, options: StreamOptions) -> transport::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, options })
    }

    pub fn local_addr(&self) -> transport::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait::async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> transport::Result<Option<(Arc<dyn Socket>, PeerInfo)>> {
        let (stream, addr) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let socket: Arc<dyn Socket> = Arc::new(StreamSocket::new(stream, self.options));
        Ok(Some((socket, PeerInfo::new(addr.ip().to_string()))))
    }
}

/// Dials a fixed TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    options: StreamOptions,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, options: StreamOptions) -> Self {
        Self { addr: addr.into(), options }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> transport::Result<Arc<dyn Socket>> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        Ok(Arc::new(StreamSocket::new(stream, self.options)))
    }
}
