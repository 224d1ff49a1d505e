//! # Transport Abstraction
//!
//! A minimal, async interface for moving whole frames between two peers.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: A socket knows nothing about services, schemas or
//!   sequences. It moves opaque buffers, one frame at a time.
//! - **Message-Preserving**: One `send` arrives as exactly one `recv` on the other
//!   side. Stream transports add their own length prefix.
//! - **Duplex**: Either side may send at any time; there is no request/response
//!   pairing at this layer.

use std::fmt;
use std::sync::Arc;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The socket was closed locally.
    Closed,
    /// The peer is unreachable or dropped the connection.
    ConnectionLost(String),
    /// A frame exceeds the configured size limit.
    PayloadTooLarge { len: usize, max: usize },
    /// Generic I/O error or malformed transport framing.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "socket closed"),
            Self::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds limit of {}", len, max)
            }
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => Self::ConnectionLost(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Binary(Vec<u8>),
    /// Text frames carry no RPC traffic; the runtime logs and ignores them.
    Text(String),
}

/// What the transport knows about the other end of an accepted socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Address reported by the transport itself.
    pub peer_addr: Option<String>,
    /// Raw forwarded-for header, when a proxy in front of the server supplies one.
    pub forwarded_for: Option<String>,
}

impl PeerInfo {
    pub fn new(peer_addr: impl Into<String>) -> Self {
        Self { peer_addr: Some(peer_addr.into()), forwarded_for: None }
    }

    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }
}

/// A bidirectional, message-preserving socket.
///
/// This trait is designed to be object-safe (`Arc<dyn Socket>`): the runtime
/// reads from one task and writes from many.
#[async_trait::async_trait]
pub trait Socket: Send + Sync + 'static {
    /// Sends one binary frame.
    ///
    /// # Invariants
    /// - Concurrent sends never interleave their bytes.
    /// - Fails with `Closed` once `close` has been called.
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Receives the next frame, or `None` once the socket is closed by either side.
    ///
    /// Only one task reads from a socket at a time.
    async fn recv(&self) -> Result<Option<Inbound>>;

    /// Closes the socket. A pending `recv` on either end returns `None`.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// The listening side: yields sockets as peers connect.
#[async_trait::async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// Waits for the next peer, or `None` when no more will arrive.
    async fn accept(&self) -> Result<Option<(Arc<dyn Socket>, PeerInfo)>>;
}

/// The dialing side: opens a fresh socket to a fixed destination.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn Socket>>;
}
