//! # Connection
//!
//! The server's view of one accepted socket: who is on the other end, the
//! application's session value, and the only path for writing frames to it.

use std::sync::Arc;

use duorpc::ApiError;
use duorpc::CodecError;
use duorpc::Protocol;
use duorpc::Value;
use duorpc::frame;
use duorpc::protocol;

use crate::call::ApiCall;
use crate::transport;
use crate::transport::PeerInfo;
use crate::transport::Socket;

#[derive(Debug)]
pub enum Error {
    Transport(transport::Error),
    Protocol(protocol::Error),
    Frame(frame::Error),
    Codec(CodecError),
    /// No message service with this name.
    UnknownMessage(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::Frame(e) => write!(f, "frame error: {}", e),
            Self::Codec(e) => write!(f, "codec error: {}", e),
            Self::UnknownMessage(name) => write!(f, "unknown message '{}'", name),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<protocol::Error> for Error {
    fn from(e: protocol::Error) -> Self {
        Self::Protocol(e)
    }
}

impl From<frame::Error> for Error {
    fn from(e: frame::Error) -> Self {
        Self::Frame(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Server-assigned connection identifier, unique per server.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Derives the address logged and exposed for a peer.
///
/// The first entry of a forwarded-for header wins when it is present and
/// non-empty; otherwise the transport's own peer address is used. A leading
/// `::ffff:` (IPv4-mapped IPv6) is stripped.
pub fn resolve_remote_address(forwarded_for: Option<&str>, peer_addr: Option<&str>) -> String {
    let forwarded = forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty());
    let addr = forwarded.or(peer_addr).unwrap_or_default();
    addr.strip_prefix("::ffff:").unwrap_or(addr).to_string()
}

pub struct Connection<S> {
    id: ConnId,
    remote_address: String,
    session: S,
    socket: Arc<dyn Socket>,
    protocol: Protocol,
    log_frames: bool,
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_address", &self.remote_address)
            .finish_non_exhaustive()
    }
}

impl<S: Send + Sync + 'static> Connection<S> {
    pub(crate) fn new(
        id: ConnId,
        peer: &PeerInfo,
        session: S,
        socket: Arc<dyn Socket>,
        protocol: Protocol,
        log_frames: bool,
    ) -> Self {
        let remote_address = resolve_remote_address(peer.forwarded_for.as_deref(), peer.peer_addr.as_deref());
        Self { id, remote_address, session, socket, protocol, log_frames }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    pub(crate) fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    /// Sends a successful response to `call`.
    ///
    /// The value is encoded before the call's response is claimed, so an encode
    /// failure leaves the call free to be answered with an error instead. If a
    /// response was already sent this is a no-op.
    pub async fn send_api_success(&self, call: &ApiCall<S>, value: &Value) -> Result<()> {
        let service = call.service();
        let payload = self.protocol.encode_response(service, value)?;
        let bytes = frame::encode_output(service.id, &payload, Some(call.sequence()), Some(true))?;
        self.send_response(call, &bytes, true).await
    }

    /// Sends `ApiError { message, info }` as the response to `call`.
    pub async fn send_api_error(
        &self,
        call: &ApiCall<S>,
        message: impl Into<String>,
        info: Option<Value>,
    ) -> Result<()> {
        let error = ApiError { message: message.into(), info };
        self.send_error(call, &error).await
    }

    /// Sends an already-built error body as the response to `call`.
    pub async fn send_error(&self, call: &ApiCall<S>, error: &ApiError) -> Result<()> {
        let payload = error.encode()?;
        let bytes = frame::encode_output(call.service().id, &payload, Some(call.sequence()), Some(false))?;
        self.send_response(call, &bytes, false).await
    }

    async fn send_response(&self, call: &ApiCall<S>, bytes: &[u8], succeeded: bool) -> Result<()> {
        if !call.claim_response() {
            tracing::debug!(
                conn_id = %self.id,
                service = %call.name(),
                seq = call.sequence(),
                "response already sent, dropping duplicate"
            );
            return Ok(());
        }
        if self.log_frames {
            tracing::debug!(
                conn_id = %self.id,
                remote = %self.remote_address,
                service = %call.name(),
                seq = call.sequence(),
                succeeded,
                len = bytes.len(),
                "send response"
            );
        }
        Ok(self.socket.send(bytes).await?)
    }

    /// Pushes a one-way message to the client.
    pub async fn send_message(&self, name: &str, value: &Value) -> Result<()> {
        let service = self
            .protocol
            .registry()
            .lookup_message_by_name(name)
            .ok_or_else(|| Error::UnknownMessage(name.to_string()))?;
        let payload = self.protocol.encode_message(service, value)?;
        let bytes = frame::encode_output(service.id, &payload, None, None)?;
        if self.log_frames {
            tracing::debug!(
                conn_id = %self.id,
                remote = %self.remote_address,
                service = %name,
                len = bytes.len(),
                "send message"
            );
        }
        Ok(self.socket.send(&bytes).await?)
    }

    /// Closes the socket. Later sends fail with `transport::Error::Closed`.
    pub async fn close(&self) {
        if !self.socket.is_closed() {
            tracing::debug!(conn_id = %self.id, remote = %self.remote_address, "closing connection");
        }
        self.socket.close().await;
    }
}
