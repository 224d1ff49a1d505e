//! # Server
//!
//! Accepts sockets, keeps the connection table, and runs the dispatch pipeline
//! for every inbound frame.
//!
//! ## Pipeline
//!
//! ```text
//! bytes -> envelope -> service lookup -> body decode -> flow chain -> handler
//! ```
//!
//! Each connection is served by one task that awaits the whole pipeline for a
//! frame before reading the next, so calls on a connection are processed in
//! arrival order. Malformed input is logged and dropped without affecting
//! other calls; only a bad API body is answered, with `INVALID_REQUEST`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use duorpc::ApiError;
use duorpc::Protocol;
use duorpc::Value;
use duorpc::error::INVALID_REQUEST;
use duorpc::error::UNHANDLED_API;
use duorpc::frame;
use tokio::sync::watch;
use tracing::Instrument;

use crate::call::ApiCall;
use crate::call::MsgCall;
use crate::connection;
use crate::connection::ConnId;
use crate::connection::Connection;
use crate::error::HandlerError;
use crate::error::guard;
use crate::flow::Decision;
use crate::flow::FlowChain;
use crate::handlers;
use crate::handlers::ApiHandlers;
use crate::handlers::ListenerId;
use crate::handlers::Listeners;
use crate::transport;
use crate::transport::Acceptor;
use crate::transport::Inbound;
use crate::transport::PeerInfo;
use crate::transport::Socket;

#[derive(Debug)]
pub enum Error {
    /// The name is not an API (or message) in the catalog.
    UnknownService(String),
    Handlers(handlers::Error),
    Transport(transport::Error),
    Connection(connection::Error),
    /// No open connection with this ID.
    UnknownConnection(ConnId),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownService(name) => write!(f, "unknown service '{}'", name),
            Self::Handlers(e) => write!(f, "{}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::Connection(e) => write!(f, "{}", e),
            Self::UnknownConnection(id) => write!(f, "no open connection {}", id),
        }
    }
}

impl std::error::Error for Error {}

impl From<handlers::Error> for Error {
    fn from(e: handlers::Error) -> Self {
        Self::Handlers(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<connection::Error> for Error {
    fn from(e: connection::Error) -> Self {
        Self::Connection(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pause after a local accept failure before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerOptions {
    /// Log every frame sent and received at `debug` level.
    pub log_frames: bool,
}

impl ServerOptions {
    pub fn log_frames(mut self, enabled: bool) -> Self {
        self.log_frames = enabled;
        self
    }
}

/// Collects flows and handlers before the server starts.
///
/// `S` is the per-connection session value, opaque to the runtime.
pub struct ServerBuilder<S> {
    protocol: Protocol,
    options: ServerOptions,
    api_flow: FlowChain<ApiCall<S>>,
    msg_flow: FlowChain<MsgCall<S>>,
    apis: ApiHandlers<Arc<ApiCall<S>>>,
    listeners: Listeners<Arc<MsgCall<S>>>,
}

impl<S: Send + Sync + 'static> ServerBuilder<S> {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            options: ServerOptions::default(),
            api_flow: FlowChain::new(),
            msg_flow: FlowChain::new(),
            apis: ApiHandlers::default(),
            listeners: Listeners::default(),
        }
    }

    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Flow items run for every API call, before its handler.
    pub fn api_flow(&mut self) -> &mut FlowChain<ApiCall<S>> {
        &mut self.api_flow
    }

    /// Flow items run for every message, before its listeners.
    pub fn msg_flow(&mut self) -> &mut FlowChain<MsgCall<S>> {
        &mut self.msg_flow
    }

    /// Registers the handler for an API.
    ///
    /// # Errors
    /// `UnknownService` if the catalog has no API with this name, and
    /// `AlreadyImplemented` on a second registration.
    pub fn implement_api<F, Fut>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Arc<ApiCall<S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        if self.protocol.registry().lookup_api_by_name(name).is_none() {
            return Err(Error::UnknownService(name.to_string()));
        }
        self.apis.implement(name, handlers::handler(f))?;
        Ok(())
    }

    /// Adds a listener for a message. Listeners run in registration order.
    pub fn listen_message<F, Fut>(&mut self, name: &str, f: F) -> Result<ListenerId>
    where
        F: Fn(Arc<MsgCall<S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        if self.protocol.registry().lookup_message_by_name(name).is_none() {
            return Err(Error::UnknownService(name.to_string()));
        }
        Ok(self.listeners.listen(name, handlers::handler(f)))
    }

    /// Removes one listener, or all listeners for `name` when `id` is `None`.
    pub fn unlisten_message(&mut self, name: &str, id: Option<ListenerId>) -> usize {
        self.listeners.unlisten(name, id)
    }

    pub fn start(self) -> Server<S> {
        tracing::info!(
            services = self.protocol.registry().len(),
            apis = self.apis.len(),
            "server started"
        );
        Server {
            inner: Arc::new(ServerInner {
                protocol: self.protocol,
                options: self.options,
                api_flow: self.api_flow,
                msg_flow: self.msg_flow,
                apis: self.apis,
                listeners: self.listeners,
                connections: DashMap::new(),
                next_conn_id: AtomicU64::new(1),
                stopped: watch::Sender::new(false),
            }),
        }
    }
}

struct ServerInner<S> {
    protocol: Protocol,
    options: ServerOptions,
    api_flow: FlowChain<ApiCall<S>>,
    msg_flow: FlowChain<MsgCall<S>>,
    apis: ApiHandlers<Arc<ApiCall<S>>>,
    listeners: Listeners<Arc<MsgCall<S>>>,
    connections: DashMap<ConnId, Arc<Connection<S>>>,
    next_conn_id: AtomicU64,
    stopped: watch::Sender<bool>,
}

/// A running server. Cheap to clone; clones share the connection table.
pub struct Server<S> {
    inner: Arc<ServerInner<S>>,
}

impl<S> Clone for Server<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: Send + Sync + 'static> Server<S> {
    pub fn protocol(&self) -> &Protocol {
        &self.inner.protocol
    }

    /// Accepts sockets from `acceptor` until it is exhausted or the server stops.
    ///
    /// A failed accept is logged and retried; only `None` from the acceptor
    /// ends the loop. Local I/O failures (often descriptor exhaustion) wait
    /// `ACCEPT_BACKOFF` before the next attempt.
    ///
    /// `make_session` builds the session value for each new connection.
    pub async fn serve<A, F>(&self, acceptor: A, make_session: F) -> Result<()>
    where
        A: Acceptor,
        F: Fn(&PeerInfo) -> S + Send + Sync + 'static,
    {
        let mut stopped = self.inner.stopped.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = acceptor.accept() => accepted,
                _ = stopped.wait_for(|s| *s) => return Ok(()),
            };
            let (socket, peer) = match accepted {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    if matches!(e, transport::Error::Io(_)) {
                        tokio::select! {
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                            _ = stopped.wait_for(|s| *s) => return Ok(()),
                        }
                    }
                    continue;
                }
            };
            let session = make_session(&peer);
            self.accept(socket, peer, session);
        }
    }

    /// Attaches one socket and spawns the task that serves it.
    pub fn accept(&self, socket: Arc<dyn Socket>, peer: PeerInfo, session: S) -> Arc<Connection<S>> {
        let id = ConnId(self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(
            id,
            &peer,
            session,
            socket,
            self.inner.protocol.clone(),
            self.inner.options.log_frames,
        ));

        if *self.inner.stopped.borrow() {
            tracing::warn!(conn_id = %id, "server stopped, refusing connection");
            let closing = conn.clone();
            tokio::spawn(async move { closing.close().await });
            return conn;
        }

        self.inner.connections.insert(id, conn.clone());
        tracing::info!(conn_id = %id, remote = %conn.remote_address(), "connection opened");

        let span = tracing::info_span!("conn", conn_id = %id, remote = %conn.remote_address());
        let inner = self.inner.clone();
        let task_conn = conn.clone();
        tokio::spawn(async move { inner.serve_connection(task_conn).await }.instrument(span));

        conn
    }

    /// Pushes a message to one connection.
    pub async fn send_message(&self, conn_id: ConnId, name: &str, value: &Value) -> Result<()> {
        let conn = self.connection(conn_id).ok_or(Error::UnknownConnection(conn_id))?;
        Ok(conn.send_message(name, value).await?)
    }

    /// Pushes a message to several connections. Failures are logged and
    /// skipped; returns how many sends succeeded.
    pub async fn multicast_message(&self, conn_ids: &[ConnId], name: &str, value: &Value) -> usize {
        let mut delivered = 0;
        for id in conn_ids {
            match self.send_message(*id, name, value).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(conn_id = %id, service = %name, error = %e, "message not delivered"),
            }
        }
        delivered
    }

    pub fn connection(&self, id: ConnId) -> Option<Arc<Connection<S>>> {
        self.inner.connections.get(&id).map(|c| c.value().clone())
    }

    /// IDs of all open connections, in ascending order.
    pub fn connection_ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<_> = self.inner.connections.iter().map(|c| *c.key()).collect();
        ids.sort();
        ids
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Stops accepting and closes every connection.
    pub async fn stop(&self) {
        self.inner.stopped.send_replace(true);
        let conns: Vec<_> = self.inner.connections.iter().map(|c| c.value().clone()).collect();
        for conn in conns {
            conn.close().await;
            self.inner.connections.remove(&conn.id());
        }
        tracing::info!("server stopped");
    }
}

impl<S: Send + Sync + 'static> ServerInner<S> {
    async fn serve_connection(self: Arc<Self>, conn: Arc<Connection<S>>) {
        loop {
            match conn.socket().recv().await {
                Ok(Some(Inbound::Binary(bytes))) => self.dispatch(&conn, &bytes).await,
                Ok(Some(Inbound::Text(text))) => {
                    tracing::debug!(len = text.len(), "ignoring text frame");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "socket error");
                    break;
                }
            }
        }

        conn.close().await;
        self.connections.remove(&conn.id());
        tracing::info!("connection closed");
    }

    async fn dispatch(&self, conn: &Arc<Connection<S>>, bytes: &[u8]) {
        let frame = match frame::decode_input(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(len = bytes.len(), error = %e, "dropping malformed frame");
                return;
            }
        };

        let Some(service) = self.protocol.registry().lookup_by_id(frame.service_id).cloned() else {
            tracing::warn!(service_id = frame.service_id.0, "dropping frame for unknown service");
            return;
        };

        if self.options.log_frames {
            tracing::debug!(
                service = %service.name,
                seq = ?frame.sequence,
                len = bytes.len(),
                "recv frame"
            );
        }

        if service.is_api() {
            let Some(sequence) = frame.sequence else {
                tracing::warn!(service = %service.name, "dropping API frame without sequence");
                return;
            };

            match self.protocol.decode_request(&service, frame.payload) {
                Ok(request) => {
                    let call = Arc::new(ApiCall::new(conn.clone(), service, sequence, request));
                    self.run_api(call).await;
                }
                Err(e) => {
                    tracing::warn!(service = %service.name, seq = sequence, error = %e, "invalid request body");
                    let call = ApiCall::new(conn.clone(), service, sequence, Value::Null);
                    let error = ApiError::with_info(e.to_string(), INVALID_REQUEST);
                    send_or_log(conn.send_error(&call, &error).await);
                }
            }
        } else {
            match self.protocol.decode_message(&service, frame.payload) {
                Ok(message) => {
                    let call = Arc::new(MsgCall::new(conn.clone(), service, message));
                    self.run_msg(call).await;
                }
                Err(e) => {
                    tracing::warn!(service = %service.name, error = %e, "dropping message with invalid body");
                }
            }
        }
    }

    async fn run_api(&self, call: Arc<ApiCall<S>>) {
        match self.api_flow.run(call.clone()).await {
            Ok(Decision::Continue) => {}
            Ok(Decision::Stop) => return,
            Err(e) => {
                self.respond_with_error(&call, e).await;
                return;
            }
        }

        let Some(handler) = self.apis.get(call.name()) else {
            if !call.response_sent() {
                tracing::warn!(service = %call.name(), "no handler implemented");
                let error = ApiError::with_info(format!("Unhandled API: {}", call.name()), UNHANDLED_API);
                send_or_log(call.connection().send_error(&call, &error).await);
            }
            return;
        };

        if let Err(e) = guard(handler(call.clone())).await {
            self.respond_with_error(&call, e).await;
        } else if !call.response_sent() {
            tracing::warn!(service = %call.name(), seq = call.sequence(), "handler returned without responding");
        }
    }

    async fn respond_with_error(&self, call: &ApiCall<S>, e: HandlerError) {
        let error = e.into_api_error(call.name());
        send_or_log(call.connection().send_error(call, &error).await);
    }

    async fn run_msg(&self, call: Arc<MsgCall<S>>) {
        match self.msg_flow.run(call.clone()).await {
            Ok(Decision::Continue) => {}
            Ok(Decision::Stop) => return,
            Err(e) => {
                tracing::warn!(service = %call.name(), error = %e, "message flow failed");
                return;
            }
        }

        let listeners = self.listeners.snapshot(call.name());
        if listeners.is_empty() {
            tracing::debug!(service = %call.name(), "unhandled message");
            return;
        }
        for listener in listeners {
            if let Err(e) = guard(listener(call.clone())).await {
                tracing::error!(service = %call.name(), error = %e, "message listener failed");
            }
        }
    }
}

fn send_or_log(result: connection::Result<()>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to send response");
    }
}
