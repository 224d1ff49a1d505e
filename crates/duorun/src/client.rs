//! # Client
//!
//! Issues API calls and one-way messages over a single socket, and correlates
//! responses back to their callers by sequence number.
//!
//! ## Philosophy
//!
//! - **One pump per socket**: A background task reads every inbound frame. It
//!   settles pending calls and hands pushed messages to a listener task, so
//!   it never waits on application code; callers never read.
//! - **Settle exactly once**: A pending call is settled by whichever comes first
//!   of its response, its timeout, or the socket closing. The others find the
//!   entry gone and do nothing.
//! - **Fail fast**: Calls made while not `Open` fail immediately with a network
//!   error instead of queueing.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use duorpc::ApiError;
use duorpc::OutputFrame;
use duorpc::Protocol;
use duorpc::ServiceDefinition;
use duorpc::Value;
use duorpc::frame;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::error::CallError;
use crate::error::HandlerError;
use crate::error::guard;
use crate::handlers;
use crate::handlers::ListenerId;
use crate::handlers::Listeners;
use crate::transport::Connector;
use crate::transport::Inbound;
use crate::transport::Socket;

/// Largest sequence number handed out before wrapping back to 1. Peers that
/// store sequences as IEEE-754 doubles can represent every value up to here.
pub const MAX_SEQUENCE: u64 = (1 << 53) - 1;

/// Hands out call sequence numbers: 1, 2, ..., `MAX_SEQUENCE`, 1, ...
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the counter at `first`, clamped into `1..=MAX_SEQUENCE`.
    pub fn starting_at(first: u64) -> Self {
        Self { next: AtomicU64::new(first.clamp(1, MAX_SEQUENCE)) }
    }

    pub fn next(&self) -> u64 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current >= MAX_SEQUENCE { 1 } else { current + 1 };
            match self.next.compare_exchange_weak(current, following, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Like `next`, but skips values for which `in_use` returns true.
    pub fn next_free(&self, in_use: impl Fn(u64) -> bool) -> u64 {
        loop {
            let seq = self.next();
            if !in_use(seq) {
                return seq;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// Default timeout for `call_api`. `None` waits until the response arrives
    /// or the connection closes.
    pub timeout: Option<Duration>,
    /// Log every frame sent and received at `debug` level.
    pub log_frames: bool,
}

impl ClientOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn log_frames(mut self, enabled: bool) -> Self {
        self.log_frames = enabled;
        self
    }
}

struct PendingRequest {
    service: Arc<ServiceDefinition>,
    tx: oneshot::Sender<Result<Value, CallError>>,
}

/// Removes a pending entry if the waiting caller goes away first.
struct PendingSlot<'a> {
    pending: &'a DashMap<u64, PendingRequest>,
    seq: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.seq);
    }
}

/// A decoded pushed message on its way to the listener task.
struct Delivery {
    service: Arc<ServiceDefinition>,
    message: Value,
}

struct ClientInner {
    protocol: Protocol,
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    status: watch::Sender<ClientStatus>,
    socket: Mutex<Option<Arc<dyn Socket>>>,
    /// Bumped on every connect so a stale pump cannot tear down a newer socket.
    epoch: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
    sequence: SequenceCounter,
    listeners: Mutex<Listeners<Value>>,
    late_responses: AtomicU64,
}

/// A client bound to one protocol and one destination. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(protocol: Protocol, connector: impl Connector, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                protocol,
                connector: Arc::new(connector),
                options,
                status: watch::Sender::new(ClientStatus::Closed),
                socket: Mutex::new(None),
                epoch: AtomicU64::new(0),
                pending: DashMap::new(),
                sequence: SequenceCounter::new(),
                listeners: Mutex::new(Listeners::default()),
                late_responses: AtomicU64::new(0),
            }),
        }
    }

    pub fn status(&self) -> ClientStatus {
        *self.inner.status.borrow()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.inner.status.subscribe()
    }

    /// Responses that arrived for a sequence no longer pending, typically
    /// after the call timed out.
    pub fn late_responses(&self) -> u64 {
        self.inner.late_responses.load(Ordering::Relaxed)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Opens the connection: `Closed -> Connecting -> Open`, or back to
    /// `Closed` on failure. A no-op while already connecting or open.
    pub async fn connect(&self) -> Result<(), CallError> {
        let started = self.inner.status.send_if_modified(|status| {
            if *status == ClientStatus::Closed {
                *status = ClientStatus::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            tracing::warn!(status = ?self.status(), "connect called while not closed");
            return Ok(());
        }

        let socket = match self.inner.connector.connect().await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                self.inner.status.send_replace(ClientStatus::Closed);
                return Err(CallError::Network(e.to_string()));
            }
        };

        let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        *lock(&self.inner.socket) = Some(socket.clone());

        let opened = self.inner.status.send_if_modified(|status| {
            if *status == ClientStatus::Connecting {
                *status = ClientStatus::Open;
                true
            } else {
                false
            }
        });
        if !opened {
            // disconnect() ran while the connector was still dialing.
            lock(&self.inner.socket).take();
            socket.close().await;
            return Err(CallError::Network("disconnected while connecting".into()));
        }

        tracing::info!(epoch, "client connected");
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.pump(socket, epoch).await });
        Ok(())
    }

    /// Closes the connection and fails every pending call with a network error.
    pub async fn disconnect(&self) {
        self.inner.status.send_replace(ClientStatus::Closed);
        let socket = lock(&self.inner.socket).take();
        if let Some(socket) = socket {
            socket.close().await;
        }
        self.inner.fail_all_pending("disconnected");
        tracing::info!("client disconnected");
    }

    /// Calls an API with the default timeout from `ClientOptions`.
    pub async fn call_api(&self, name: &str, request: impl Into<Value>) -> Result<Value, CallError> {
        self.call_api_with_timeout(name, request, self.inner.options.timeout).await
    }

    /// Calls an API, giving up after `timeout` if one is given.
    pub async fn call_api_with_timeout(
        &self,
        name: &str,
        request: impl Into<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let socket = self.open_socket()?;
        let inner = &self.inner;

        let service = inner
            .protocol
            .registry()
            .lookup_api_by_name(name)
            .cloned()
            .ok_or_else(|| CallError::Config(format!("unknown API '{}'", name)))?;
        let payload = inner
            .protocol
            .encode_request(&service, &request.into())
            .map_err(|e| CallError::InvalidRequest(e.to_string()))?;

        let seq = inner.sequence.next_free(|s| inner.pending.contains_key(&s));
        let bytes = frame::encode_input(service.id, &payload, Some(seq))
            .map_err(|e| CallError::InvalidRequest(e.to_string()))?;

        // Registered before sending so the pump cannot see the response first.
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(seq, PendingRequest { service: service.clone(), tx });
        let _slot = PendingSlot { pending: &inner.pending, seq };

        if inner.options.log_frames {
            tracing::debug!(service = %name, seq, len = bytes.len(), "send request");
        }
        socket.send(&bytes).await.map_err(|e| CallError::Network(e.to_string()))?;

        let settled = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    tracing::debug!(service = %name, seq, "call timed out");
                    return Err(CallError::Timeout);
                }
            },
            None => rx.await,
        };
        settled.unwrap_or_else(|_| Err(CallError::Network("connection closed".into())))
    }

    /// Sends a one-way message to the server.
    pub async fn send_message(&self, name: &str, message: impl Into<Value>) -> Result<(), CallError> {
        let socket = self.open_socket()?;
        let service = self
            .inner
            .protocol
            .registry()
            .lookup_message_by_name(name)
            .cloned()
            .ok_or_else(|| CallError::Config(format!("unknown message '{}'", name)))?;
        let payload = self
            .inner
            .protocol
            .encode_message(&service, &message.into())
            .map_err(|e| CallError::InvalidRequest(e.to_string()))?;
        let bytes =
            frame::encode_input(service.id, &payload, None).map_err(|e| CallError::InvalidRequest(e.to_string()))?;

        if self.inner.options.log_frames {
            tracing::debug!(service = %name, len = bytes.len(), "send message");
        }
        socket.send(&bytes).await.map_err(|e| CallError::Network(e.to_string()))
    }

    /// Adds a listener for a server-pushed message.
    pub fn listen_message<F, Fut>(&self, name: &str, f: F) -> Result<ListenerId, CallError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        if self.inner.protocol.registry().lookup_message_by_name(name).is_none() {
            return Err(CallError::Config(format!("unknown message '{}'", name)));
        }
        Ok(lock(&self.inner.listeners).listen(name, handlers::handler(f)))
    }

    /// Removes one listener, or every listener for `name` when `id` is `None`.
    pub fn unlisten_message(&self, name: &str, id: Option<ListenerId>) -> usize {
        lock(&self.inner.listeners).unlisten(name, id)
    }

    fn open_socket(&self) -> Result<Arc<dyn Socket>, CallError> {
        if self.status() != ClientStatus::Open {
            return Err(CallError::Network(format!("client is {:?}", self.status())));
        }
        lock(&self.inner.socket)
            .clone()
            .ok_or_else(|| CallError::Network("client is not connected".into()))
    }
}

impl ClientInner {
    async fn pump(self: Arc<Self>, socket: Arc<dyn Socket>, epoch: u64) {
        // Listeners run on their own task so one that awaits a call on this
        // client does not stop the pump from reading that call's response.
        let (deliveries, queue) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().run_listeners(queue));

        loop {
            match socket.recv().await {
                Ok(Some(Inbound::Binary(bytes))) => self.handle_frame(&bytes, &deliveries),
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
        socket.close().await;

        if self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        let was_current = {
            let mut current = lock(&self.socket);
            let matches = current.as_ref().is_some_and(|s| Arc::ptr_eq(s, &socket));
            if matches {
                current.take();
            }
            matches
        };
        // A local disconnect already failed whatever was pending.
        if was_current {
            self.status.send_replace(ClientStatus::Closed);
            tracing::info!("connection closed by peer");
            self.fail_all_pending("connection closed");
        }
    }

    fn handle_frame(&self, bytes: &[u8], deliveries: &mpsc::UnboundedSender<Delivery>) {
        let frame = match frame::decode_output(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(len = bytes.len(), error = %e, "dropping malformed frame");
                return;
            }
        };
        if self.options.log_frames {
            tracing::debug!(service_id = frame.service_id.0, seq = ?frame.sequence, len = bytes.len(), "recv frame");
        }

        match (frame.sequence, frame.succeeded) {
            (Some(seq), _) => self.settle(seq, &frame),
            (None, None) => self.decode_message(&frame, deliveries),
            (None, Some(_)) => {
                tracing::warn!(service_id = frame.service_id.0, "dropping status flag without sequence");
            }
        }
    }

    fn settle(&self, seq: u64, frame: &OutputFrame<'_>) {
        let Some((_, pending)) = self.pending.remove_if(&seq, |_, p| p.service.id == frame.service_id) else {
            if self.pending.contains_key(&seq) {
                tracing::warn!(seq, service_id = frame.service_id.0, "response service does not match request, dropping");
            } else {
                self.late_responses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(seq, service_id = frame.service_id.0, "response for unknown sequence, dropping");
            }
            return;
        };

        let result = match frame.succeeded {
            Some(true) => self
                .protocol
                .decode_response(&pending.service, frame.payload)
                .map_err(|e| CallError::InvalidResponse(e.to_string())),
            Some(false) => match ApiError::decode(frame.payload) {
                Ok(error) => Err(CallError::Remote(error)),
                Err(e) => Err(CallError::InvalidResponse(e.to_string())),
            },
            None => Err(CallError::InvalidResponse("response frame has no status".into())),
        };
        // The caller may have stopped waiting.
        let _ = pending.tx.send(result);
    }

    fn decode_message(&self, frame: &OutputFrame<'_>, deliveries: &mpsc::UnboundedSender<Delivery>) {
        let Some(service) = self.protocol.registry().lookup_by_id(frame.service_id) else {
            tracing::warn!(service_id = frame.service_id.0, "dropping message for unknown service");
            return;
        };
        let message = match self.protocol.decode_message(service, frame.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(service = %service.name, error = %e, "dropping message with invalid body");
                return;
            }
        };

        // The listener task only goes away with the pump that feeds it.
        let _ = deliveries.send(Delivery { service: service.clone(), message });
    }

    /// Runs listeners for pushed messages, one message at a time in arrival
    /// order, until the pump that owns `queue` stops.
    async fn run_listeners(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(Delivery { service, message }) = queue.recv().await {
            let listeners = lock(&self.listeners).snapshot(&service.name);
            if listeners.is_empty() {
                tracing::debug!(service = %service.name, "unhandled message");
                continue;
            }
            for listener in listeners {
                if let Err(e) = guard(listener(message.clone())).await {
                    tracing::error!(service = %service.name, error = %e, "message listener failed");
                }
            }
        }
    }

    fn fail_all_pending(&self, reason: &str) {
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending.tx.send(Err(CallError::Network(reason.to_string())));
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
