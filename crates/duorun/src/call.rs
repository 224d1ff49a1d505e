//! Calls handed to flows, handlers and listeners.
//!
//! Both are created by the dispatch pipeline and passed around as `Arc`s, so an
//! API handler may hold on to its call past the point it returns.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use duorpc::ServiceDefinition;
use duorpc::Value;

use crate::connection;
use crate::connection::Connection;

/// An inbound request awaiting exactly one response.
pub struct ApiCall<S> {
    conn: Arc<Connection<S>>,
    service: Arc<ServiceDefinition>,
    sequence: u64,
    request: Value,
    response_sent: AtomicBool,
}

impl<S> std::fmt::Debug for ApiCall<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCall")
            .field("service", &self.service.name)
            .field("sequence", &self.sequence)
            .field("response_sent", &self.response_sent.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<S: Send + Sync + 'static> ApiCall<S> {
    pub(crate) fn new(
        conn: Arc<Connection<S>>,
        service: Arc<ServiceDefinition>,
        sequence: u64,
        request: Value,
    ) -> Self {
        Self { conn, service, sequence, request, response_sent: AtomicBool::new(false) }
    }

    pub fn connection(&self) -> &Arc<Connection<S>> {
        &self.conn
    }

    pub fn session(&self) -> &S {
        self.conn.session()
    }

    pub fn service(&self) -> &ServiceDefinition {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn request(&self) -> &Value {
        &self.request
    }

    pub fn response_sent(&self) -> bool {
        self.response_sent.load(Ordering::Acquire)
    }

    /// Marks the response as sent. Returns `false` if it already was.
    pub(crate) fn claim_response(&self) -> bool {
        self.response_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Responds with `value`, encoded with the service's response schema.
    pub async fn succeed(&self, value: impl Into<Value>) -> connection::Result<()> {
        self.conn.send_api_success(self, &value.into()).await
    }

    /// Responds with `ApiError { message, info }`.
    pub async fn error(&self, message: impl Into<String>, info: Option<Value>) -> connection::Result<()> {
        self.conn.send_api_error(self, message, info).await
    }
}

/// An inbound one-way message.
pub struct MsgCall<S> {
    conn: Arc<Connection<S>>,
    service: Arc<ServiceDefinition>,
    message: Value,
}

impl<S> std::fmt::Debug for MsgCall<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgCall").field("service", &self.service.name).finish_non_exhaustive()
    }
}

impl<S: Send + Sync + 'static> MsgCall<S> {
    pub(crate) fn new(conn: Arc<Connection<S>>, service: Arc<ServiceDefinition>, message: Value) -> Self {
        Self { conn, service, message }
    }

    pub fn connection(&self) -> &Arc<Connection<S>> {
        &self.conn
    }

    pub fn session(&self) -> &S {
        self.conn.session()
    }

    pub fn service(&self) -> &ServiceDefinition {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    pub fn message(&self) -> &Value {
        &self.message
    }
}
