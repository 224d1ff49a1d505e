//! # Service Catalog
//!
//! Static description of every operation a peer can address. Names are for
//! humans and handler registration; only the numeric `ServiceId` goes on the wire.

use crate::schema::TypeCatalog;
use crate::schema::TypeSchema;

/// Stable numeric identifier of a service.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceId(pub u32);

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "svc-{}", self.0)
    }
}

/// Whether a service is a request/response API or a one-way message, with the
/// schema names of its bodies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    Api { request: String, response: String },
    Message { message: String },
}

/// One addressable operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub id: ServiceId,
    pub name: String,
    pub kind: ServiceKind,
}

impl ServiceDefinition {
    pub fn api(id: u32, name: impl Into<String>, request: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            id: ServiceId(id),
            name: name.into(),
            kind: ServiceKind::Api { request: request.into(), response: response.into() },
        }
    }

    pub fn message(id: u32, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: ServiceId(id),
            name: name.into(),
            kind: ServiceKind::Message { message: message.into() },
        }
    }

    pub fn is_api(&self) -> bool {
        matches!(self.kind, ServiceKind::Api { .. })
    }

    pub fn request_type(&self) -> Option<&str> {
        match &self.kind {
            ServiceKind::Api { request, .. } => Some(request),
            ServiceKind::Message { .. } => None,
        }
    }

    pub fn response_type(&self) -> Option<&str> {
        match &self.kind {
            ServiceKind::Api { response, .. } => Some(response),
            ServiceKind::Message { .. } => None,
        }
    }

    pub fn message_type(&self) -> Option<&str> {
        match &self.kind {
            ServiceKind::Message { message } => Some(message),
            ServiceKind::Api { .. } => None,
        }
    }

    /// Every schema name this service references.
    pub fn type_names(&self) -> Vec<&str> {
        match &self.kind {
            ServiceKind::Api { request, response } => vec![request.as_str(), response.as_str()],
            ServiceKind::Message { message } => vec![message.as_str()],
        }
    }

    /// `"api"` or `"msg"`, for logs.
    pub fn kind_label(&self) -> &'static str {
        if self.is_api() { "api" } else { "msg" }
    }
}

/// Ordered service list plus the schema catalog its bodies are described in.
///
/// Loaded once at startup and never mutated by the runtime.
#[derive(Clone, Debug, Default)]
pub struct ServiceCatalog {
    pub services: Vec<ServiceDefinition>,
    pub types: TypeCatalog,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: ServiceDefinition) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_api(self, id: u32, name: &str, request: &str, response: &str) -> Self {
        self.with_service(ServiceDefinition::api(id, name, request, response))
    }

    pub fn with_message(self, id: u32, name: &str, message: &str) -> Self {
        self.with_service(ServiceDefinition::message(id, name, message))
    }

    pub fn with_type(mut self, name: &str, schema: TypeSchema) -> Self {
        self.types.insert(name, schema);
        self
    }
}
