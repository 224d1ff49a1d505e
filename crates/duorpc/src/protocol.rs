//! # Protocol
//!
//! A service registry paired with the body codec its payloads are written in.
//! Both peers of a connection hold the same `Protocol`; it is immutable and
//! shared behind an `Arc`.

use std::sync::Arc;

use crate::catalog::ServiceCatalog;
use crate::catalog::ServiceDefinition;
use crate::codec::BodyCodec;
use crate::codec::CodecError;
use crate::codec::SchemaCodec;
use crate::registry;
use crate::registry::ServiceRegistry;
use crate::value::Value;

/// Protocol construction and body translation errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Registry(registry::Error),
    Codec(CodecError),
    /// The service is not of the kind the operation requires.
    WrongKind { service: String, expected: &'static str },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry(e) => write!(f, "registry: {}", e),
            Self::Codec(e) => write!(f, "codec: {}", e),
            Self::WrongKind { service, expected } => {
                write!(f, "service '{}' is not of kind '{}'", service, expected)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<registry::Error> for Error {
    fn from(e: registry::Error) -> Self {
        Self::Registry(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub struct Protocol {
    registry: Arc<ServiceRegistry>,
    codec: Arc<dyn BodyCodec>,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol").field("services", &self.registry.len()).finish_non_exhaustive()
    }
}

impl Protocol {
    /// Builds the registry and a `SchemaCodec` over the catalog's types,
    /// checking that every schema a service names exists.
    pub fn new(catalog: &ServiceCatalog) -> Result<Self> {
        let registry = ServiceRegistry::from_catalog(catalog)?;
        registry.validate_types(&catalog.types)?;
        let codec = SchemaCodec::new(catalog.types.clone())?;
        Ok(Self { registry: Arc::new(registry), codec: Arc::new(codec) })
    }

    /// Builds the registry and uses `codec` for bodies. Schema names are not
    /// checked; the codec reports unknown names when it is asked for them.
    pub fn with_codec(catalog: &ServiceCatalog, codec: Arc<dyn BodyCodec>) -> Result<Self> {
        let registry = ServiceRegistry::from_catalog(catalog)?;
        Ok(Self { registry: Arc::new(registry), codec })
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn codec(&self) -> &dyn BodyCodec {
        self.codec.as_ref()
    }

    pub fn encode_request(&self, service: &ServiceDefinition, value: &Value) -> Result<Vec<u8>> {
        let ty = service.request_type().ok_or_else(|| wrong_kind(service, "api"))?;
        Ok(self.codec.encode(value, ty)?)
    }

    pub fn decode_request(&self, service: &ServiceDefinition, bytes: &[u8]) -> Result<Value> {
        let ty = service.request_type().ok_or_else(|| wrong_kind(service, "api"))?;
        Ok(self.codec.decode(bytes, ty)?)
    }

    pub fn encode_response(&self, service: &ServiceDefinition, value: &Value) -> Result<Vec<u8>> {
        let ty = service.response_type().ok_or_else(|| wrong_kind(service, "api"))?;
        Ok(self.codec.encode(value, ty)?)
    }

    pub fn decode_response(&self, service: &ServiceDefinition, bytes: &[u8]) -> Result<Value> {
        let ty = service.response_type().ok_or_else(|| wrong_kind(service, "api"))?;
        Ok(self.codec.decode(bytes, ty)?)
    }

    pub fn encode_message(&self, service: &ServiceDefinition, value: &Value) -> Result<Vec<u8>> {
        let ty = service.message_type().ok_or_else(|| wrong_kind(service, "message"))?;
        Ok(self.codec.encode(value, ty)?)
    }

    pub fn decode_message(&self, service: &ServiceDefinition, bytes: &[u8]) -> Result<Value> {
        let ty = service.message_type().ok_or_else(|| wrong_kind(service, "message"))?;
        Ok(self.codec.decode(bytes, ty)?)
    }
}

fn wrong_kind(service: &ServiceDefinition, expected: &'static str) -> Error {
    Error::WrongKind { service: service.name.clone(), expected }
}
