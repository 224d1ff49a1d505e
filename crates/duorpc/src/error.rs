//! # ApiError
//!
//! The body of every failed API response. It has a fixed schema independent of
//! the service catalog so a peer can always read it.

use std::sync::LazyLock;

use crate::codec;
use crate::codec::CodecError;
use crate::schema::Property;
use crate::schema::TypeCatalog;
use crate::schema::TypeSchema;
use crate::value::Value;

/// Any exception thrown from server code that is not an `ApiError`.
pub const INTERNAL_ERR: &str = "INTERNAL_ERR";
/// The request body did not decode against the request schema.
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
/// No handler implemented the API and no flow responded.
pub const UNHANDLED_API: &str = "UNHANDLED_API";
/// The connection is not open, or closed while the call was pending.
pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
/// The response body did not decode against the response schema.
pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";
/// The caller gave up waiting.
pub const TIMEOUT: &str = "TIMEOUT";

static SCHEMA: LazyLock<TypeSchema> = LazyLock::new(|| {
    TypeSchema::interface([
        Property::required("message", TypeSchema::String),
        Property::optional("info", TypeSchema::Any),
    ])
});

static NO_TYPES: LazyLock<TypeCatalog> = LazyLock::new(TypeCatalog::new);

/// An application-level error carried back to the caller verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub message: String,
    pub info: Option<Value>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), info: None }
    }

    pub fn with_info(message: impl Into<String>, info: impl Into<Value>) -> Self {
        Self { message: message.into(), info: Some(info.into()) }
    }

    /// `info` when it is a string, which is how the runtime's own codes are sent.
    pub fn info_code(&self) -> Option<&str> {
        self.info.as_ref().and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        let mut fields = vec![("message", Value::from(self.message.as_str()))];
        if let Some(info) = &self.info {
            fields.push(("info", info.clone()));
        }
        Value::object(fields)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode_with_schema(&self.to_value(), &SCHEMA, &NO_TYPES)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let value = codec::decode_with_schema(bytes, &SCHEMA, &NO_TYPES)?;
        let message = value.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        let info = value.get("info").filter(|v| !v.is_null()).cloned();
        Ok(Self { message, info })
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.info_code() {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ApiError {}
