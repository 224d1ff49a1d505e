//! # Error Mapper
//!
//! Application code reports failures as a `HandlerError`. Only business errors
//! reach the peer verbatim; everything else is logged here and replaced with a
//! generic message so internals never leak over the wire.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use duorpc::ApiError;
use duorpc::error::INTERNAL_ERR;
use duorpc::error::INVALID_REQUEST;
use duorpc::error::INVALID_RESPONSE;
use duorpc::error::NETWORK_ERROR;
use duorpc::error::TIMEOUT;
use futures::FutureExt;

use crate::connection;

/// Message sent in place of any internal failure.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// A failure raised by a flow item, API handler or message listener.
#[derive(Debug)]
pub enum HandlerError {
    /// Deliberate, client-visible error. Sent verbatim.
    Business(ApiError),
    /// Anything else. Logged, then sent as a generic internal error.
    Internal(anyhow::Error),
}

impl HandlerError {
    pub fn business(message: impl Into<String>) -> Self {
        Self::Business(ApiError::new(message))
    }

    pub fn internal(e: impl Into<anyhow::Error>) -> Self {
        Self::Internal(e.into())
    }

    /// Converts the error into the body sent to the peer, logging internal
    /// failures with their full cause chain.
    pub fn into_api_error(self, service: &str) -> ApiError {
        match self {
            Self::Business(e) => e,
            Self::Internal(e) => {
                tracing::error!(service, error = ?e, "internal error while handling call");
                ApiError::with_info(INTERNAL_ERROR_MESSAGE, INTERNAL_ERR)
            }
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Business(e) => write!(f, "business error: {}", e),
            Self::Internal(e) => write!(f, "internal error: {:#}", e),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<ApiError> for HandlerError {
    fn from(e: ApiError) -> Self {
        Self::Business(e)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl From<connection::Error> for HandlerError {
    fn from(e: connection::Error) -> Self {
        Self::Internal(e.into())
    }
}

/// Runs application code, turning a panic into an internal error.
pub(crate) async fn guard<F, T>(fut: F) -> Result<T, HandlerError>
where
    F: Future<Output = Result<T, HandlerError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Internal(anyhow::anyhow!("panic: {}", panic_message(&*panic)))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Why a client call or send failed.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// Not connected, or the connection dropped before a response arrived.
    Network(String),
    /// The name is not in the service catalog, or is of the wrong kind.
    Config(String),
    /// The request body did not encode against its schema.
    InvalidRequest(String),
    /// The response body did not decode against its schema.
    InvalidResponse(String),
    /// No response within the call's timeout.
    Timeout,
    /// The server answered with an error body.
    Remote(ApiError),
}

impl CallError {
    /// The error as the `ApiError` shape, for callers that surface every failure
    /// the same way.
    pub fn to_api_error(&self) -> ApiError {
        match self {
            Self::Network(msg) => ApiError::with_info(msg.clone(), NETWORK_ERROR),
            Self::Config(msg) | Self::InvalidRequest(msg) => ApiError::with_info(msg.clone(), INVALID_REQUEST),
            Self::InvalidResponse(msg) => ApiError::with_info(msg.clone(), INVALID_RESPONSE),
            Self::Timeout => ApiError::with_info("Request timeout", TIMEOUT),
            Self::Remote(e) => e.clone(),
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::InvalidRequest(msg) => write!(f, "invalid request: {}", msg),
            Self::InvalidResponse(msg) => write!(f, "invalid response: {}", msg),
            Self::Timeout => write!(f, "request timed out"),
            Self::Remote(e) => write!(f, "remote error: {}", e),
        }
    }
}

impl std::error::Error for CallError {}
