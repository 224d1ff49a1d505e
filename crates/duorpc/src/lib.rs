//! # duorpc
//!
//! The protocol half of a duplex RPC runtime: what services exist, how their
//! bodies are written, and the envelope every body travels in.
//!
//! ## Architecture
//!
//! - `catalog` / `registry`: services by numeric ID and by name.
//! - `schema` / `codec`: named type descriptions and the `BodyCodec` seam, with
//!   `SchemaCodec` as the default implementation over `duopack`.
//! - `frame`: the fixed envelope `[serviceId, payload, sequence?, succeeded?]`.
//! - `error`: the `ApiError` body sent for failed API calls.
//! - `protocol`: the registry and codec bundled for the runtime.
//!
//! Nothing here performs I/O. The runtime lives in `duorun`.

pub mod catalog;
pub mod codec;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod value;


pub use catalog::ServiceCatalog;
pub use catalog::ServiceDefinition;
pub use catalog::ServiceId;
pub use catalog::ServiceKind;
pub use codec::BodyCodec;
pub use codec::CodecError;
pub use codec::CodecErrorKind;
pub use codec::SchemaCodec;
pub use error::ApiError;
pub use frame::Direction;
pub use frame::Frame;
pub use frame::InputFrame;
pub use frame::OutputFrame;
pub use protocol::Protocol;
pub use registry::ServiceRegistry;
pub use schema::Property;
pub use schema::Scalar;
pub use schema::TypeCatalog;
pub use schema::TypeSchema;
pub use value::Value;
