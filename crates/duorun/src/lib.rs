//! # duorun
//!
//! Async runtime for `duorpc` services: a server that dispatches inbound calls
//! through flows to handlers, and a client that correlates responses to calls.
//!
//! ## Architecture
//!
//! - `transport`: the `Socket` / `Acceptor` / `Connector` seam, with in-memory
//!   (`memory`) and length-prefixed stream (`stream`) implementations.
//! - `connection` / `call`: one accepted socket, and the calls it carries.
//! - `flow` / `handlers`: middleware chains and handler tables.
//! - `server`: accepts sockets and runs the dispatch pipeline.
//! - `client`: the pending-call table and the inbound frame pump.
//! - `error`: maps handler failures to what the peer sees.

pub mod call;
pub mod client;
pub mod connection;
pub mod error;
pub mod flow;
pub mod handlers;
pub mod logging;
pub mod memory;
pub mod server;
pub mod stream;
pub mod transport;


pub use call::ApiCall;
pub use call::MsgCall;
pub use client::Client;
pub use client::ClientOptions;
pub use client::ClientStatus;
pub use connection::ConnId;
pub use connection::Connection;
pub use error::CallError;
pub use error::HandlerError;
pub use flow::Decision;
pub use flow::Flow;
pub use flow::FlowChain;
pub use handlers::ListenerId;
pub use memory::MemorySocket;
pub use server::Server;
pub use server::ServerBuilder;
pub use server::ServerOptions;
pub use stream::StreamOptions;
pub use stream::StreamSocket;
pub use transport::Inbound;
pub use transport::PeerInfo;
pub use transport::Socket;
