//! JSON-RPC over Unix domain sockets
//!
//! A lightweight RPC runtime for processes on a single host. A [`Server`]
//! exposes named methods backed by user-supplied handlers; [`Client`]s
//! invoke those methods with `serde_json` values and receive owned results.
//! The transport is an `AF_UNIX`/`SOCK_STREAM` socket carrying unframed
//! UTF-8 JSON: one request object `{"method": ..., "params": ...}` and one
//! response value per round-trip.
//!
//! The server runs an accept thread plus a fixed pool of workers, each
//! driving its own epoll readiness set over the connections assigned to it
//! in round-robin order. A client serializes its round-trips on an internal
//! mutex and offers a fire-and-forget asynchronous variant on top of the
//! synchronous call.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use urpc::{Client, Server};
//!
//! let mut server = Server::new("/tmp/demo.sock")?;
//! server.register("echo", |params| Some(params));
//! server.start()?;
//!
//! let client = Arc::new(Client::connect("/tmp/demo.sock")?);
//! assert_eq!(
//!     client.call("echo", json!({"message": "hello"})),
//!     Some(json!({"message": "hello"})),
//! );
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! There is no authentication, discovery, retry or schema validation; the
//! socket file's permissions are the only access control.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::client::AsyncCallback;
pub use crate::client::Client;
pub use crate::registry::Handler;
pub use crate::registry::MAX_METHODS;
pub use crate::server::BUFFER_SIZE;
pub use crate::server::DEFAULT_WORKERS;
pub use crate::server::Server;
pub use crate::server::ServerConfig;

mod client;
mod io_ops;
mod registry;
mod server;
mod wire;
mod worker;
