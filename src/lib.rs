//! Shared typed variables and remote triggers over ZeroMQ.
//!
//! A host process exposes named, typed **variables** and named
//! **triggers** through a [`Server`]; peer processes read, write, and
//! invoke them through a [`Client`]. Server-initiated changes are
//! published so every subscribed peer can keep a live local view.
//!
//! # Architecture
//!
//! ```text
//!   host process                         peer process
//!   ┌───────────────────────┐            ┌──────────────────────┐
//!   │ Server                │  ROUTER ◄──┼─ DEALER   Client     │
//!   │  dispatcher thread ───┼── PUB   ──►┼─ SUB                 │
//!   │  worker pool (N)      │            │  reactor thread      │
//!   └───────────────────────┘            └──────────────────────┘
//! ```
//!
//! - The server's dispatcher decodes each command and hands it to the
//!   worker pool; user callbacks never block dispatch. Responses may
//!   return out of order and are correlated by `command_id`.
//! - The client's reactor correlates responses to sync waiters and async
//!   continuations, suppresses duplicate publications, and reconnects
//!   with bounded exponential backoff, failing in-flight requests.
//! - A variable's type is pinned at registration: writes with a
//!   different value case are rejected, and equal writes are no-ops that
//!   neither publish nor fire callbacks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::{Server, ServerConfig, Client, ConnectionOptions, Variable};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new(ServerConfig::new(
//!     "tcp://127.0.0.1:5555",
//!     "tcp://127.0.0.1:5556",
//! ));
//! server.register_variable(
//!     Variable::new("exposure", 100.0),
//!     Some(Arc::new(|value| println!("peer set exposure to {value}"))),
//! );
//! server.start()?;
//!
//! let client = Client::new("tcp://127.0.0.1:5555", "tcp://127.0.0.1:5556");
//! client.open(tether::DEFAULT_REQUEST_TIMEOUT)?;
//! client.set_variable("exposure", 250.0, ConnectionOptions::Sync, None)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod pool;
pub mod server;
pub mod wire;

pub(crate) mod net;
mod trace;

pub use trace::init_tracing;

pub use client::{Client, ClientError, DEFAULT_REQUEST_TIMEOUT, ResponseCallback};
pub use pool::{PoolError, TaskHandle, WorkerPool};
pub use server::{Server, ServerConfig, ServerError};
pub use wire::message::{
    CommandKind, CommandMessage, ResponseMessage, TriggerMessage, VariableMessage,
};
pub use wire::value::{
    ConnectionOptions, TriggerCallback, Value, ValueKind, Variable, VariableChangedCallback,
};
