//! Portside: a completion-port TCP server engine.
//!
//! # Overview
//!
//! Portside is the core of a TCP server framework built on a proactor-style
//! completion model: operations are launched, ownership of their state is
//! loaned to the engine, and a small pool of worker threads drains
//! completion notifications and routes each one to the component that
//! issued it. The engine multiplexes many concurrent connections without a
//! userspace task scheduler — parallel OS threads sit on a completion
//! queue, nothing more.
//!
//! # Core Guarantees
//!
//! - **Loaned contexts**: an [`ops::OperationContext`] submitted to the
//!   engine is returned, at the same address, in exactly one completion —
//!   never freed, reused, or moved while in flight, including across
//!   cancellation.
//! - **One receive in flight per session**: the next receive is issued only
//!   from the previous receive's completion handler, so per-session buffers
//!   need no locks.
//! - **FIFO sends**: per-session send order is preserved under concurrent
//!   senders via a per-session queue with one send in flight.
//! - **Orderly shutdown**: stop acceptor → drain aborts → post shutdown
//!   packets → join workers → close the port.
//!
//! # Module Structure
//!
//! - [`ops`]: operation contexts, completion records, reserved keys
//! - [`port`]: the completion core ([`port::CompletionPort`],
//!   [`port::PortHandle`], [`port::Handle`])
//! - [`worker`]: the worker pool draining the port
//! - [`acceptor`]: the accept loop and its cancel-by-close state machine
//! - [`session`]: per-connection sessions, the registry, pluggable handlers
//! - [`server`]: the facade composing everything, with activity counters
//! - [`config`]: server configuration
//! - [`error`]: typed errors
//!
//! # Example
//!
//! ```no_run
//! use portside::config::ServerConfig;
//! use portside::server::Server;
//!
//! let mut server = Server::new(ServerConfig::new().with_port(9000));
//! server.start().expect("server start");
//! // ... serve until told otherwise ...
//! server.stop();
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod acceptor;
pub mod config;
pub mod error;
pub mod ops;
pub mod port;
pub mod server;
pub mod session;
pub mod test_utils;
pub mod worker;

// Re-exports for convenient access to core types
pub use acceptor::{AcceptCallback, Acceptor, AcceptorState};
pub use config::ServerConfig;
pub use error::{Error, ErrorKind, Result};
pub use ops::{
    CompletionResult, OperationContext, OperationKind, OwnerRef, MAX_BUFFER_SIZE, OP_ABORTED,
    SHUTDOWN_KEY,
};
pub use port::{CompletionPort, Handle, PortHandle};
pub use server::{Server, ServerStats};
pub use session::{EchoHandler, Session, SessionHandler, SessionRegistry, SessionState};
pub use worker::WorkerPool;
