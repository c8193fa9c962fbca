//! Concurrent request engine library.
//!
//! Transports (HTTP, FastCGI) feed a fixed worker pool; each request runs
//! the access filters and the application handler against one immutable
//! configuration snapshot, with server-side sessions.

pub mod config;
pub mod connection;
pub mod engine;
pub mod filter;
pub mod handler;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod session;
pub mod transport;

pub use config::schema::EngineConfig;
pub use connection::Connection;
pub use engine::{EngineError, EngineState, RequestHandler};
pub use filter::{AccessFilter, AccessFilterList, PredicateRegistry};
pub use handler::{handler_ref, Handler, HandlerRef, HandlerResult};
pub use lifecycle::Shutdown;
