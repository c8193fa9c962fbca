//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP / Unix connection
//!     → listener.rs (accept loop, connection limit)
//!     → connection.rs (connection ID, in-flight tracking)
//!     → Hand off to the transport (HTTP or FastCGI)
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each connection is tracked so stop can drain before returning
//! - Both transports share the same listener, so either may use a Unix socket

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{BoundAddr, Listener, ListenerError, Peer, Stream};
