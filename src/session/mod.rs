//! Session subsystem.
//!
//! # Data Flow
//! ```text
//! request cookie (SESSION=<id>)
//!     → Session::start (per-request handle)
//!     → SessionStore::acquire (lookup, expiry + IP checks, or create)
//!     → SessionSlot (values behind a per-ID mutex)
//!
//! response head flush
//!     → Set-Cookie carries the ID
//!     → slot marked established
//!
//! sweeper task (every sweep_interval)
//!     → spawn_blocking(SessionStore::sweep)
//!     → idle slots invalidated and removed
//! ```
//!
//! # Design Decisions
//! - Sessions are created lazily by the first write; reads only attach to a presented ID
//! - Every failure to resolve a presented ID ends in a fresh session, never an error page
//! - Connections hold weak references so eviction is never blocked by a finished request

pub mod handle;
pub mod id;
pub mod store;
pub mod value;

use std::time::Duration;

use thiserror::Error;

pub use handle::Session;
pub use store::{SessionStats, SessionStore};
pub use value::{FromSessionValue, SessionValue, ValueKind};

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Another request held the session longer than the lock timeout.
    #[error("timed out after {0:?} waiting for session lock")]
    LockTimeout(Duration),

    /// The stored value has a different kind than the one requested.
    #[error("session key {key:?} holds a {found} value, not {expected}")]
    TypeMismatch {
        key: String,
        expected: ValueKind,
        found: ValueKind,
    },
}
