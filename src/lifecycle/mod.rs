//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     RequestHandler::stop → trigger → accept loops and sweeper exit
//!                          → connections drain → workers join
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → ControlEvent::Stop
//!     SIGHUP         → ControlEvent::Reload (reconfigure)
//!     SIGUSR2        → ControlEvent::Restart
//! ```
//!
//! # Design Decisions
//! - One Shutdown per engine run, so restart starts from a fresh channel
//! - Stop has a deadline in the runner: forced exit after termination_timeout

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{ControlEvent, Signals};
