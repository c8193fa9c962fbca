//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP, SIGUSR2)
//! - Translate signals to [`ControlEvent`]s for the runner loop
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP reloads configuration, SIGUSR2 restarts, neither stops

use tokio::signal::unix::{signal, Signal, SignalKind};

/// What the runner should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Re-read configuration and reconfigure in place.
    Reload,
    /// Stop and start again, rebinding the socket.
    Restart,
    /// Stop for good.
    Stop,
}

/// Registered signal streams.
pub struct Signals {
    hangup: Signal,
    user2: Signal,
    interrupt: Signal,
    terminate: Signal,
}

impl Signals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            user2: signal(SignalKind::user_defined2())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal of interest.
    pub async fn recv(&mut self) -> ControlEvent {
        tokio::select! {
            _ = self.hangup.recv() => {
                tracing::info!("SIGHUP received, reloading configuration");
                ControlEvent::Reload
            }
            _ = self.user2.recv() => {
                tracing::info!("SIGUSR2 received, restarting");
                ControlEvent::Restart
            }
            _ = self.interrupt.recv() => {
                tracing::info!("SIGINT received, stopping");
                ControlEvent::Stop
            }
            _ = self.terminate.recv() => {
                tracing::info!("SIGTERM received, stopping");
                ControlEvent::Stop
            }
        }
    }
}
