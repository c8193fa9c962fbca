//! Engine lifecycle state.
//!
//! ```text
//! Stopped → Starting → Running → Stopping → Stopped
//!              └── bind failure ──────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl From<u8> for EngineState {
    fn from(val: u8) -> Self {
        match val {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            _ => EngineState::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Atomic holder of the current [`EngineState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(EngineState::Stopped as u8))
    }

    pub(crate) fn load(&self) -> EngineState {
        EngineState::from(self.0.load(Ordering::Acquire))
    }

    /// Move `from → to`. On failure returns the state actually found.
    pub(crate) fn transition(&self, from: EngineState, to: EngineState) -> Result<(), EngineState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(EngineState::from)
    }

    pub(crate) fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_follow_expected_state() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), EngineState::Stopped);
        assert!(cell.transition(EngineState::Stopped, EngineState::Starting).is_ok());
        assert_eq!(
            cell.transition(EngineState::Stopped, EngineState::Starting),
            Err(EngineState::Starting)
        );
        cell.set(EngineState::Running);
        assert_eq!(cell.load().to_string(), "running");
    }
}
