//! Scan controller states.
//!
//! # State Machine
//!
//! ```text
//!            start                 ready
//!   Idle ───────────> Starting ───────────> Running ──final, exit ok──> Idle
//!    ▲ │                                    │  │  │
//!    │ │ resume(k)          pause/continue  │  │  │ stash
//!    │ └──> Resuming ──ready──> Running <───┘  │  └──────> Stashing ──final──> Idle
//!    │                            ▲            │ unlock / overrun / settle timeout
//!    │                            └─continue── Interrupted
//!    │
//!    └──────────────────────────── Stopping <── stop / abort (any state)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of the scan controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// No scan in flight.
    #[default]
    Idle,
    /// Hardware is being prepared or the first point is settling.
    Starting,
    /// Points are being acquired.
    Running,
    /// Acquisition halted by the user; the scan keeps its index.
    Paused,
    /// Finalizing traces.
    Stopping,
    /// Halted by an interlock or an error; see the interrupt reason.
    Interrupted,
    /// Waiting for the interrupt exit before moving the scan to the stash.
    Stashing,
    /// A stashed scan is being revived.
    Resuming,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "idle",
            ScanState::Starting => "starting",
            ScanState::Running => "running",
            ScanState::Paused => "paused",
            ScanState::Stopping => "stopping",
            ScanState::Interrupted => "interrupted",
            ScanState::Stashing => "stashing",
            ScanState::Resuming => "resuming",
        };
        f.write_str(name)
    }
}

impl ScanState {
    /// Whether a new scan may be started.
    pub fn can_start(&self) -> bool {
        matches!(self, ScanState::Idle)
    }

    /// Whether the scan may be paused.
    pub fn can_pause(&self) -> bool {
        matches!(self, ScanState::Running)
    }

    /// Whether a halted scan may continue.
    pub fn can_continue(&self) -> bool {
        matches!(self, ScanState::Paused | ScanState::Interrupted)
    }

    /// Whether the scan may be stashed.
    pub fn can_stash(&self) -> bool {
        matches!(self, ScanState::Running)
    }

    /// Whether a graceful stop is possible.
    pub fn can_stop(&self) -> bool {
        !matches!(self, ScanState::Idle | ScanState::Stopping)
    }

    /// Whether incoming packets belong to the active scan.
    pub fn accepts_packets(&self) -> bool {
        matches!(self, ScanState::Running | ScanState::Stashing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase() {
        assert_eq!(ScanState::Interrupted.to_string(), "interrupted");
        assert_eq!(ScanState::default(), ScanState::Idle);
    }

    #[test]
    fn command_guards() {
        assert!(ScanState::Idle.can_start());
        assert!(!ScanState::Running.can_start());
        assert!(ScanState::Running.can_pause() && ScanState::Running.can_stash());
        assert!(ScanState::Paused.can_continue() && ScanState::Interrupted.can_continue());
        assert!(!ScanState::Idle.can_stop());
        assert!(ScanState::Stashing.accepts_packets());
        assert!(!ScanState::Paused.accepts_packets());
    }
}
