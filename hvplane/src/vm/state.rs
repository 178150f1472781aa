//! Guest lifecycle states and transition guards.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a guest as last confirmed by the host.
///
/// State machine:
///
/// ```text
/// Undefined --define--> Defined --start--> Running --suspend--> Suspended
///     ^                   ^  |                |  ^                  |
///     |                   |  +--undefine--+   |  +------resume------+
///     |                   +---shutdown--------+
///     +------------------------- undefine (from any state) ---------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// No guest object exists on the host.
    Undefined,
    /// Registered with the host, powered off.
    Defined,
    Running,
    Suspended,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Undefined => "Undefined",
            LifecycleState::Defined => "Defined",
            LifecycleState::Running => "Running",
            LifecycleState::Suspended => "Suspended",
        }
    }

    /// Whether a power-on may be issued from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, LifecycleState::Defined | LifecycleState::Suspended)
    }

    /// Guests that accept in-guest commands, reset, reboot, suspend and shutdown.
    pub fn is_running(&self) -> bool {
        matches!(self, LifecycleState::Running)
    }

    /// Device attachment edits the configuration of a powered-off guest only.
    pub fn can_attach(&self) -> bool {
        matches!(self, LifecycleState::Defined)
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, LifecycleState::Undefined)
    }

    /// Map the host's power-state report onto a lifecycle state.
    ///
    /// The host prints a banner line followed by `Powered on`, `Powered off`
    /// or `Suspended`.
    pub fn from_power_report(report: &str) -> Option<Self> {
        let line = report.lines().rev().find(|l| !l.trim().is_empty())?;
        let line = line.trim().to_ascii_lowercase();
        if line.contains("suspended") {
            Some(LifecycleState::Suspended)
        } else if line.contains("off") {
            Some(LifecycleState::Defined)
        } else if line.contains("on") {
            Some(LifecycleState::Running)
        } else {
            None
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
