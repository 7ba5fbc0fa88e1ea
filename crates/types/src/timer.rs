//! Timer identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The timers owned by the fail-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimerKind {
    /// Per-step fail-safe timer, restarted by every arm.
    FailSafeStep,

    /// Ceiling on total armed time across re-arms of one provisioning attempt.
    FailSafeCumulative,
}

impl TimerKind {
    /// Get a human-readable name for this timer.
    pub fn name(&self) -> &'static str {
        match self {
            TimerKind::FailSafeStep => "FailSafeStep",
            TimerKind::FailSafeCumulative => "FailSafeCumulative",
        }
    }
}

/// Handle to one scheduled timer.
///
/// Issued by a timer service when a timer is scheduled. The sequence number
/// is unique per service instance, so a handle names exactly one scheduling:
/// a firing that carries an old handle after the timer was canceled or
/// replaced can be recognized as stale and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerHandle {
    /// Which timer this is.
    pub kind: TimerKind,
    /// Unique scheduling sequence number.
    pub seq: u64,
}

impl TimerHandle {
    /// Create a new handle.
    pub fn new(kind: TimerKind, seq: u64) -> Self {
        Self { kind, seq }
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.name(), self.seq)
    }
}
