//! Inbound events delivered to the fail-safe.

use commission_types::TimerHandle;

/// Events processed on the context that owns the fail-safe.
///
/// Events are produced by the runner (timer firings) or by the state machine
/// itself via `Action::EnqueueInternal` (deferred work). Command handling is
/// not an event: arm, disarm and the latch setters are direct calls on the
/// context because their callers need a synchronous answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A scheduled timer elapsed.
    TimerFired(TimerHandle),

    /// Rollback work for an expired window has finished; reset the fail-safe.
    ///
    /// Always enqueued by the state machine behind its own rollback action,
    /// never produced independently.
    CleanupCompleted,
}

impl Event {
    /// Get a human-readable name for this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::TimerFired(_) => "TimerFired",
            Event::CleanupCompleted => "CleanupCompleted",
        }
    }
}
