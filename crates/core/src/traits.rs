//! Timer service abstraction consumed by the fail-safe.

use crate::{FailSafeCleanup, RollbackPlan};
use commission_types::{TimerHandle, TimerKind};
use std::time::Duration;
use thiserror::Error;

/// Errors a timer service can report when scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// No timer slot is available.
    #[error("Timer capacity exhausted ({capacity} timers outstanding)")]
    Exhausted { capacity: usize },

    /// The runtime that would deliver the firing has shut down.
    #[error("Timer runtime has shut down")]
    RuntimeShutdown,
}

/// One-shot timers delivered back onto the owning event context.
///
/// Implementations never invoke the state machine directly. When a timer
/// fires, the runner delivers `Event::TimerFired(handle)` through its normal
/// event path, so firings are serialized with every other event.
///
/// # Example
///
/// ```ignore
/// let handle = timers.schedule(TimerKind::FailSafeStep, Duration::from_secs(60))?;
/// // ... later, the runner hands the context Event::TimerFired(handle)
/// timers.cancel(handle); // no-op if it already fired
/// ```
pub trait TimerService {
    /// Schedule a one-shot timer.
    ///
    /// # Guarantees
    ///
    /// - **Atomic**: on error nothing was scheduled and no existing timer was
    ///   touched
    /// - **Unique**: every successful call returns a handle never issued before
    ///
    /// # Errors
    ///
    /// [`TimerError::Exhausted`] when the service has no capacity left.
    fn schedule(&mut self, kind: TimerKind, duration: Duration)
        -> Result<TimerHandle, TimerError>;

    /// Cancel a scheduled timer.
    ///
    /// Idempotent: canceling a timer that already fired or was already
    /// canceled does nothing.
    fn cancel(&mut self, handle: TimerHandle);
}

/// External rollback logic run when a fail-safe window expires.
///
/// Called by the runner for every `Action::RollbackFailSafe`, on the owning
/// context, before the matching `Event::CleanupCompleted` is processed.
/// Implementations own their failure handling: the fail-safe resets once
/// every collaborator has returned, whatever they managed to undo.
pub trait FailSafeRollback {
    /// Undo whatever the expired window installed.
    fn rollback(&mut self, cleanup: &FailSafeCleanup, plan: &RollbackPlan);
}
