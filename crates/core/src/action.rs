//! Outbound actions requested by the fail-safe.

use crate::{Event, FailSafeCleanup};

/// Side effects the runner must perform after a fail-safe transition.
///
/// The state machine never performs these itself. In particular it stays
/// passive while `Busy`: all rollback happens in collaborators reacting to
/// [`Action::RollbackFailSafe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The armed flag changed.
    ///
    /// Power-management collaborators use this to keep the device reachable
    /// while a provisioning window is open.
    ArmedStateChanged { armed: bool },

    /// Roll back the partial provisioning recorded in the snapshot.
    RollbackFailSafe(FailSafeCleanup),

    /// Queue an event for later processing on the owning context.
    ///
    /// The event must run after every action preceding it in the same batch.
    EnqueueInternal { event: Event },
}

impl Action {
    /// Get a human-readable name for this action type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::ArmedStateChanged { .. } => "ArmedStateChanged",
            Action::RollbackFailSafe(_) => "RollbackFailSafe",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
        }
    }
}
